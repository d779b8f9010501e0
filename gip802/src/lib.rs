//! # Gip802 - Link layer support for the GIP wireless dongle
//!
//! The Xbox wireless dongle carries GIP traffic inside IEEE 802.11 frames,
//! which in turn ride on the MT76 chipset's USB DMA message format. This
//! crate implements both wrappers:
//!
//! - `frame`: 802.11 frame-control handling, the 3-address management header
//!   and the QoS data header used for GIP payloads
//! - `mt76`: the MT76 command/packet DMA headers, TXWI/RXWI descriptors and
//!   firmware event codes

pub mod error;
pub mod frame;
pub mod mt76;

pub use error::{Gip802Error, Result};
pub use frame::{FrameKind, Header3Addr, QosHeader};
pub use mt76::{DmaPort, FirmwareEvent, RadioLedMode, RxInfo, Rxwi, Txwi};

/// Length of a MAC address in bytes
pub const MAC_LEN: usize = 6;

/// 802.11 frame subtype reserved for vendor management traffic
pub const STYPE_RESERVED: u16 = 0x0070;
