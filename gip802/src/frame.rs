//! IEEE 802.11 frame handling for the dongle data path
//!
//! Only the small subset of 802.11 the dongle firmware actually exchanges is
//! modelled here: the 3-address management header, the QoS data header that
//! wraps GIP payloads, and frame-control classification.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{Gip802Error, Result, MAC_LEN, STYPE_RESERVED};

/// Frame-control type field (bits 2..3)
pub const FCTL_FTYPE: u16 = 0x000c;
/// Frame-control subtype field (bits 4..7)
pub const FCTL_STYPE: u16 = 0x00f0;
/// Frame sent from the distribution system (AP to station)
pub const FCTL_FROM_DS: u16 = 0x0200;
/// Frame body is encrypted
pub const FCTL_PROTECTED: u16 = 0x4000;

pub const FTYPE_MGMT: u16 = 0x0000;
pub const FTYPE_DATA: u16 = 0x0008;

pub const STYPE_ASSOC_REQ: u16 = 0x0000;
pub const STYPE_ASSOC_RESP: u16 = 0x0010;
pub const STYPE_DISASSOC: u16 = 0x00a0;
pub const STYPE_QOS_DATA: u16 = 0x0080;

/// Transmit duration the dongle stamps on QoS data frames (microseconds)
pub const QOS_DURATION_US: u16 = 144;

/// Classification of the frames the dongle reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// QoS data frame carrying a GIP payload
    QosData,
    /// Management: association request from an accessory
    AssocReq,
    /// Management: disassociation notice
    Disassoc,
    /// Management frame with the vendor-reserved subtype (pairing traffic)
    Reserved,
    /// Anything else; ignored by the dongle
    Other,
}

/// Classify a frame-control word into the kinds the dongle dispatches on
pub fn classify(frame_control: u16) -> FrameKind {
    match frame_control & (FCTL_FTYPE | FCTL_STYPE) {
        fc if fc == FTYPE_DATA | STYPE_QOS_DATA => FrameKind::QosData,
        fc if fc == FTYPE_MGMT | STYPE_ASSOC_REQ => FrameKind::AssocReq,
        fc if fc == FTYPE_MGMT | STYPE_DISASSOC => FrameKind::Disassoc,
        fc if fc == FTYPE_MGMT | STYPE_RESERVED => FrameKind::Reserved,
        _ => FrameKind::Other,
    }
}

/// 3-address 802.11 header (management and non-QoS data frames)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header3Addr {
    pub frame_control: u16,
    pub duration: u16,
    /// Receiver address
    pub addr1: [u8; MAC_LEN],
    /// Transmitter address
    pub addr2: [u8; MAC_LEN],
    /// BSSID
    pub addr3: [u8; MAC_LEN],
    pub seq_ctrl: u16,
}

impl Header3Addr {
    /// Encoded size in bytes
    pub const LEN: usize = 24;

    /// Parse a header from the start of a frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Gip802Error::Truncated {
                need: Self::LEN,
                have: data.len(),
            });
        }

        let mut buf = data;
        let frame_control = buf.get_u16_le();
        let duration = buf.get_u16_le();
        let mut addr1 = [0u8; MAC_LEN];
        let mut addr2 = [0u8; MAC_LEN];
        let mut addr3 = [0u8; MAC_LEN];
        buf.copy_to_slice(&mut addr1);
        buf.copy_to_slice(&mut addr2);
        buf.copy_to_slice(&mut addr3);
        let seq_ctrl = buf.get_u16_le();

        Ok(Self {
            frame_control,
            duration,
            addr1,
            addr2,
            addr3,
            seq_ctrl,
        })
    }

    /// Serialize the header into a buffer
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.frame_control);
        buf.put_u16_le(self.duration);
        buf.put_slice(&self.addr1);
        buf.put_slice(&self.addr2);
        buf.put_slice(&self.addr3);
        buf.put_u16_le(self.seq_ctrl);
    }

    /// Frame kind of this header
    pub fn kind(&self) -> FrameKind {
        classify(self.frame_control)
    }
}

/// QoS data header: the 3-address header plus the QoS control word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosHeader {
    pub hdr: Header3Addr,
    pub qos_ctrl: u16,
}

impl QosHeader {
    /// Encoded size in bytes
    pub const LEN: usize = Header3Addr::LEN + 2;

    /// Build the downlink header the dongle stamps on outbound GIP frames.
    ///
    /// The frame is sent from the AP side (From-DS), destination is the
    /// accessory, source and BSSID are the dongle itself.
    pub fn downlink(dest: [u8; MAC_LEN], dongle: [u8; MAC_LEN], protected: bool) -> Self {
        let mut frame_control = FTYPE_DATA | STYPE_QOS_DATA | FCTL_FROM_DS;
        if protected {
            frame_control |= FCTL_PROTECTED;
        }

        Self {
            hdr: Header3Addr {
                frame_control,
                duration: QOS_DURATION_US,
                addr1: dest,
                addr2: dongle,
                addr3: dongle,
                seq_ctrl: 0,
            },
            qos_ctrl: 0,
        }
    }

    /// Parse a QoS data header from the start of a frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Gip802Error::Truncated {
                need: Self::LEN,
                have: data.len(),
            });
        }

        let hdr = Header3Addr::parse(data)?;
        let qos_ctrl = u16::from_le_bytes([data[Self::LEN - 2], data[Self::LEN - 1]]);

        Ok(Self { hdr, qos_ctrl })
    }

    /// Serialize the header into a buffer
    pub fn put(&self, buf: &mut impl BufMut) {
        self.hdr.put(buf);
        buf.put_u16_le(self.qos_ctrl);
    }
}
