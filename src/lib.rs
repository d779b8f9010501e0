//! # GIP Rust Implementation
//!
//! This is a Rust implementation of the host side of the Game Input Protocol
//! (GIP), the packetised wire format spoken by Xbox One and Xbox Series
//! accessories over USB and over the proprietary wireless dongle link.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `packet`: GIP header encoding and decoding
//! - `framing`: sequencing, acknowledgement and chunk reassembly
//! - `bus`: adapters, clients and driver matching
//! - `messages`: typed internal protocol messages
//! - `auth`: per-client authentication handshake
//! - `crypto`: handshake primitives (PRF, transcript, RSA, ECDH)
//! - `audio`: audio format negotiation and sample transport
//! - `dongle`: wireless dongle client multiplexer

pub mod audio;
pub mod auth;
pub mod bus;
pub mod crypto;
pub mod dongle;
pub mod framing;
pub mod messages;
pub mod packet;

// Re-export commonly used types
pub use crate::audio::{AudioConfig, AudioRing};
pub use crate::bus::{
    ClientState, GipAdapter, GipAdapterOps, GipBuffer, GipBufferKind, GipClient, GipClientInfo,
    GipDriver, GipHardware, GipVersion,
};
pub use crate::dongle::{GipDongle, RadioMac};
pub use crate::messages::{BatteryLevel, BatteryType, LedMode, PowerMode};
pub use crate::packet::GipHeader;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GipError {
    #[error("malformed packet header")]
    MalformedHeader,

    #[error("packet body shorter than declared length")]
    ShortBody,

    #[error("chunk exceeds declared transfer length")]
    ChunkOverflow,

    #[error("malformed identify payload: {0}")]
    MalformedIdentify(String),

    #[error("no public key found in client certificate")]
    AuthNoKey,

    #[error("handshake transcript mismatch")]
    AuthTranscriptMismatch,

    #[error("authentication protocol error: {0}")]
    AuthProtocolError(String),

    #[error("unsupported audio format: {0:#04x}")]
    AudioUnsupportedFormat(u8),

    #[error("no transmit buffer available")]
    NoTxBuffer,

    #[error("no free wireless client id")]
    NoWcid,

    #[error("peer reported error: {0:#04x}")]
    PeerError(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation not supported by transport")]
    Unsupported,
}

impl From<gip802::Gip802Error> for GipError {
    fn from(err: gip802::Gip802Error) -> Self {
        match err {
            gip802::Gip802Error::Io(err) => Self::Io(err),
            _ => Self::MalformedHeader,
        }
    }
}

pub type Result<T> = std::result::Result<T, GipError>;

// Constants
/// Number of client slots on a single adapter
pub const GIP_MAX_CLIENTS: usize = 16;

/// Time between audio packets in milliseconds
pub const GIP_AUDIO_INTERVAL_MS: u64 = 8;

/// Largest payload that fits in a single unchunked packet
pub const GIP_MAX_SIMPLE_PAYLOAD: usize = 58;

/// Largest total length of a chunked transfer
pub const GIP_MAX_CHUNK_TOTAL: usize = u16::MAX as usize;

// Utility functions
pub fn init_logging() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(GIP_MAX_CLIENTS, 16);
        assert_eq!(GIP_AUDIO_INTERVAL_MS, 8);
        assert_eq!(GIP_MAX_SIMPLE_PAYLOAD, 58);
    }
}
