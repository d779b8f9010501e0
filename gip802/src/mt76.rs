//! MT76 USB DMA message format and transmit/receive descriptors
//!
//! Every transfer on the dongle's bulk endpoints is wrapped in a 4-byte DMA
//! info word plus a 4-byte zero trailer, with the body padded to a 32-bit
//! boundary. WLAN transmit payloads additionally carry a TXWI descriptor;
//! received WLAN frames arrive behind an RXWI descriptor.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{Gip802Error, Result};

/// Length of the DMA info word (and of the zero trailer)
pub const CMD_HDR_LEN: usize = 4;

// Transmit info word fields
const TXD_INFO_LEN: u32 = 0x0000_ffff;
const MCU_MSG_CMD_TYPE_SHIFT: u32 = 20;
const MCU_MSG_PORT_SHIFT: u32 = 27;
const MCU_MSG_TYPE_CMD: u32 = 1 << 30;

// Receive info word fields
const RX_FCE_INFO_CMD_SEQ_SHIFT: u32 = 16;
const RX_FCE_INFO_CMD_SEQ_MASK: u32 = 0x000f;
const RX_FCE_INFO_EVT_TYPE_SHIFT: u32 = 20;
const RX_FCE_INFO_EVT_TYPE_MASK: u32 = 0x000f;
const RX_FCE_INFO_D_PORT_SHIFT: u32 = 27;
const RX_FCE_INFO_D_PORT_MASK: u32 = 0x0007;

/// DMA ports used by the dongle firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DmaPort {
    Wlan = 0,
    CpuRx = 1,
    CpuTx = 2,
    Host = 3,
    Discard = 6,
    Unknown = 7,
}

impl From<u32> for DmaPort {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Wlan,
            1 => Self::CpuRx,
            2 => Self::CpuTx,
            3 => Self::Host,
            6 => Self::Discard,
            _ => Self::Unknown,
        }
    }
}

/// Events the dongle firmware pushes over the command endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareEvent {
    /// Pairing button pressed on the dongle
    Button,
    /// Channel scan results
    Channels,
    /// 802.11 frame delivered on the command endpoint
    PacketRx,
    /// Firmware coredump fragment
    Coredump,
    /// Accessory stopped responding to keep-alives
    ClientLost,
    Unknown(u8),
}

impl From<u32> for FirmwareEvent {
    fn from(value: u32) -> Self {
        match value {
            0x04 => Self::Button,
            0x0a => Self::Channels,
            0x0c => Self::PacketRx,
            0x0d => Self::Coredump,
            0x0e => Self::ClientLost,
            other => Self::Unknown(other as u8),
        }
    }
}

/// LED modes understood by the dongle firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RadioLedMode {
    Blink = 0x00,
    On = 0x01,
    Off = 0x02,
}

/// Parsed DMA info word of a received message
#[derive(Debug, Clone, Copy)]
pub struct RxInfo(pub u32);

impl RxInfo {
    /// Compose an info word, the inverse of the accessors below
    pub fn compose(port: DmaPort, cmd_seq: u32, event_code: u32) -> Self {
        Self(
            ((port as u32) << RX_FCE_INFO_D_PORT_SHIFT)
                | ((cmd_seq & RX_FCE_INFO_CMD_SEQ_MASK) << RX_FCE_INFO_CMD_SEQ_SHIFT)
                | ((event_code & RX_FCE_INFO_EVT_TYPE_MASK) << RX_FCE_INFO_EVT_TYPE_SHIFT),
        )
    }

    pub fn port(&self) -> DmaPort {
        DmaPort::from((self.0 >> RX_FCE_INFO_D_PORT_SHIFT) & RX_FCE_INFO_D_PORT_MASK)
    }

    pub fn cmd_seq(&self) -> u32 {
        (self.0 >> RX_FCE_INFO_CMD_SEQ_SHIFT) & RX_FCE_INFO_CMD_SEQ_MASK
    }

    pub fn event(&self) -> FirmwareEvent {
        FirmwareEvent::from((self.0 >> RX_FCE_INFO_EVT_TYPE_SHIFT) & RX_FCE_INFO_EVT_TYPE_MASK)
    }
}

/// Wrap a message body for the bulk-out endpoint.
///
/// The body is padded up to a 32-bit boundary and followed by a 4-byte zero
/// trailer; the info word carries the padded length.
pub fn wrap_message(body: &[u8], info: u32) -> Vec<u8> {
    let padded = (body.len() + 3) & !3;
    let mut out = Vec::with_capacity(CMD_HDR_LEN + padded + CMD_HDR_LEN);

    out.put_u32_le(info | (padded as u32 & TXD_INFO_LEN));
    out.put_slice(body);
    out.resize(CMD_HDR_LEN + padded + CMD_HDR_LEN, 0);

    out
}

/// Wrap a command for the firmware's CPU TX port
pub fn wrap_command(body: &[u8], cmd: u8) -> Vec<u8> {
    wrap_message(
        body,
        MCU_MSG_TYPE_CMD
            | ((DmaPort::CpuTx as u32) << MCU_MSG_PORT_SHIFT)
            | ((cmd as u32) << MCU_MSG_CMD_TYPE_SHIFT),
    )
}

/// Unwrap a received DMA message into its info word and body.
///
/// Strips the info word and the trailer; the body keeps any alignment padding
/// since descriptor parsers carry their own length fields.
pub fn unwrap_message(data: &[u8]) -> Result<(RxInfo, &[u8])> {
    if data.len() < CMD_HDR_LEN * 2 {
        return Err(Gip802Error::Truncated {
            need: CMD_HDR_LEN * 2,
            have: data.len(),
        });
    }

    let info = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let body = &data[CMD_HDR_LEN..data.len() - CMD_HDR_LEN];

    Ok((RxInfo(info), body))
}

// TXWI field values
const TXWI_FLAGS_MPDU_DENSITY_SHIFT: u16 = 10;
/// 4 microsecond minimum MPDU start spacing
const MPDU_DENSITY_4US: u16 = 5;
const RXWI_RATE_PHY_SHIFT: u16 = 13;
const PHY_TYPE_OFDM: u16 = 1;
const TXWI_ACK_CTL_REQ: u8 = 0x01;

/// Transmit descriptor prepended to outbound WLAN payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Txwi {
    pub flags: u16,
    pub rate: u16,
    pub ack_ctl: u8,
    pub wcid: u8,
    pub len_ctl: u16,
    pub iv: u32,
    pub eiv: u32,
    pub aid: u8,
    pub txstream: u8,
    pub ctl: u16,
}

impl Txwi {
    /// Encoded size in bytes
    pub const LEN: usize = 20;

    /// Descriptor for a downlink GIP frame of `len` bytes (802.11 header
    /// included), requesting link-level acknowledgment.
    pub fn downlink(len: u16) -> Self {
        Self {
            flags: MPDU_DENSITY_4US << TXWI_FLAGS_MPDU_DENSITY_SHIFT,
            rate: PHY_TYPE_OFDM << RXWI_RATE_PHY_SHIFT,
            ack_ctl: TXWI_ACK_CTL_REQ,
            len_ctl: len,
            ..Self::default()
        }
    }

    /// Serialize the descriptor into a buffer
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.rate);
        buf.put_u8(self.ack_ctl);
        buf.put_u8(self.wcid);
        buf.put_u16_le(self.len_ctl);
        buf.put_u32_le(self.iv);
        buf.put_u32_le(self.eiv);
        buf.put_u8(self.aid);
        buf.put_u8(self.txstream);
        buf.put_u16_le(self.ctl);
    }
}

// RXWI field values
const RXINFO_L2PAD: u32 = 1 << 11;
const RXWI_CTL_MPDU_LEN: u32 = 0x0000_3fff;
const RXWI_CTL_WCID_SHIFT: u32 = 16;
const RXWI_CTL_WCID_MASK: u32 = 0x00ff;

/// Receive descriptor in front of inbound WLAN frames
#[derive(Debug, Clone, Copy, Default)]
pub struct Rxwi {
    pub rxinfo: u32,
    pub ctl: u32,
    pub tid_sn: u16,
    pub rate: u16,
    pub rssi: [u8; 4],
    pub bbp_rssi: u32,
}

impl Rxwi {
    /// Encoded size in bytes
    pub const LEN: usize = 20;

    /// Parse a descriptor from the start of a WLAN message body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Gip802Error::Truncated {
                need: Self::LEN,
                have: data.len(),
            });
        }

        let mut buf = data;
        let rxinfo = buf.get_u32_le();
        let ctl = buf.get_u32_le();
        let tid_sn = buf.get_u16_le();
        let rate = buf.get_u16_le();
        let mut rssi = [0u8; 4];
        buf.copy_to_slice(&mut rssi);
        let bbp_rssi = buf.get_u32_le();

        Ok(Self {
            rxinfo,
            ctl,
            tid_sn,
            rate,
            rssi,
            bbp_rssi,
        })
    }

    /// Serialize the descriptor into a buffer
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.rxinfo);
        buf.put_u32_le(self.ctl);
        buf.put_u16_le(self.tid_sn);
        buf.put_u16_le(self.rate);
        buf.put_slice(&self.rssi);
        buf.put_u32_le(self.bbp_rssi);
    }

    /// Length of the MPDU following the descriptor
    pub fn mpdu_len(&self) -> usize {
        (self.ctl & RXWI_CTL_MPDU_LEN) as usize
    }

    /// Wireless client id the frame was received from (0 = unassociated)
    pub fn wcid(&self) -> u8 {
        ((self.ctl >> RXWI_CTL_WCID_SHIFT) & RXWI_CTL_WCID_MASK) as u8
    }

    /// Whether 2 bytes of padding follow the 802.11 header
    pub fn l2pad(&self) -> bool {
        self.rxinfo & RXINFO_L2PAD != 0
    }

    /// Build a descriptor for a frame of `mpdu_len` bytes from `wcid`
    pub fn received(wcid: u8, mpdu_len: usize) -> Self {
        Self {
            ctl: (mpdu_len as u32 & RXWI_CTL_MPDU_LEN)
                | (((wcid as u32) & RXWI_CTL_WCID_MASK) << RXWI_CTL_WCID_SHIFT),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_message_pads_and_trails() {
        let wrapped = wrap_message(&[1, 2, 3, 4, 5], 0);

        // 4-byte header + body padded to 8 + 4-byte trailer
        assert_eq!(wrapped.len(), 16);
        assert_eq!(u32::from_le_bytes([wrapped[0], wrapped[1], wrapped[2], wrapped[3]]) & 0xffff, 8);
        assert_eq!(&wrapped[4..9], &[1, 2, 3, 4, 5]);
        assert!(wrapped[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_command_roundtrip() {
        let wrapped = wrap_command(&[0xaa; 12], 0);
        let (info, body) = unwrap_message(&wrapped).unwrap();

        assert_eq!(info.port(), DmaPort::CpuTx);
        assert_eq!(&body[..12], &[0xaa; 12]);
    }

    #[test]
    fn test_event_decoding() {
        let info = RxInfo((0x04 << RX_FCE_INFO_EVT_TYPE_SHIFT) | (1 << RX_FCE_INFO_D_PORT_SHIFT));
        assert_eq!(info.port(), DmaPort::CpuRx);
        assert_eq!(info.event(), FirmwareEvent::Button);

        let info = RxInfo(0x0e << RX_FCE_INFO_EVT_TYPE_SHIFT);
        assert_eq!(info.event(), FirmwareEvent::ClientLost);
    }

    #[test]
    fn test_unwrap_too_short() {
        assert!(unwrap_message(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_txwi_layout() {
        let txwi = Txwi::downlink(0x0123);
        let mut buf = Vec::new();
        txwi.put(&mut buf);

        assert_eq!(buf.len(), Txwi::LEN);
        assert_eq!(buf[4], TXWI_ACK_CTL_REQ);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 0x0123);
    }

    #[test]
    fn test_rxwi_roundtrip() {
        let rxwi = Rxwi::received(3, 200);
        let mut buf = Vec::new();
        rxwi.put(&mut buf);
        buf.extend_from_slice(&[0u8; 200]);

        let parsed = Rxwi::parse(&buf).unwrap();
        assert_eq!(parsed.mpdu_len(), 200);
        assert_eq!(parsed.wcid(), 3);
        assert!(!parsed.l2pad());
    }
}
