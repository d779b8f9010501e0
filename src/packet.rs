//! GIP packet header encoding and decoding
//!
//! Every GIP packet starts with a three byte fixed header (command, options,
//! sequence) followed by a varint packet length and, for chunked packets, a
//! varint chunk offset. Encoded headers always have even length; an odd
//! header is padded by marking the final varint byte as continued and
//! appending a zero byte.

use serde::{Deserialize, Serialize};

use crate::{GipError, Result};

// Internal command codes
pub const GIP_CMD_ACKNOWLEDGE: u8 = 0x01;
pub const GIP_CMD_ANNOUNCE: u8 = 0x02;
pub const GIP_CMD_STATUS: u8 = 0x03;
pub const GIP_CMD_IDENTIFY: u8 = 0x04;
pub const GIP_CMD_POWER: u8 = 0x05;
pub const GIP_CMD_AUTHENTICATE: u8 = 0x06;
pub const GIP_CMD_VIRTUAL_KEY: u8 = 0x07;
pub const GIP_CMD_AUDIO_CONTROL: u8 = 0x08;
pub const GIP_CMD_LED: u8 = 0x0a;
pub const GIP_CMD_HID_REPORT: u8 = 0x0b;
pub const GIP_CMD_AUDIO_SAMPLES: u8 = 0x60;

// External command codes
pub const GIP_CMD_RUMBLE: u8 = 0x09;
pub const GIP_CMD_INPUT: u8 = 0x20;

// Option flags (upper nibble of the options byte)
pub const GIP_OPT_ACKNOWLEDGE: u8 = 0x10;
pub const GIP_OPT_INTERNAL: u8 = 0x20;
pub const GIP_OPT_CHUNK_START: u8 = 0x40;
pub const GIP_OPT_CHUNK: u8 = 0x80;

/// Client id field (lower nibble of the options byte)
const GIP_OPT_CLIENT_ID: u8 = 0x0f;

/// A varint never spans more than four bytes
const VARINT_MAX_LEN: usize = 4;

/// Decoded GIP packet header.
///
/// The options byte is kept split into its client id nibble and its flag
/// nibble; the two are never compared as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GipHeader {
    pub command: u8,
    pub client_id: u8,
    pub flags: u8,
    pub sequence: u8,
    /// Payload length in bytes
    pub length: usize,
    /// Chunk offset; meaningful only when `GIP_OPT_CHUNK` is set
    pub chunk_offset: u32,
}

impl GipHeader {
    /// Header for an internal command addressed to `client_id`
    pub fn internal(command: u8, client_id: u8) -> Self {
        Self {
            command,
            client_id,
            flags: GIP_OPT_INTERNAL,
            ..Self::default()
        }
    }

    /// Header for an external command addressed to `client_id`
    pub fn external(command: u8, client_id: u8) -> Self {
        Self {
            command,
            client_id,
            ..Self::default()
        }
    }

    pub fn is_acknowledge(&self) -> bool {
        self.flags & GIP_OPT_ACKNOWLEDGE != 0
    }

    pub fn is_internal(&self) -> bool {
        self.flags & GIP_OPT_INTERNAL != 0
    }

    pub fn is_chunk_start(&self) -> bool {
        self.flags & GIP_OPT_CHUNK_START != 0
    }

    pub fn is_chunk(&self) -> bool {
        self.flags & GIP_OPT_CHUNK != 0
    }

    /// Encode the header, applying the even-length padding rule
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);

        out.push(self.command);
        out.push((self.client_id & GIP_OPT_CLIENT_ID) | (self.flags & 0xf0));
        out.push(self.sequence);

        encode_varint(self.length as u32, &mut out)?;
        if self.is_chunk() {
            encode_varint(self.chunk_offset, &mut out)?;
        }

        if out.len() % 2 != 0 {
            // mark the final varint byte as continued, then pad with zero
            let last = out.last_mut().expect("header is never empty");
            if *last & 0x80 != 0 {
                return Err(GipError::MalformedHeader);
            }
            *last |= 0x80;
            out.push(0x00);
        }

        Ok(out)
    }

    /// Encoded size of this header in bytes
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(self.encode()?.len())
    }

    /// Decode a header from the start of `data`.
    ///
    /// Returns the header and the number of bytes consumed. Fails with
    /// `MalformedHeader` when the buffer ends inside the header or a varint
    /// overruns four bytes.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 3 {
            return Err(GipError::MalformedHeader);
        }

        let command = data[0];
        let client_id = data[1] & GIP_OPT_CLIENT_ID;
        let flags = data[1] & 0xf0;
        let sequence = data[2];
        let mut consumed = 3;

        let (length, n) = decode_varint(&data[consumed..])?;
        consumed += n;

        let mut chunk_offset = 0;
        if flags & GIP_OPT_CHUNK != 0 {
            let (offset, n) = decode_varint(&data[consumed..])?;
            chunk_offset = offset;
            consumed += n;
        }

        Ok((
            Self {
                command,
                client_id,
                flags,
                sequence,
                length: length as usize,
                chunk_offset,
            },
            consumed,
        ))
    }
}

/// Encode a varint: seven value bits per byte, high bit marks continuation
pub fn encode_varint(value: u32, out: &mut Vec<u8>) -> Result<()> {
    if value >= 1 << (7 * VARINT_MAX_LEN) {
        return Err(GipError::MalformedHeader);
    }

    let mut val = value;
    loop {
        let byte = (val & 0x7f) as u8;
        val >>= 7;
        if val != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            return Ok(());
        }
    }
}

/// Decode a varint from the start of `data`, returning the value and the
/// number of bytes consumed
pub fn decode_varint(data: &[u8]) -> Result<(u32, usize)> {
    let mut value = 0u32;
    let mut consumed = 0;

    loop {
        if consumed >= data.len() || consumed >= VARINT_MAX_LEN {
            return Err(GipError::MalformedHeader);
        }

        let byte = data[consumed];
        value |= ((byte & 0x7f) as u32) << (7 * consumed);
        consumed += 1;

        if byte & 0x80 == 0 {
            return Ok((value, consumed));
        }
    }
}

/// Encode a full packet: header followed by payload
pub fn encode_packet(header: &GipHeader, payload: &[u8]) -> Result<Vec<u8>> {
    debug_assert_eq!(header.length, payload.len());

    let mut out = header.encode()?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a full packet into its header and payload view.
///
/// Fails with `ShortBody` when the buffer holds less than the declared
/// payload length.
pub fn decode_packet(data: &[u8]) -> Result<(GipHeader, &[u8])> {
    let (header, consumed) = GipHeader::decode(data)?;

    if data.len() < consumed + header.length {
        return Err(GipError::ShortBody);
    }

    Ok((header, &data[consumed..consumed + header.length]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let mut out = Vec::new();
        for value in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0xffff, 0x0fff_ffff] {
            out.clear();
            encode_varint(value, &mut out).unwrap();
            let (decoded, consumed) = decode_varint(&out).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, out.len());
        }
    }

    #[test]
    fn test_varint_limits() {
        let mut out = Vec::new();
        assert!(encode_varint(1 << 28, &mut out).is_err());
        // five continuation bytes overflow the decoder
        assert!(decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        // truncated varint
        assert!(decode_varint(&[0x80]).is_err());
    }

    #[test]
    fn test_header_roundtrip_is_even() {
        let cases = [
            GipHeader {
                command: GIP_CMD_STATUS,
                client_id: 3,
                flags: GIP_OPT_INTERNAL,
                sequence: 7,
                length: 4,
                chunk_offset: 0,
            },
            GipHeader {
                command: GIP_CMD_IDENTIFY,
                client_id: 1,
                flags: GIP_OPT_INTERNAL | GIP_OPT_ACKNOWLEDGE,
                sequence: 0xff,
                length: 200,
                chunk_offset: 0,
            },
            GipHeader {
                command: GIP_CMD_AUTHENTICATE,
                client_id: 2,
                flags: GIP_OPT_INTERNAL | GIP_OPT_CHUNK | GIP_OPT_CHUNK_START | GIP_OPT_ACKNOWLEDGE,
                sequence: 9,
                length: 58,
                chunk_offset: 1024,
            },
            GipHeader {
                command: GIP_CMD_AUDIO_SAMPLES,
                client_id: 0,
                flags: GIP_OPT_INTERNAL,
                sequence: 1,
                length: 194,
                chunk_offset: 0,
            },
        ];

        for hdr in cases {
            let encoded = hdr.encode().unwrap();
            assert_eq!(encoded.len() % 2, 0, "odd header for {hdr:?}");

            let (decoded, consumed) = GipHeader::decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, hdr);
        }
    }

    #[test]
    fn test_power_on_encoding() {
        // Power(On) to client 0 encodes as 05 20 S 01 00
        let hdr = GipHeader {
            command: GIP_CMD_POWER,
            client_id: 0,
            flags: GIP_OPT_INTERNAL,
            sequence: 0x2a,
            length: 1,
            chunk_offset: 0,
        };

        let pkt = encode_packet(&hdr, &[0x00]).unwrap();
        assert_eq!(pkt, vec![0x05, 0x20, 0x2a, 0x01, 0x00]);

        let (decoded, payload) = decode_packet(&pkt).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(payload, &[0x00]);
    }

    #[test]
    fn test_options_nibbles_split() {
        let data = [0x03, 0xb5, 0x01, 0x00];
        let (hdr, _) = GipHeader::decode(&data).unwrap();
        assert_eq!(hdr.client_id, 0x05);
        assert_eq!(hdr.flags, 0xb0);
        assert!(hdr.is_chunk());
    }

    #[test]
    fn test_padded_header() {
        // a two byte length varint makes the natural header five bytes long
        let hdr = GipHeader {
            command: GIP_CMD_HID_REPORT,
            client_id: 0,
            flags: GIP_OPT_INTERNAL,
            sequence: 5,
            length: 130,
            chunk_offset: 0,
        };

        let encoded = hdr.encode().unwrap();
        assert_eq!(encoded.len(), 6);
        assert_eq!(*encoded.last().unwrap(), 0x00);
        // final varint byte carries the continuation mark
        assert_ne!(encoded[encoded.len() - 2] & 0x80, 0);

        let (decoded, consumed) = GipHeader::decode(&encoded).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(decoded.length, 130);
    }

    #[test]
    fn test_decode_short_body() {
        let hdr = GipHeader {
            command: GIP_CMD_INPUT,
            client_id: 0,
            flags: 0,
            sequence: 1,
            length: 10,
            chunk_offset: 0,
        };

        let mut pkt = encode_packet(&hdr, &[0u8; 10]).unwrap();
        pkt.truncate(pkt.len() - 1);
        assert!(matches!(decode_packet(&pkt), Err(GipError::ShortBody)));
    }

    #[test]
    fn test_decode_truncated_header() {
        assert!(matches!(
            GipHeader::decode(&[0x05, 0x20]),
            Err(GipError::MalformedHeader)
        ));
        // chunk flag set but no offset varint present
        assert!(matches!(
            GipHeader::decode(&[0x05, 0x80, 0x01, 0x00]),
            Err(GipError::MalformedHeader)
        ));
    }
}
