//! GIP framing: sequencing, acknowledgement and chunk reassembly
//!
//! Transmit sequence numbers are allocated under the adapter's send lock and
//! are never zero. Payloads above `GIP_MAX_SIMPLE_PAYLOAD` are split into
//! chunked packets; the start chunk declares the transfer total in its chunk
//! offset field and an empty terminal chunk closes the transfer.

use std::io;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::bus::{ClientState, GipAdapter, GipBufferKind, GipClient};
use crate::messages;
use crate::packet::{
    decode_packet, encode_packet, GipHeader, GIP_CMD_ACKNOWLEDGE, GIP_OPT_ACKNOWLEDGE,
    GIP_OPT_CHUNK, GIP_OPT_CHUNK_START, GIP_OPT_INTERNAL,
};
use crate::{GipError, Result, GIP_MAX_CHUNK_TOTAL, GIP_MAX_SIMPLE_PAYLOAD};

/// One-slot reassembly buffer for a chunked transfer
#[derive(Debug)]
pub struct ChunkBuffer {
    /// Declared transfer total
    pub length: usize,
    /// All chunks received, ready for dispatch
    pub full: bool,
    pub data: Vec<u8>,
}

impl ChunkBuffer {
    fn new(length: usize) -> Self {
        Self {
            length,
            full: false,
            data: vec![0; length],
        }
    }
}

impl GipAdapter {
    /// Encode and transmit one packet, drawing a fresh data sequence number
    /// when the header carries none.
    pub(crate) fn send_pkt(&self, header: &mut GipHeader, payload: &[u8]) -> Result<()> {
        header.length = payload.len();

        let mut sequences = self.sequences.lock().unwrap();

        // sequence number is always greater than zero
        while header.sequence == 0 {
            header.sequence = sequences.data;
            sequences.data = sequences.data.wrapping_add(1);
        }

        let mut buf = self.ops.get_buffer(GipBufferKind::Data)?;
        let bytes = encode_packet(header, payload)?;

        if buf.data.len() < bytes.len() {
            error!("gip{}: buffer too small", self.id);
            return Err(GipError::NoTxBuffer);
        }

        buf.data[..bytes.len()].copy_from_slice(&bytes);
        buf.length = bytes.len();

        match self.ops.submit_buffer(buf) {
            Ok(()) => Ok(()),
            // always fails on adapter removal
            Err(err) if self.is_shutting_down() => {
                debug!("gip{}: submit during teardown: {}", self.id, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Draw the next non-zero audio sequence number
    pub(crate) fn next_audio_sequence(&self) -> u8 {
        let mut sequences = self.sequences.lock().unwrap();
        let mut seq = 0;

        while seq == 0 {
            seq = sequences.audio;
            sequences.audio = sequences.audio.wrapping_add(1);
        }

        seq
    }

    /// Process one GIP packet delivered by the transport.
    ///
    /// Errors are reported to the caller; the packet is discarded and the
    /// client stays on the bus in its current state.
    pub fn process_buffer(&self, data: &[u8]) -> Result<()> {
        let (header, payload) = decode_packet(data)?;
        let client = self.get_or_init_client(header.client_id)?;

        if client.state() == ClientState::Disconnected {
            return Ok(());
        }

        let result = if header.is_chunk() {
            match client.process_chunk(&header, payload) {
                // all chunks have been received
                Ok(Some(buf)) => {
                    let assembled = GipHeader {
                        length: buf.data.len(),
                        flags: header.flags
                            & !(GIP_OPT_CHUNK | GIP_OPT_CHUNK_START | GIP_OPT_ACKNOWLEDGE),
                        ..header
                    };
                    messages::dispatch(&client, &assembled, &buf.data)
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            let ack = if header.is_acknowledge() {
                client.acknowledge_pkt(&header, header.length as u16, 0)
            } else {
                Ok(())
            };

            ack.and_then(|_| messages::dispatch(&client, &header, payload))
        };

        if let Err(err) = &result {
            error!(
                "gip{}.{}: process packet failed: {}",
                self.id, header.client_id, err
            );
        }

        result
    }
}

impl GipClient {
    /// Send an internal command packet
    pub(crate) fn send_internal(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.send_with_flags(command, GIP_OPT_INTERNAL, payload)
    }

    /// Send an external (driver originated) command packet
    pub(crate) fn send_external(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.send_with_flags(command, 0, payload)
    }

    /// Send a packet with explicit option flags, chunking large payloads
    pub(crate) fn send_with_flags(&self, command: u8, flags: u8, payload: &[u8]) -> Result<()> {
        let adapter = self
            .adapter()
            .ok_or_else(|| GipError::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        if payload.len() > GIP_MAX_SIMPLE_PAYLOAD {
            return self.send_chunked(&adapter, command, flags, payload);
        }

        let mut header = GipHeader {
            command,
            client_id: self.id(),
            flags,
            ..GipHeader::default()
        };

        adapter.send_pkt(&mut header, payload)
    }

    /// Split a large payload into a chunked transfer.
    ///
    /// The start chunk carries the transfer total in its offset field, the
    /// final payload chunk requests acknowledgement, and an empty terminal
    /// chunk repeats the total to close the transfer.
    fn send_chunked(
        &self,
        adapter: &Arc<GipAdapter>,
        command: u8,
        flags: u8,
        payload: &[u8],
    ) -> Result<()> {
        let total = payload.len();
        if total > GIP_MAX_CHUNK_TOTAL {
            return Err(GipError::ChunkOverflow);
        }

        let mut offset = 0;
        while offset < total {
            let len = (total - offset).min(GIP_MAX_SIMPLE_PAYLOAD);
            let last = offset + len == total;

            let mut chunk_flags = flags | GIP_OPT_CHUNK;
            if offset == 0 {
                chunk_flags |= GIP_OPT_CHUNK_START | GIP_OPT_ACKNOWLEDGE;
            } else if last {
                chunk_flags |= GIP_OPT_ACKNOWLEDGE;
            }

            let mut header = GipHeader {
                command,
                client_id: self.id(),
                flags: chunk_flags,
                chunk_offset: if offset == 0 { total as u32 } else { offset as u32 },
                ..GipHeader::default()
            };

            adapter.send_pkt(&mut header, &payload[offset..offset + len])?;
            offset += len;
        }

        // empty chunk with the total offset signals end of transfer
        let mut header = GipHeader {
            command,
            client_id: self.id(),
            flags: flags | GIP_OPT_CHUNK,
            chunk_offset: total as u32,
            ..GipHeader::default()
        };

        adapter.send_pkt(&mut header, &[])
    }

    /// Synthesise an acknowledgement for a received packet
    fn acknowledge_pkt(&self, acked: &GipHeader, received: u16, remaining: u16) -> Result<()> {
        let adapter = self
            .adapter()
            .ok_or_else(|| GipError::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        let mut payload = [0u8; 9];
        payload[1] = acked.command;
        payload[2] = (self.id() & 0x0f) | GIP_OPT_INTERNAL;
        payload[3..5].copy_from_slice(&received.to_le_bytes());
        // only required for the start chunk
        payload[7..9].copy_from_slice(&remaining.to_le_bytes());

        let mut header = GipHeader {
            command: GIP_CMD_ACKNOWLEDGE,
            client_id: self.id(),
            flags: GIP_OPT_INTERNAL,
            ..GipHeader::default()
        };

        adapter.send_pkt(&mut header, &payload)
    }

    /// Feed one chunk into the reassembly buffer; returns the finished
    /// buffer once the transfer completes.
    fn process_chunk(&self, header: &GipHeader, payload: &[u8]) -> Result<Option<ChunkBuffer>> {
        let offset = header.chunk_offset as usize;
        let len = payload.len();

        let mut guard = self.chunk_buf.lock().unwrap();

        if header.is_chunk_start() {
            if guard.is_some() {
                warn!("client {}: discarding stale chunk buffer", self.id());
            }

            // offset field of the start chunk is the total length
            if offset > GIP_MAX_CHUNK_TOTAL || len > offset {
                return Err(GipError::ChunkOverflow);
            }

            let mut buf = ChunkBuffer::new(offset);
            buf.data[..len].copy_from_slice(payload);

            if header.is_acknowledge() {
                self.acknowledge_pkt(header, len as u16, (offset - len) as u16)?;
            }

            *guard = Some(buf);
            return Ok(None);
        }

        let buf = match guard.as_mut() {
            Some(buf) => buf,
            None => {
                // some devices emit spurious completions
                if len == 0 {
                    debug!("client {}: completion without transfer", self.id());
                } else {
                    warn!("client {}: chunk without transfer", self.id());
                }
                return Ok(None);
            }
        };

        if len == 0 {
            if offset > buf.length {
                return Err(GipError::ChunkOverflow);
            }

            if offset < buf.length {
                warn!(
                    "client {}: transfer ended short: {}/{}",
                    self.id(),
                    offset,
                    buf.length
                );
                buf.data.truncate(offset);
                buf.length = offset;
            }

            buf.full = true;
        } else {
            if offset + len > buf.length {
                return Err(GipError::ChunkOverflow);
            }

            if header.is_acknowledge() {
                let received = (offset + len) as u16;
                self.acknowledge_pkt(header, received, (buf.length - offset - len) as u16)?;
            }

            buf.data[offset..offset + len].copy_from_slice(payload);
        }

        if buf.full {
            return Ok(guard.take());
        }

        Ok(None)
    }
}
