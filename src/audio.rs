//! Audio format negotiation and 8 ms sample transport
//!
//! The host suggests a format pair after identification; the device either
//! accepts (replying with a volume report) or counters with its own pair,
//! which the host re-accepts. Once both directions are configured, playback
//! runs on a monotonic 8 ms timer that drains a driver-provided ring buffer
//! into per-fragment GIP packets.

use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::bus::{ClientState, GipBufferKind, GipClient};
use crate::packet::{GipHeader, GIP_CMD_AUDIO_CONTROL, GIP_CMD_AUDIO_SAMPLES, GIP_OPT_INTERNAL};
use crate::{GipError, Result, GIP_AUDIO_INTERVAL_MS};

/// Chat headset format code, 16 kHz mono
pub const AUDIO_FORMAT_CHAT: u8 = 0x04;
/// 24 kHz mono
pub const AUDIO_FORMAT_24KHZ_MONO: u8 = 0x09;
/// 48 kHz stereo
pub const AUDIO_FORMAT_48KHZ_STEREO: u8 = 0x10;

/// Product id of the chat headset, which negotiates via the chat subcommands
const CHAT_HEADSET_PRODUCT: u16 = 0x0111;

// AudioControl subcommands
const AUD_CTRL_VOLUME_CHAT: u8 = 0x00;
const AUD_CTRL_FORMAT_CHAT: u8 = 0x01;
const AUD_CTRL_FORMAT: u8 = 0x02;
const AUD_CTRL_VOLUME: u8 = 0x03;

const AUD_VOLUME_UNMUTED: u8 = 0x04;

/// Bytes of length prefix in front of every sample fragment
const SAMPLE_PREFIX_LEN: usize = 2;
/// Extra prefix bytes on extended wireless sample packets
const SAMPLE_EXTENSION_LEN: usize = 2;

/// Negotiated configuration for one audio direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub format: u8,
    pub channels: usize,
    pub sample_rate: usize,
    /// Bytes of PCM per 8 ms interval
    pub buffer_size: usize,
    /// Bytes of PCM per packet
    pub fragment_size: usize,
    /// Full on-wire packet size including headers
    pub packet_size: usize,
    pub valid: bool,
}

fn format_params(format: u8) -> Result<(usize, usize)> {
    match format {
        AUDIO_FORMAT_CHAT => Ok((1, 16000)),
        AUDIO_FORMAT_24KHZ_MONO => Ok((1, 24000)),
        AUDIO_FORMAT_48KHZ_STEREO => Ok((2, 48000)),
        other => Err(GipError::AudioUnsupportedFormat(other)),
    }
}

impl AudioConfig {
    /// Derive the full configuration for a format code
    pub fn configure(format: u8, audio_packet_count: usize) -> Result<Self> {
        let (channels, sample_rate) = format_params(format)?;

        let buffer_size =
            sample_rate * channels * 2 * GIP_AUDIO_INTERVAL_MS as usize / 1000;
        let fragment_size = buffer_size / audio_packet_count;

        let header = GipHeader {
            command: GIP_CMD_AUDIO_SAMPLES,
            client_id: 0,
            flags: GIP_OPT_INTERNAL,
            sequence: 1,
            length: SAMPLE_PREFIX_LEN + fragment_size,
            chunk_offset: 0,
        };
        let packet_size = header.encoded_len()? + SAMPLE_PREFIX_LEN + fragment_size;

        Ok(Self {
            format,
            channels,
            sample_rate,
            buffer_size,
            fragment_size,
            packet_size,
            valid: true,
        })
    }
}

impl GipClient {
    /// Suggest an audio format pair to the device.
    ///
    /// Chat headsets negotiate through the chat subcommand; everything else
    /// receives a regular format proposal.
    pub fn suggest_audio_format(&self, in_format: u8, out_format: u8) -> Result<()> {
        if self.hardware().product == CHAT_HEADSET_PRODUCT {
            self.send_internal(
                GIP_CMD_AUDIO_CONTROL,
                &[AUD_CTRL_FORMAT_CHAT, AUDIO_FORMAT_CHAT],
            )?;
        } else {
            self.send_internal(
                GIP_CMD_AUDIO_CONTROL,
                &[AUD_CTRL_FORMAT, in_format, out_format],
            )?;
        }

        self.audio_config_in.lock().unwrap().format = in_format;
        self.audio_config_out.lock().unwrap().format = out_format;

        Ok(())
    }

    fn set_audio_volume(&self, in_level: u8, out_level: u8) -> Result<()> {
        self.send_internal(
            GIP_CMD_AUDIO_CONTROL,
            &[
                AUD_CTRL_VOLUME,
                AUD_VOLUME_UNMUTED,
                out_level,
                0x00,
                in_level,
                0x00,
                0x00,
                0x00,
            ],
        )
    }

    /// Pin the hardware volume to maximum so volume is handled in software.
    /// Chat headsets keep their physical volume buttons.
    pub fn fix_audio_volume(&self) -> Result<()> {
        if self.hardware().product == CHAT_HEADSET_PRODUCT {
            return Ok(());
        }

        self.set_audio_volume(100, 100)
    }

    pub fn enable_audio(&self) -> Result<()> {
        self.adapter().ok_or(GipError::Unsupported)?.ops.enable_audio()
    }

    pub fn init_audio_in(&self) -> Result<()> {
        self.adapter().ok_or(GipError::Unsupported)?.ops.init_audio_in()
    }

    pub fn init_audio_out(&self) -> Result<()> {
        let packet_size = self.audio_config_out.lock().unwrap().packet_size;
        self.adapter()
            .ok_or(GipError::Unsupported)?
            .ops
            .init_audio_out(packet_size)
    }

    pub fn disable_audio(&self) {
        if let Some(adapter) = self.adapter() {
            // always fails on adapter removal
            if let Err(err) = adapter.ops.disable_audio() {
                debug!("client {}: disable audio: {}", self.id(), err);
            }
        }
    }

    /// Negotiated output configuration, if any
    pub fn audio_config_out(&self) -> AudioConfig {
        *self.audio_config_out.lock().unwrap()
    }

    /// Negotiated input configuration, if any
    pub fn audio_config_in(&self) -> AudioConfig {
        *self.audio_config_in.lock().unwrap()
    }

    /// Send one interval worth of samples as `audio_packet_count` packets
    pub fn send_audio_samples(&self, samples: &[u8]) -> Result<()> {
        let adapter = self.adapter().ok_or(GipError::Unsupported)?;
        let cfg = *self.audio_config_out.lock().unwrap();

        if !cfg.valid {
            return Err(GipError::Unsupported);
        }

        let count = adapter.audio_packet_count;
        let mut buf = adapter.ops.get_buffer(GipBufferKind::Audio)?;

        if buf.data.len() < count * cfg.packet_size {
            return Err(GipError::NoTxBuffer);
        }

        let mut at = 0;
        for i in 0..count {
            let fragment = &samples[i * cfg.fragment_size..(i + 1) * cfg.fragment_size];

            let header = GipHeader {
                command: GIP_CMD_AUDIO_SAMPLES,
                client_id: self.id(),
                flags: GIP_OPT_INTERNAL,
                sequence: adapter.next_audio_sequence(),
                length: SAMPLE_PREFIX_LEN + cfg.fragment_size,
                chunk_offset: 0,
            };

            let encoded = header.encode()?;
            buf.data[at..at + encoded.len()].copy_from_slice(&encoded);
            at += encoded.len();

            buf.data[at..at + SAMPLE_PREFIX_LEN]
                .copy_from_slice(&(cfg.fragment_size as u16).to_le_bytes());
            at += SAMPLE_PREFIX_LEN;

            buf.data[at..at + cfg.fragment_size].copy_from_slice(fragment);
            at += cfg.fragment_size;
        }

        buf.length = at;
        adapter.ops.submit_buffer(buf)
    }
}

/// Strip the length prefix (and the wireless extension, when present) off an
/// inbound audio samples payload.
pub(crate) fn strip_sample_prefix(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < SAMPLE_PREFIX_LEN {
        return Err(GipError::ShortBody);
    }

    let declared = u16::from_le_bytes([payload[0], payload[1]]) as usize;

    if payload.len() == declared + SAMPLE_PREFIX_LEN {
        Ok(&payload[SAMPLE_PREFIX_LEN..])
    } else if payload.len() == declared + SAMPLE_PREFIX_LEN + SAMPLE_EXTENSION_LEN {
        // extended audio headers are used by wireless clients
        Ok(&payload[SAMPLE_PREFIX_LEN + SAMPLE_EXTENSION_LEN..])
    } else {
        Err(GipError::ShortBody)
    }
}

pub(crate) fn handle_audio_samples(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if client.state() != ClientState::Identified {
        return Ok(());
    }

    let samples = strip_sample_prefix(payload)?;
    client
        .with_driver(|driver| driver.audio_samples(client, samples))
        .map(|_| ())
}

pub(crate) fn handle_audio_control(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    let subcommand = *payload.first().ok_or(GipError::ShortBody)?;

    match subcommand {
        AUD_CTRL_FORMAT_CHAT => handle_format_chat(client, payload),
        AUD_CTRL_VOLUME_CHAT => {
            if payload.len() < 5 {
                return Err(GipError::ShortBody);
            }
            // mute, gain_out, out, in
            let (in_level, out_level) = (payload[4], payload[3]);
            client
                .with_driver(|driver| driver.audio_volume(client, in_level, out_level))
                .map(|_| ())
        }
        AUD_CTRL_FORMAT => handle_format(client, payload),
        AUD_CTRL_VOLUME => {
            if payload.len() < 5 {
                return Err(GipError::ShortBody);
            }
            let (in_level, out_level) = (payload[4], payload[2]);
            client
                .with_driver(|driver| driver.audio_volume(client, in_level, out_level))
                .map(|_| ())
        }
        other => {
            warn!("client {}: unknown audio subcommand {:#04x}", client.id(), other);
            Ok(())
        }
    }
}

fn handle_format(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if payload.len() < 3 {
        return Err(GipError::ShortBody);
    }

    let (in_format, out_format) = (payload[1], payload[2]);
    let suggested_in = client.audio_config_in.lock().unwrap().format;
    let suggested_out = client.audio_config_out.lock().unwrap().format;

    if client.audio_config_in.lock().unwrap().valid
        || client.audio_config_out.lock().unwrap().valid
    {
        warn!("client {}: format already accepted", client.id());
        return Ok(());
    }

    // the device rejected our proposal; accept its counter proposal
    if in_format != suggested_in || out_format != suggested_out {
        warn!(
            "client {}: format rejected: {:#04x}/{:#04x}",
            client.id(),
            suggested_in,
            suggested_out
        );
        return client.suggest_audio_format(in_format, out_format);
    }

    accept_formats(client, in_format, out_format)
}

fn handle_format_chat(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if payload.len() < 2 {
        return Err(GipError::ShortBody);
    }

    if payload[1] != AUDIO_FORMAT_CHAT
        || client.audio_config_in.lock().unwrap().valid
        || client.audio_config_out.lock().unwrap().valid
    {
        warn!("client {}: unexpected chat format reply", client.id());
        return Ok(());
    }

    accept_formats(client, AUDIO_FORMAT_CHAT, AUDIO_FORMAT_CHAT)
}

fn accept_formats(client: &Arc<GipClient>, in_format: u8, out_format: u8) -> Result<()> {
    let count = client.audio_packet_count();

    *client.audio_config_in.lock().unwrap() = AudioConfig::configure(in_format, count)?;
    *client.audio_config_out.lock().unwrap() = AudioConfig::configure(out_format, count)?;

    client
        .with_driver(|driver| driver.audio_ready(client))
        .map(|_| ())
}

/// Fixed-size PCM ring buffer shuttling samples between a driver and the
/// audio timer
pub struct AudioRing {
    inner: Mutex<RingInner>,
}

struct RingInner {
    data: Vec<u8>,
    read: usize,
    len: usize,
}

impl AudioRing {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RingInner {
                data: vec![0; capacity],
                read: 0,
                len: 0,
            }),
        })
    }

    /// Append bytes, returning how many fit
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.data.len();
        let free = capacity - inner.len;
        let n = bytes.len().min(free);

        let mut at = (inner.read + inner.len) % capacity;
        for &byte in &bytes[..n] {
            inner.data[at] = byte;
            at = (at + 1) % capacity;
        }

        inner.len += n;
        n
    }

    /// Pop up to `out.len()` bytes, returning how many were available
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.data.len();
        let n = out.len().min(inner.len);

        for slot in out[..n].iter_mut() {
            *slot = inner.data[inner.read];
            inner.read = (inner.read + 1) % capacity;
        }

        inner.len -= n;
        n
    }

    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().len
    }
}

/// Run the 8 ms playback timer for a client.
///
/// Every tick drains one interval worth of PCM from the ring (padding with
/// silence) and submits it. TX buffer starvation skips the tick; any other
/// error stops the stream.
pub fn spawn_audio_out(client: Arc<GipClient>, ring: Arc<AudioRing>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cfg = client.audio_config_out();
        if !cfg.valid {
            error!("client {}: audio out not configured", client.id());
            return;
        }

        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(GIP_AUDIO_INTERVAL_MS));
        let mut scratch = vec![0u8; cfg.buffer_size];

        loop {
            interval.tick().await;

            let n = ring.read(&mut scratch);
            scratch[n..].fill(0);

            match client.send_audio_samples(&scratch) {
                Ok(()) => {}
                // transient starvation, retry on the next tick
                Err(GipError::NoTxBuffer) => continue,
                Err(err) => {
                    error!("client {}: audio stream stopped: {}", client.id(), err);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::mock_adapter;
    use crate::bus::{GipDriver, GipHardware};
    use crate::packet::{decode_packet, encode_packet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AudioDriver {
        ready: AtomicUsize,
        volumes: Mutex<Vec<(u8, u8)>>,
        samples: Mutex<Vec<Vec<u8>>>,
    }

    impl AudioDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicUsize::new(0),
                volumes: Mutex::new(Vec::new()),
                samples: Mutex::new(Vec::new()),
            })
        }
    }

    impl GipDriver for AudioDriver {
        fn name(&self) -> &str {
            "audio"
        }

        fn class(&self) -> &str {
            "Test.Audio"
        }

        fn probe(&self, _client: &Arc<GipClient>) -> Result<()> {
            Ok(())
        }

        fn audio_ready(&self, _client: &Arc<GipClient>) -> Result<()> {
            self.ready.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn audio_volume(&self, _client: &Arc<GipClient>, in_level: u8, out_level: u8) -> Result<()> {
            self.volumes.lock().unwrap().push((in_level, out_level));
            Ok(())
        }

        fn audio_samples(&self, _client: &Arc<GipClient>, data: &[u8]) -> Result<()> {
            self.samples.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    fn audio_control_packet(client_id: u8, payload: &[u8]) -> Vec<u8> {
        let header = GipHeader {
            command: GIP_CMD_AUDIO_CONTROL,
            client_id,
            flags: GIP_OPT_INTERNAL,
            sequence: 0x21,
            length: payload.len(),
            chunk_offset: 0,
        };
        encode_packet(&header, payload).unwrap()
    }

    #[test]
    fn test_config_derivation() {
        let cfg = AudioConfig::configure(AUDIO_FORMAT_48KHZ_STEREO, 8).unwrap();
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.sample_rate, 48000);
        assert_eq!(cfg.buffer_size, 1536);
        assert_eq!(cfg.fragment_size, 192);
        // padded six byte header + two byte prefix + fragment
        assert_eq!(cfg.packet_size, 200);
        assert!(cfg.valid);

        let cfg = AudioConfig::configure(AUDIO_FORMAT_24KHZ_MONO, 4).unwrap();
        assert_eq!(cfg.buffer_size, 384);
        assert_eq!(cfg.fragment_size, 96);
        assert_eq!(cfg.packet_size, 4 + 2 + 96);

        let cfg = AudioConfig::configure(AUDIO_FORMAT_CHAT, 1).unwrap();
        assert_eq!(cfg.sample_rate, 16000);
        assert_eq!(cfg.buffer_size, 256);
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(matches!(
            AudioConfig::configure(0x42, 1),
            Err(GipError::AudioUnsupportedFormat(0x42))
        ));
    }

    #[test]
    fn test_ring_wraparound() {
        let ring = AudioRing::new(8);

        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6]), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        // wraps across the end of the backing buffer
        assert_eq!(ring.write(&[7, 8, 9, 10, 11, 12]), 6);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.write(&[13]), 0);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_format_negotiation_accept() {
        let (adapter, ops) = mock_adapter(8);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = AudioDriver::new();
        client.bind_driver_for_test(driver.clone());

        client
            .suggest_audio_format(AUDIO_FORMAT_24KHZ_MONO, AUDIO_FORMAT_48KHZ_STEREO)
            .unwrap();

        let sent = ops.sent_packets();
        let (_, payload) = decode_packet(&sent[0]).unwrap();
        assert_eq!(payload, &[AUD_CTRL_FORMAT, 0x09, 0x10]);

        // device accepts by echoing the pair
        let reply = audio_control_packet(0, &[AUD_CTRL_FORMAT, 0x09, 0x10]);
        adapter.process_buffer(&reply).unwrap();

        assert!(client.audio_config_in().valid);
        assert!(client.audio_config_out().valid);
        assert_eq!(client.audio_config_out().format, AUDIO_FORMAT_48KHZ_STEREO);
        assert_eq!(driver.ready.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_format_negotiation_counter_proposal() {
        let (adapter, ops) = mock_adapter(8);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = AudioDriver::new();
        client.bind_driver_for_test(driver.clone());

        client
            .suggest_audio_format(AUDIO_FORMAT_24KHZ_MONO, AUDIO_FORMAT_48KHZ_STEREO)
            .unwrap();

        // device counters with mono in both directions
        let counter = audio_control_packet(0, &[AUD_CTRL_FORMAT, 0x09, 0x09]);
        adapter.process_buffer(&counter).unwrap();

        // host re-suggests the countered pair
        let sent = ops.sent_packets();
        let (_, payload) = decode_packet(sent.last().unwrap()).unwrap();
        assert_eq!(payload, &[AUD_CTRL_FORMAT, 0x09, 0x09]);
        assert!(!client.audio_config_out().valid);

        // second reply matches and completes negotiation
        let accept = audio_control_packet(0, &[AUD_CTRL_FORMAT, 0x09, 0x09]);
        adapter.process_buffer(&accept).unwrap();

        assert!(client.audio_config_in().valid);
        assert_eq!(client.audio_config_out().format, AUDIO_FORMAT_24KHZ_MONO);
        assert_eq!(driver.ready.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_chat_headset_negotiation() {
        let (adapter, ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        *client.hardware.lock().unwrap() = GipHardware {
            product: CHAT_HEADSET_PRODUCT,
            ..GipHardware::default()
        };
        let driver = AudioDriver::new();
        client.bind_driver_for_test(driver.clone());

        client
            .suggest_audio_format(AUDIO_FORMAT_CHAT, AUDIO_FORMAT_CHAT)
            .unwrap();

        let sent = ops.sent_packets();
        let (_, payload) = decode_packet(&sent[0]).unwrap();
        assert_eq!(payload, &[AUD_CTRL_FORMAT_CHAT, AUDIO_FORMAT_CHAT]);

        let reply = audio_control_packet(0, &[AUD_CTRL_FORMAT_CHAT, AUDIO_FORMAT_CHAT]);
        adapter.process_buffer(&reply).unwrap();

        assert!(client.audio_config_in().valid);
        assert_eq!(client.audio_config_in().sample_rate, 16000);

        // chat headsets keep their hardware volume
        client.fix_audio_volume().unwrap();
        assert_eq!(ops.sent_packets().len(), 1);
    }

    #[test]
    fn test_volume_report_forwarded() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = AudioDriver::new();
        client.bind_driver_for_test(driver.clone());

        let reply = audio_control_packet(
            0,
            &[AUD_CTRL_VOLUME, AUD_VOLUME_UNMUTED, 72, 0, 55, 0, 0, 0],
        );
        adapter.process_buffer(&reply).unwrap();

        assert_eq!(driver.volumes.lock().unwrap().as_slice(), &[(55, 72)]);
    }

    #[test]
    fn test_strip_sample_prefix() {
        let mut payload = vec![0x04, 0x00];
        payload.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(strip_sample_prefix(&payload).unwrap(), &[1, 2, 3, 4]);

        // extended wireless layout carries two extra bytes
        let mut payload = vec![0x04, 0x00, 0xaa, 0xbb];
        payload.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(strip_sample_prefix(&payload).unwrap(), &[1, 2, 3, 4]);

        assert!(strip_sample_prefix(&[0x04]).is_err());
        assert!(strip_sample_prefix(&[0x08, 0x00, 1, 2]).is_err());
    }

    #[test]
    fn test_inbound_samples_reach_driver() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = AudioDriver::new();
        client.bind_driver_for_test(driver.clone());

        let mut payload = vec![0x03, 0x00];
        payload.extend_from_slice(&[9, 8, 7]);
        let header = GipHeader {
            command: GIP_CMD_AUDIO_SAMPLES,
            client_id: 0,
            flags: GIP_OPT_INTERNAL,
            sequence: 5,
            length: payload.len(),
            chunk_offset: 0,
        };
        let pkt = encode_packet(&header, &payload).unwrap();
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(driver.samples.lock().unwrap().as_slice(), &[vec![9, 8, 7]]);
    }

    #[test]
    fn test_outbound_samples_layout() {
        let (adapter, ops) = mock_adapter(8);
        let client = adapter.get_or_init_client(0).unwrap();
        *client.audio_config_out.lock().unwrap() =
            AudioConfig::configure(AUDIO_FORMAT_48KHZ_STEREO, 8).unwrap();

        let samples: Vec<u8> = (0..1536u16).map(|v| v as u8).collect();
        client.send_audio_samples(&samples).unwrap();

        let sent = ops.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (kind, data) = &sent[0];
        assert_eq!(*kind, GipBufferKind::Audio);
        assert_eq!(data.len(), 8 * 200);

        // each fragment is an independent packet with a fresh sequence
        let mut seqs = Vec::new();
        for i in 0..8 {
            let pkt = &data[i * 200..(i + 1) * 200];
            let (hdr, body) = decode_packet(pkt).unwrap();
            assert_eq!(hdr.command, GIP_CMD_AUDIO_SAMPLES);
            assert_ne!(hdr.sequence, 0);
            assert_eq!(u16::from_le_bytes([body[0], body[1]]), 192);
            assert_eq!(&body[2..], &samples[i * 192..(i + 1) * 192]);
            seqs.push(hdr.sequence);
        }
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1).max(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_timer_rate() {
        let (adapter, ops) = mock_adapter(2);
        let client = adapter.get_or_init_client(0).unwrap();
        *client.audio_config_out.lock().unwrap() =
            AudioConfig::configure(AUDIO_FORMAT_48KHZ_STEREO, 2).unwrap();

        let ring = AudioRing::new(4096);
        let handle = spawn_audio_out(Arc::clone(&client), ring);

        // first tick fires immediately
        tokio::task::yield_now().await;
        ops.sent.lock().unwrap().clear();

        // one second of ticks transmits 1000 / 8 = 125 buffers
        for _ in 0..125 {
            tokio::time::advance(std::time::Duration::from_millis(8)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(ops.sent.lock().unwrap().len(), 125);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_timer_survives_starvation() {
        let (adapter, ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        *client.audio_config_out.lock().unwrap() =
            AudioConfig::configure(AUDIO_FORMAT_24KHZ_MONO, 1).unwrap();

        let ring = AudioRing::new(1024);
        let handle = spawn_audio_out(Arc::clone(&client), ring);
        tokio::task::yield_now().await;

        ops.starve_tx.store(true, Ordering::Relaxed);
        for _ in 0..4 {
            tokio::time::advance(std::time::Duration::from_millis(8)).await;
            tokio::task::yield_now().await;
        }

        let before = ops.sent.lock().unwrap().len();
        ops.starve_tx.store(false, Ordering::Relaxed);
        for _ in 0..3 {
            tokio::time::advance(std::time::Duration::from_millis(8)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(ops.sent.lock().unwrap().len(), before + 3);
        handle.abort();
    }
}
