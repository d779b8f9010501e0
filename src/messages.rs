//! Typed GIP protocol messages
//!
//! Parsing and construction of the internal command payloads, the identify
//! sub-table parser and the dispatch table that routes inbound packets to the
//! lifecycle handlers and bound drivers.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bus::{ClientState, GipClient, GipClientInfo, GipHardware, GipVersion};
use crate::packet::{
    GipHeader, GIP_CMD_ACKNOWLEDGE, GIP_CMD_ANNOUNCE, GIP_CMD_AUDIO_CONTROL,
    GIP_CMD_AUDIO_SAMPLES, GIP_CMD_AUTHENTICATE, GIP_CMD_HID_REPORT, GIP_CMD_IDENTIFY,
    GIP_CMD_INPUT, GIP_CMD_LED, GIP_CMD_POWER, GIP_CMD_RUMBLE, GIP_CMD_STATUS,
    GIP_CMD_VIRTUAL_KEY,
};
use crate::{GipError, Result};

// Status byte layout
const STATUS_CONNECTED: u8 = 0x80;
const STATUS_BATT_LEVEL: u8 = 0x03;
const STATUS_BATT_TYPE_SHIFT: u8 = 2;

/// Battery chemistry reported in status packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryType {
    None,
    Standard,
    Kit,
    Unknown,
}

/// Coarse battery level reported in status packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryLevel {
    Low,
    Normal,
    High,
    Full,
}

/// Decode the battery fields of a status byte
pub fn decode_battery(status: u8) -> (BatteryType, BatteryLevel) {
    let battery_type = match (status >> STATUS_BATT_TYPE_SHIFT) & 0x03 {
        0x00 => BatteryType::None,
        0x01 => BatteryType::Standard,
        0x02 => BatteryType::Kit,
        _ => BatteryType::Unknown,
    };

    let level = match status & STATUS_BATT_LEVEL {
        0x00 => BatteryLevel::Low,
        0x01 => BatteryLevel::Normal,
        0x02 => BatteryLevel::High,
        _ => BatteryLevel::Full,
    };

    (battery_type, level)
}

/// Power modes accepted by the Power command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PowerMode {
    On = 0x00,
    Sleep = 0x01,
    Off = 0x04,
    Reset = 0x07,
}

/// LED modes accepted by accessory LED controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LedMode {
    Off = 0x00,
    On = 0x01,
    BlinkFast = 0x02,
    BlinkMed = 0x03,
    BlinkSlow = 0x04,
    FadeSlow = 0x08,
    FadeFast = 0x09,
}

/// Announce payload: hardware identity of a freshly connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncePacket {
    pub address: [u8; 6],
    pub vendor: u16,
    pub product: u16,
    pub fw_version: GipVersion,
    pub hw_version: GipVersion,
}

impl AnnouncePacket {
    pub const LEN: usize = 28;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != Self::LEN {
            return Err(GipError::ShortBody);
        }

        let mut buf = data;
        let mut address = [0u8; 6];
        buf.copy_to_slice(&mut address);
        // two unknown bytes between address and vendor id
        buf.advance(2);

        Ok(Self {
            address,
            vendor: buf.get_u16_le(),
            product: buf.get_u16_le(),
            fw_version: parse_version(&mut buf),
            hw_version: parse_version(&mut buf),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_slice(&self.address);
        out.put_u16_le(0);
        out.put_u16_le(self.vendor);
        out.put_u16_le(self.product);
        put_version(&mut out, &self.fw_version);
        put_version(&mut out, &self.hw_version);
        out
    }
}

fn parse_version(buf: &mut impl Buf) -> GipVersion {
    GipVersion {
        major: buf.get_u16_le(),
        minor: buf.get_u16_le(),
        build: buf.get_u16_le(),
        revision: buf.get_u16_le(),
    }
}

fn put_version(out: &mut impl BufMut, version: &GipVersion) {
    out.put_u16_le(version.major);
    out.put_u16_le(version.minor);
    out.put_u16_le(version.build);
    out.put_u16_le(version.revision);
}

// Identify blob layout: 16 unknown bytes, then eight little-endian table
// offsets into the blob.
const IDENTIFY_OFFSET_TABLE: usize = 16;
const IDENTIFY_MIN_LEN: usize = IDENTIFY_OFFSET_TABLE + 16;

const ITEM_LEN_EXTERNAL_COMMAND: usize = 24;
const ITEM_LEN_FIRMWARE_VERSION: usize = 4;
const ITEM_LEN_AUDIO_FORMAT: usize = 2;
const ITEM_LEN_CAPABILITY: usize = 1;
const ITEM_LEN_INTERFACE: usize = 16;

/// Parse a counted table out of the identify blob.
///
/// A zero offset or a zero count means the table is absent; a region that
/// would fall outside the blob is rejected.
fn parse_info_element(blob: &[u8], offset: u16, item_len: usize) -> Result<Option<Vec<u8>>> {
    let off = offset as usize;
    if off == 0 {
        return Ok(None);
    }

    if off >= blob.len() {
        return Err(GipError::MalformedIdentify(format!(
            "table offset {off} outside blob of {} bytes",
            blob.len()
        )));
    }

    let count = blob[off] as usize;
    if count == 0 {
        return Ok(None);
    }

    let total = count * item_len;
    let start = off + 1;
    if start + total > blob.len() {
        return Err(GipError::MalformedIdentify(format!(
            "table at {off} with {count} items overruns blob"
        )));
    }

    Ok(Some(blob[start..start + total].to_vec()))
}

/// Parse the class string table: a count byte followed by `count`
/// length-prefixed UTF-8 strings.
fn parse_classes(blob: &[u8], offset: u16) -> Result<Vec<String>> {
    let mut off = offset as usize;
    if off == 0 {
        return Ok(Vec::new());
    }

    if off >= blob.len() {
        return Err(GipError::MalformedIdentify("class table outside blob".into()));
    }

    let count = blob[off];
    off += 1;

    let mut classes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if off + 2 > blob.len() {
            return Err(GipError::MalformedIdentify("class length truncated".into()));
        }

        let len = u16::from_le_bytes([blob[off], blob[off + 1]]) as usize;
        off += 2;

        if len == 0 || off + len > blob.len() {
            return Err(GipError::MalformedIdentify("class string truncated".into()));
        }

        let string = String::from_utf8(blob[off..off + len].to_vec())
            .map_err(|_| GipError::MalformedIdentify("class string is not UTF-8".into()))?;

        debug!("identify: class={}", string);
        classes.push(string);
        off += len;
    }

    Ok(classes)
}

/// Parse a full identify blob into the client info tables
pub fn parse_identify(blob: &[u8]) -> Result<GipClientInfo> {
    if blob.len() < IDENTIFY_MIN_LEN {
        return Err(GipError::MalformedIdentify("blob shorter than offset table".into()));
    }

    let offset_at = |index: usize| {
        let at = IDENTIFY_OFFSET_TABLE + index * 2;
        u16::from_le_bytes([blob[at], blob[at + 1]])
    };

    let audio_formats = parse_info_element(blob, offset_at(2), ITEM_LEN_AUDIO_FORMAT)?
        .map(|raw| raw.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect());

    let interfaces = parse_info_element(blob, offset_at(6), ITEM_LEN_INTERFACE)?.map(|raw| {
        raw.chunks_exact(ITEM_LEN_INTERFACE)
            .map(|chunk| {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(chunk);
                guid
            })
            .collect()
    });

    Ok(GipClientInfo {
        external_commands: parse_info_element(blob, offset_at(0), ITEM_LEN_EXTERNAL_COMMAND)?,
        firmware_versions: parse_info_element(blob, offset_at(1), ITEM_LEN_FIRMWARE_VERSION)?,
        audio_formats,
        capabilities_out: parse_info_element(blob, offset_at(3), ITEM_LEN_CAPABILITY)?,
        capabilities_in: parse_info_element(blob, offset_at(4), ITEM_LEN_CAPABILITY)?,
        classes: parse_classes(blob, offset_at(5))?,
        interfaces,
        hid_descriptor: parse_info_element(blob, offset_at(7), ITEM_LEN_CAPABILITY)?,
    })
}

impl GipClient {
    /// Ask an announced client to identify itself
    pub(crate) fn request_identify(&self) -> Result<()> {
        self.send_internal(GIP_CMD_IDENTIFY, &[])
    }

    /// Switch the client's power mode
    pub fn set_power_mode(&self, mode: PowerMode) -> Result<()> {
        self.send_internal(GIP_CMD_POWER, &[mode as u8])
    }

    /// Set the accessory LED
    pub fn set_led_mode(&self, mode: LedMode, brightness: u8) -> Result<()> {
        self.send_internal(GIP_CMD_LED, &[0x00, mode as u8, brightness])
    }

    /// Forward a rumble payload to the device
    pub fn send_rumble(&self, data: &[u8]) -> Result<()> {
        self.send_external(GIP_CMD_RUMBLE, data)
    }
}

/// Route one coherent (or reassembled) packet to its handler
pub(crate) fn dispatch(client: &Arc<GipClient>, header: &GipHeader, payload: &[u8]) -> Result<()> {
    match header.command {
        // acknowledgements carry no state
        GIP_CMD_ACKNOWLEDGE => Ok(()),
        GIP_CMD_ANNOUNCE => handle_announce(client, payload),
        GIP_CMD_STATUS => handle_status(client, payload),
        GIP_CMD_IDENTIFY => handle_identify(client, payload),
        GIP_CMD_AUTHENTICATE => crate::auth::process_packet(client, payload),
        GIP_CMD_VIRTUAL_KEY => handle_virtual_key(client, payload),
        GIP_CMD_AUDIO_CONTROL => crate::audio::handle_audio_control(client, payload),
        GIP_CMD_HID_REPORT => handle_hid_report(client, payload),
        GIP_CMD_INPUT => handle_input(client, payload),
        GIP_CMD_AUDIO_SAMPLES => crate::audio::handle_audio_samples(client, payload),
        command => {
            warn!("client {}: unknown command: {:#04x}", client.id(), command);
            Ok(())
        }
    }
}

fn handle_announce(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    let pkt = AnnouncePacket::parse(payload)?;

    if client.state() != ClientState::Connected {
        warn!("client {}: announce in invalid state", client.id());
        return Ok(());
    }

    debug!(
        "client {}: vendor={:#06x}, product={:#06x}",
        client.id(),
        pkt.vendor,
        pkt.product
    );

    *client.hardware.lock().unwrap() = GipHardware {
        address: pkt.address,
        vendor: pkt.vendor,
        product: pkt.product,
        fw_version: pkt.fw_version,
        hw_version: pkt.hw_version,
    };

    client.set_state(ClientState::Announced);
    client.request_identify()
}

fn handle_status(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    let status = *payload.first().ok_or(GipError::ShortBody)?;

    if status & STATUS_CONNECTED == 0 {
        // schedule client removal
        debug!("client {}: disconnected", client.id());
        if let Some(adapter) = client.adapter() {
            adapter.unregister_client(client);
        }
        return Ok(());
    }

    let (battery_type, level) = decode_battery(status);
    client
        .with_driver(|driver| driver.battery(client, battery_type, level))
        .map(|_| ())
}

fn handle_identify(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if client.state() != ClientState::Announced {
        warn!("client {}: identify in invalid state", client.id());
        return Ok(());
    }

    let info = parse_identify(payload)?;
    *client.info.lock().unwrap() = info;

    if let Some(adapter) = client.adapter() {
        adapter.register_client(client);
    }

    Ok(())
}

fn handle_virtual_key(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if payload.len() < 2 {
        return Err(GipError::ShortBody);
    }

    // the only virtual key accessories report is the guide button
    let pressed = payload[1] != 0;
    client
        .with_driver(|driver| driver.guide_button(client, pressed))
        .map(|_| ())
}

fn handle_hid_report(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if client.state() != ClientState::Identified {
        return Ok(());
    }

    client
        .with_driver(|driver| driver.hid_report(client, payload))
        .map(|_| ())
}

fn handle_input(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    if client.state() != ClientState::Identified {
        return Ok(());
    }

    client
        .with_driver(|driver| driver.input(client, payload))
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::mock_adapter;
    use crate::bus::GipDriver;
    use crate::packet::{decode_packet, encode_packet, GIP_OPT_INTERNAL};
    use std::sync::Mutex;

    pub(crate) struct EventDriver {
        pub guide: Mutex<Vec<bool>>,
        pub battery: Mutex<Vec<(BatteryType, BatteryLevel)>>,
    }

    impl EventDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                guide: Mutex::new(Vec::new()),
                battery: Mutex::new(Vec::new()),
            })
        }
    }

    impl GipDriver for EventDriver {
        fn name(&self) -> &str {
            "events"
        }

        fn class(&self) -> &str {
            "Test.Events"
        }

        fn probe(&self, _client: &Arc<GipClient>) -> Result<()> {
            Ok(())
        }

        fn guide_button(&self, _client: &Arc<GipClient>, pressed: bool) -> Result<()> {
            self.guide.lock().unwrap().push(pressed);
            Ok(())
        }

        fn battery(
            &self,
            _client: &Arc<GipClient>,
            battery_type: BatteryType,
            level: BatteryLevel,
        ) -> Result<()> {
            self.battery.lock().unwrap().push((battery_type, level));
            Ok(())
        }
    }

    fn internal_packet(command: u8, client_id: u8, payload: &[u8]) -> Vec<u8> {
        let header = GipHeader {
            command,
            client_id,
            flags: GIP_OPT_INTERNAL,
            sequence: 0x31,
            length: payload.len(),
            chunk_offset: 0,
        };
        encode_packet(&header, payload).unwrap()
    }

    fn sample_announce() -> AnnouncePacket {
        AnnouncePacket {
            address: [0x02, 0x11, 0x22, 0x33, 0x44, 0x55],
            vendor: 0x045e,
            product: 0x02d1,
            fw_version: GipVersion {
                major: 5,
                minor: 11,
                build: 6603,
                revision: 0,
            },
            hw_version: GipVersion {
                major: 1,
                minor: 1,
                build: 1,
                revision: 0,
            },
        }
    }

    /// Identify blob with a single class string and one audio format pair
    pub(crate) fn sample_identify_blob(classes: &[&str], audio_formats: &[(u8, u8)]) -> Vec<u8> {
        let mut blob = vec![0u8; IDENTIFY_MIN_LEN];

        if !audio_formats.is_empty() {
            let off = blob.len() as u16;
            blob.push(audio_formats.len() as u8);
            for (inp, out) in audio_formats {
                blob.push(*inp);
                blob.push(*out);
            }
            blob[IDENTIFY_OFFSET_TABLE + 4..IDENTIFY_OFFSET_TABLE + 6]
                .copy_from_slice(&off.to_le_bytes());
        }

        if !classes.is_empty() {
            let off = blob.len() as u16;
            blob.push(classes.len() as u8);
            for class in classes {
                blob.extend_from_slice(&(class.len() as u16).to_le_bytes());
                blob.extend_from_slice(class.as_bytes());
            }
            blob[IDENTIFY_OFFSET_TABLE + 10..IDENTIFY_OFFSET_TABLE + 12]
                .copy_from_slice(&off.to_le_bytes());
        }

        blob
    }

    #[test]
    fn test_battery_decoding() {
        assert_eq!(decode_battery(0x80), (BatteryType::None, BatteryLevel::Low));
        assert_eq!(
            decode_battery(0x80 | 0x04 | 0x01),
            (BatteryType::Standard, BatteryLevel::Normal)
        );
        assert_eq!(
            decode_battery(0x80 | 0x08 | 0x03),
            (BatteryType::Kit, BatteryLevel::Full)
        );
        assert_eq!(
            decode_battery(0x80 | 0x0c | 0x02),
            (BatteryType::Unknown, BatteryLevel::High)
        );
    }

    #[test]
    fn test_announce_roundtrip() {
        let pkt = sample_announce();
        let encoded = pkt.encode();
        assert_eq!(encoded.len(), AnnouncePacket::LEN);
        assert_eq!(AnnouncePacket::parse(&encoded).unwrap(), pkt);
    }

    #[test]
    fn test_announce_transitions_and_requests_identify() {
        let (adapter, ops) = mock_adapter(1);

        let pkt = internal_packet(GIP_CMD_ANNOUNCE, 0, &sample_announce().encode());
        adapter.process_buffer(&pkt).unwrap();

        let client = adapter.client(0).unwrap();
        assert_eq!(client.state(), ClientState::Announced);
        assert_eq!(client.hardware().vendor, 0x045e);
        assert_eq!(client.hardware().address, [0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

        let sent = ops.sent_packets();
        assert_eq!(sent.len(), 1);
        let (hdr, payload) = decode_packet(&sent[0]).unwrap();
        assert_eq!(hdr.command, GIP_CMD_IDENTIFY);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_announce_only_from_connected() {
        let (adapter, ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);

        let pkt = internal_packet(GIP_CMD_ANNOUNCE, 0, &sample_announce().encode());
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(client.state(), ClientState::Identified);
        assert!(ops.sent_packets().is_empty());
    }

    #[test]
    fn test_malformed_announce_keeps_state() {
        let (adapter, _ops) = mock_adapter(1);

        let pkt = internal_packet(GIP_CMD_ANNOUNCE, 0, &[0u8; 5]);
        assert!(adapter.process_buffer(&pkt).is_err());
        assert_eq!(adapter.client(0).unwrap().state(), ClientState::Connected);
    }

    #[test]
    fn test_identify_parses_tables() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Announced);

        let blob = sample_identify_blob(&["Windows.Xbox.Input.Gamepad"], &[(0x09, 0x10)]);
        let pkt = internal_packet(GIP_CMD_IDENTIFY, 0, &blob);
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(client.state(), ClientState::Identified);
        let info = client.info();
        assert_eq!(info.classes, vec!["Windows.Xbox.Input.Gamepad".to_string()]);
        assert_eq!(info.audio_formats, Some(vec![(0x09, 0x10)]));
        assert!(info.hid_descriptor.is_none());
    }

    #[test]
    fn test_identify_with_no_classes() {
        // zero classes offset yields an identified client with no classes
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Announced);

        let blob = sample_identify_blob(&[], &[]);
        let pkt = internal_packet(GIP_CMD_IDENTIFY, 0, &blob);
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(client.state(), ClientState::Identified);
        assert!(client.info().classes.is_empty());
    }

    #[test]
    fn test_identify_rejects_bad_offsets() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Announced);

        let mut blob = sample_identify_blob(&[], &[]);
        // point the hid descriptor table past the end of the blob
        let bad = (blob.len() as u16 + 40).to_le_bytes();
        blob[IDENTIFY_OFFSET_TABLE + 14..IDENTIFY_OFFSET_TABLE + 16].copy_from_slice(&bad);

        let pkt = internal_packet(GIP_CMD_IDENTIFY, 0, &blob);
        assert!(matches!(
            adapter.process_buffer(&pkt),
            Err(GipError::MalformedIdentify(_))
        ));
        assert_eq!(client.state(), ClientState::Announced);
    }

    #[test]
    fn test_status_disconnect_exactly_once() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);

        let pkt = internal_packet(GIP_CMD_STATUS, 0, &[0x00, 0, 0, 0]);
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(adapter.client_count(), 0);

        // replayed status packets find a fresh slot but cause no transition
        // beyond the usual on-demand creation
        adapter.process_buffer(&pkt).unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_status_reports_battery() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = EventDriver::new();
        client.bind_driver_for_test(driver.clone());

        let pkt = internal_packet(GIP_CMD_STATUS, 0, &[0x80 | 0x04 | 0x02, 0, 0, 0]);
        adapter.process_buffer(&pkt).unwrap();

        assert_eq!(
            driver.battery.lock().unwrap().as_slice(),
            &[(BatteryType::Standard, BatteryLevel::High)]
        );
    }

    #[test]
    fn test_virtual_key_forwards_guide_button() {
        let (adapter, _ops) = mock_adapter(1);
        let client = adapter.get_or_init_client(0).unwrap();
        client.set_state(ClientState::Identified);
        let driver = EventDriver::new();
        client.bind_driver_for_test(driver.clone());

        adapter
            .process_buffer(&internal_packet(GIP_CMD_VIRTUAL_KEY, 0, &[0x01, 0x01]))
            .unwrap();
        adapter
            .process_buffer(&internal_packet(GIP_CMD_VIRTUAL_KEY, 0, &[0x01, 0x00]))
            .unwrap();

        assert_eq!(driver.guide.lock().unwrap().as_slice(), &[true, false]);
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let (adapter, _ops) = mock_adapter(1);
        let pkt = internal_packet(0x55, 0, &[1, 2, 3]);
        adapter.process_buffer(&pkt).unwrap();
    }
}
