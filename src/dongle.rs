//! Wireless dongle client multiplexer
//!
//! The dongle presents every associated accessory as its own GIP adapter.
//! 802.11 association requests allocate a wireless client id (WCID), build
//! the adapter and program the radio MAC; disassociation, client-lost events
//! and teardown destroy it again. All association, disassociation, pairing
//! and encryption changes funnel through one ordered event queue so WCID
//! allocation and the radio MAC stay in lockstep; the receive path only
//! allocates event records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use gip802::frame::{FrameKind, Header3Addr, QosHeader};
use gip802::mt76::{self, DmaPort, FirmwareEvent, RadioLedMode, Rxwi, Txwi};

use crate::bus::{GipAdapter, GipAdapterOps, GipBuffer, GipBufferKind, GipDriver};
use crate::{GipError, Result, GIP_MAX_CLIENTS};

/// Pairing mode switches off automatically after this long
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Waiting for accessories to power off is bounded
const POWER_OFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload capacity handed to the framing layer per transmit buffer
const DONGLE_TX_CAPACITY: usize = 2048;

/// Fragments per audio transmit buffer on dongle links
const DONGLE_AUDIO_PACKETS: usize = 1;

/// Byte 0 of the WCID transmit descriptor selects the firmware queue
const QUEUE_ID_DATA: u8 = 0x00;
const QUEUE_ID_AUDIO: u8 = 0x02;

/// Pair request command carried in reserved management frames
const CLIENT_PAIR_REQUEST: u8 = 0x01;

/// Radio MAC operations the dongle core drives.
///
/// Implemented by the USB radio driver; the async entry points run on the
/// dongle's event worker.
#[async_trait]
pub trait RadioMac: Send + Sync {
    /// MAC address of the dongle itself
    fn address(&self) -> [u8; 6];

    async fn associate_client(&self, wcid: u8, addr: [u8; 6]) -> Result<()>;
    async fn remove_client(&self, wcid: u8) -> Result<()>;
    async fn pair_client(&self, addr: [u8; 6]) -> Result<()>;
    async fn set_pairing(&self, enable: bool) -> Result<()>;
    async fn set_led_mode(&self, mode: RadioLedMode) -> Result<()>;
    async fn set_client_key(&self, wcid: u8, key: [u8; 16]) -> Result<()>;

    /// Queue a prepared DMA message on the TX bulk endpoint
    fn submit_frame(&self, data: Vec<u8>) -> Result<()>;

    /// Runtime power management references
    fn wake_acquire(&self) {}
    fn wake_release(&self) {}
}

/// Events processed in order by the dongle worker
enum DongleEvent {
    /// Raw DMA message from the receive path
    Message(Vec<u8>),
    SetPairing(bool),
    EnableEncryption { wcid: u8, key: [u8; 16] },
}

/// One associated accessory
struct DongleClient {
    wcid: u8,
    address: [u8; 6],
    encrypted: Arc<AtomicBool>,
    adapter: Arc<GipAdapter>,
}

/// Adapter transport backed by the dongle's radio link
struct DongleAdapterOps {
    radio: Arc<dyn RadioMac>,
    wcid: u8,
    address: [u8; 6],
    encrypted: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<DongleEvent>,
}

impl GipAdapterOps for DongleAdapterOps {
    fn get_buffer(&self, kind: GipBufferKind) -> Result<GipBuffer> {
        Ok(GipBuffer::new(kind, DONGLE_TX_CAPACITY))
    }

    fn submit_buffer(&self, buf: GipBuffer) -> Result<()> {
        let gip = &buf.data[..buf.length];
        let protected = self.encrypted.load(Ordering::Relaxed);

        let queue = match buf.kind {
            GipBufferKind::Data => QUEUE_ID_DATA,
            GipBufferKind::Audio => QUEUE_ID_AUDIO,
        };

        // WCID descriptor + TXWI + QoS header + padding + payload
        let qos = QosHeader::downlink(self.address, self.radio.address(), protected);
        let txwi = Txwi::downlink((QosHeader::LEN + gip.len()) as u16);

        let mut body = Vec::with_capacity(8 + Txwi::LEN + QosHeader::LEN + 2 + gip.len());
        body.extend_from_slice(&[queue, 0x00, 0x00, self.wcid - 1, 0x00, 0x00, 0x00, 0x00]);
        txwi.put(&mut body);
        qos.put(&mut body);
        body.extend_from_slice(&[0x00, 0x00]);
        body.extend_from_slice(gip);

        self.radio.submit_frame(mt76::wrap_command(&body, 0))
    }

    fn enable_audio(&self) -> Result<()> {
        Ok(())
    }

    fn init_audio_in(&self) -> Result<()> {
        Ok(())
    }

    fn init_audio_out(&self, _packet_size: usize) -> Result<()> {
        Ok(())
    }

    fn disable_audio(&self) -> Result<()> {
        Ok(())
    }

    fn set_encryption_key(&self, key: &[u8; 16]) -> Result<()> {
        self.event_tx
            .send(DongleEvent::EnableEncryption {
                wcid: self.wcid,
                key: *key,
            })
            .map_err(|_| GipError::Unsupported)
    }
}

/// The wireless dongle: demultiplexes radio traffic into per-WCID adapters
pub struct GipDongle {
    radio: Arc<dyn RadioMac>,
    weak_self: std::sync::Weak<GipDongle>,

    clients: Mutex<[Option<DongleClient>; GIP_MAX_CLIENTS]>,
    drivers: Mutex<Vec<Arc<dyn GipDriver>>>,

    /// Pairing state; mutated only on the event worker
    pairing: Mutex<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,

    event_tx: mpsc::UnboundedSender<DongleEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DongleEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    /// Signalled whenever the last client disappears
    all_gone: Notify,
}

impl GipDongle {
    pub fn new(radio: Arc<dyn RadioMac>) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak| Self {
            radio,
            weak_self: weak.clone(),
            clients: Mutex::new(Default::default()),
            drivers: Mutex::new(Vec::new()),
            pairing: Mutex::new(false),
            watchdog: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            worker: Mutex::new(None),
            all_gone: Notify::new(),
        })
    }

    /// Drivers registered here are offered to every future client adapter
    pub fn register_driver(&self, driver: Arc<dyn GipDriver>) {
        self.drivers.lock().unwrap().push(driver);
    }

    /// Start the event worker. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut rx = match self.event_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let dongle = match self.weak_self.upgrade() {
            Some(dongle) => dongle,
            None => return,
        };
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = dongle.process_event(event).await {
                    error!("dongle: event failed: {}", err);
                }
            }
        });

        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Hand one received DMA message to the dongle. Safe to call from a
    /// completion context; only an event record is allocated here.
    pub fn push_message(&self, data: Vec<u8>) {
        let _ = self.event_tx.send(DongleEvent::Message(data));
    }

    /// Toggle pairing mode from the control surface
    pub fn set_pairing(&self, enable: bool) {
        let _ = self.event_tx.send(DongleEvent::SetPairing(enable));
    }

    pub fn pairing(&self) -> bool {
        *self.pairing.lock().unwrap()
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Power off every accessory and wait for the association records to
    /// drain. A timeout surfaces as an error, but teardown may proceed.
    pub async fn power_off(&self) -> Result<()> {
        let adapters: Vec<Arc<GipAdapter>> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|client| Arc::clone(&client.adapter))
            .collect();

        for adapter in adapters {
            if let Err(err) = adapter.power_off() {
                warn!("dongle: power off failed: {}", err);
            }
        }

        let drained = tokio::time::timeout(POWER_OFF_TIMEOUT, async {
            loop {
                let notified = self.all_gone.notified();
                if self.client_count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;

        drained.map_err(|_| GipError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))
    }

    /// Tear the dongle down, destroying all client adapters
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }

        let mut clients = self.clients.lock().unwrap();
        for slot in clients.iter_mut() {
            if let Some(client) = slot.take() {
                client.adapter.shutdown();
            }
        }
    }

    async fn process_event(&self, event: DongleEvent) -> Result<()> {
        match event {
            DongleEvent::Message(data) => self.process_message(&data).await,
            DongleEvent::SetPairing(enable) => self.toggle_pairing(enable).await,
            DongleEvent::EnableEncryption { wcid, key } => {
                self.enable_encryption(wcid, key).await
            }
        }
    }

    async fn process_message(&self, data: &[u8]) -> Result<()> {
        let (info, body) = mt76::unwrap_message(data)?;

        // ignore command responses
        if info.cmd_seq() == 0x01 {
            return Ok(());
        }

        match info.port() {
            DmaPort::Wlan => self.process_wlan(body).await,
            DmaPort::CpuRx => match info.event() {
                FirmwareEvent::Button => self.toggle_pairing(true).await,
                FirmwareEvent::PacketRx => self.process_wlan(body).await,
                FirmwareEvent::ClientLost => {
                    let wcid = *body.first().ok_or(GipError::MalformedHeader)?;
                    debug!("dongle: client lost: wcid={}", wcid);
                    self.handle_disassociation(wcid).await
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    async fn process_wlan(&self, body: &[u8]) -> Result<()> {
        let rxwi = Rxwi::parse(body)?;
        let mut frame = body[Rxwi::LEN..].to_vec();

        let hdr = Header3Addr::parse(&frame)?;
        let kind = hdr.kind();

        // 2 bytes of padding after the 802.11 header
        if rxwi.l2pad() {
            let hdr_len = match kind {
                FrameKind::QosData => QosHeader::LEN,
                _ => Header3Addr::LEN,
            };
            if frame.len() < hdr_len + 2 {
                return Err(GipError::MalformedHeader);
            }
            frame.drain(hdr_len..hdr_len + 2);
        }

        if frame.len() > rxwi.mpdu_len() {
            frame.truncate(rxwi.mpdu_len());
        }

        match kind {
            FrameKind::QosData => {
                if frame.len() < QosHeader::LEN {
                    return Err(GipError::MalformedHeader);
                }
                self.handle_qos_data(rxwi.wcid(), &frame[QosHeader::LEN..])
            }
            FrameKind::AssocReq => self.handle_association(hdr.addr2).await,
            FrameKind::Disassoc => self.handle_disassociation(rxwi.wcid()).await,
            FrameKind::Reserved => self.handle_reserved(rxwi.wcid(), hdr.addr2, &frame).await,
            FrameKind::Other => Ok(()),
        }
    }

    fn handle_qos_data(&self, wcid: u8, gip: &[u8]) -> Result<()> {
        if wcid == 0 || wcid as usize > GIP_MAX_CLIENTS {
            return Ok(());
        }

        let adapter = {
            let clients = self.clients.lock().unwrap();
            match &clients[wcid as usize - 1] {
                Some(client) => Arc::clone(&client.adapter),
                None => return Ok(()),
            }
        };

        adapter.process_buffer(gip)
    }

    async fn handle_association(&self, addr: [u8; 6]) -> Result<()> {
        let wcid = {
            let clients = self.clients.lock().unwrap();

            // one record per MAC: repeated requests are absorbed
            if clients
                .iter()
                .flatten()
                .any(|client| client.address == addr)
            {
                return Ok(());
            }

            match clients.iter().position(|slot| slot.is_none()) {
                Some(index) => index as u8 + 1,
                None => return Err(GipError::NoWcid),
            }
        };

        let encrypted = Arc::new(AtomicBool::new(false));
        let ops = DongleAdapterOps {
            radio: Arc::clone(&self.radio),
            wcid,
            address: addr,
            encrypted: Arc::clone(&encrypted),
            event_tx: self.event_tx.clone(),
        };

        let adapter = GipAdapter::new(wcid as usize, Box::new(ops), DONGLE_AUDIO_PACKETS);
        for driver in self.drivers.lock().unwrap().iter() {
            adapter.register_driver(Arc::clone(driver));
        }
        adapter.start();

        if let Err(err) = self.radio.associate_client(wcid, addr).await {
            adapter.shutdown();
            return Err(err);
        }

        // pairing mode keeps the LED blinking
        if !self.pairing() {
            self.radio.set_led_mode(RadioLedMode::On).await?;
        }

        self.radio.wake_acquire();

        debug!("dongle: associated: wcid={}, address={:02x?}", wcid, addr);
        self.clients.lock().unwrap()[wcid as usize - 1] = Some(DongleClient {
            wcid,
            address: addr,
            encrypted,
            adapter,
        });

        Ok(())
    }

    async fn handle_disassociation(&self, wcid: u8) -> Result<()> {
        if wcid == 0 || wcid as usize > GIP_MAX_CLIENTS {
            return Ok(());
        }

        // repeated disassociations for an unknown WCID are a no-op
        let client = match self.clients.lock().unwrap()[wcid as usize - 1].take() {
            Some(client) => client,
            None => return Ok(()),
        };

        debug!(
            "dongle: disassociated: wcid={}, address={:02x?}",
            client.wcid, client.address
        );

        client.adapter.shutdown();
        self.radio.remove_client(wcid).await?;
        self.radio.wake_release();

        if self.client_count() == 0 {
            self.all_gone.notify_waiters();

            if !self.pairing() {
                self.radio.set_led_mode(RadioLedMode::Off).await?;
            }
        }

        Ok(())
    }

    async fn handle_reserved(&self, wcid: u8, addr: [u8; 6], frame: &[u8]) -> Result<()> {
        let body = match frame.get(Header3Addr::LEN..) {
            Some(body) if body.len() >= 2 => body,
            _ => return Err(GipError::MalformedHeader),
        };

        if body[1] != CLIENT_PAIR_REQUEST {
            return Ok(());
        }

        debug!("dongle: pair request: wcid={}, address={:02x?}", wcid, addr);
        self.radio.pair_client(addr).await?;
        self.toggle_pairing(false).await
    }

    async fn toggle_pairing(&self, enable: bool) -> Result<()> {
        let was_enabled = self.pairing();

        // pairing is already enabled
        if was_enabled && enable {
            return Ok(());
        }

        self.radio.set_pairing(enable).await?;

        let mode = if enable {
            RadioLedMode::Blink
        } else if self.client_count() > 0 {
            RadioLedMode::On
        } else {
            RadioLedMode::Off
        };
        self.radio.set_led_mode(mode).await?;

        *self.pairing.lock().unwrap() = enable;
        debug!("dongle: pairing enabled={}", enable);

        let mut watchdog = self.watchdog.lock().unwrap();
        if enable {
            self.radio.wake_acquire();

            let event_tx = self.event_tx.clone();
            if let Some(handle) = watchdog.replace(tokio::spawn(async move {
                tokio::time::sleep(PAIRING_TIMEOUT).await;
                let _ = event_tx.send(DongleEvent::SetPairing(false));
            })) {
                handle.abort();
            }
        } else {
            if let Some(handle) = watchdog.take() {
                handle.abort();
            }
            if was_enabled {
                self.radio.wake_release();
            }
        }

        Ok(())
    }

    async fn enable_encryption(&self, wcid: u8, key: [u8; 16]) -> Result<()> {
        self.radio.set_client_key(wcid, key).await?;

        if let Some(client) = &self.clients.lock().unwrap()[wcid as usize - 1] {
            client.encrypted.store(true, Ordering::Relaxed);
        }

        Ok(())
    }
}
