//! GIP adapter and client management
//!
//! An adapter multiplexes up to sixteen logical clients behind a single
//! transport. Clients walk the lifecycle Connected -> Announced ->
//! Identified -> Disconnected; on identification the bus matches a driver by
//! class string and runs its probe on the adapter's ordered work queue, so
//! state transitions for a client are never reordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::AudioConfig;
use crate::auth::GipAuth;
use crate::framing::ChunkBuffer;
use crate::messages::{BatteryLevel, BatteryType, PowerMode};
use crate::{GipError, Result, GIP_MAX_CLIENTS};

/// Transport buffer classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GipBufferKind {
    Data,
    Audio,
}

/// A transmit buffer owned by the transport.
///
/// `data` is the writable region handed out by `get_buffer`; the framing
/// layer fills it and records the used byte count in `length` before handing
/// the buffer back through `submit_buffer`. `context` is opaque to the core.
#[derive(Debug)]
pub struct GipBuffer {
    pub kind: GipBufferKind,
    pub data: Vec<u8>,
    pub length: usize,
    pub context: u64,
}

impl GipBuffer {
    pub fn new(kind: GipBufferKind, capacity: usize) -> Self {
        Self {
            kind,
            data: vec![0; capacity],
            length: 0,
            context: 0,
        }
    }
}

/// Operations a transport provides to the adapter.
///
/// Audio and encryption entry points are optional; transports without the
/// capability report `Unsupported`.
pub trait GipAdapterOps: Send + Sync {
    fn get_buffer(&self, kind: GipBufferKind) -> Result<GipBuffer>;
    fn submit_buffer(&self, buf: GipBuffer) -> Result<()>;

    fn enable_audio(&self) -> Result<()> {
        Err(GipError::Unsupported)
    }

    fn init_audio_in(&self) -> Result<()> {
        Err(GipError::Unsupported)
    }

    fn init_audio_out(&self, _packet_size: usize) -> Result<()> {
        Err(GipError::Unsupported)
    }

    fn disable_audio(&self) -> Result<()> {
        Err(GipError::Unsupported)
    }

    fn set_encryption_key(&self, _key: &[u8; 16]) -> Result<()> {
        Err(GipError::Unsupported)
    }
}

/// Client lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    /// First packet seen, nothing known about the device yet
    Connected,
    /// Announce received, identification requested
    Announced,
    /// Identify reply parsed, client is fully operational
    Identified,
    /// Device gone; terminal
    Disconnected,
}

/// Firmware or hardware version quadruple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GipVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

/// Hardware identity reported by the announce packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GipHardware {
    pub address: [u8; 6],
    pub vendor: u16,
    pub product: u16,
    pub fw_version: GipVersion,
    pub hw_version: GipVersion,
}

/// Tables parsed out of the identify blob; absent tables stay `None`
#[derive(Debug, Clone, Default)]
pub struct GipClientInfo {
    /// Raw 24-byte external command descriptors
    pub external_commands: Option<Vec<u8>>,
    /// Raw 4-byte firmware version entries
    pub firmware_versions: Option<Vec<u8>>,
    /// (input, output) audio format pairs
    pub audio_formats: Option<Vec<(u8, u8)>>,
    pub capabilities_out: Option<Vec<u8>>,
    pub capabilities_in: Option<Vec<u8>>,
    /// UTF-8 class strings used for driver matching
    pub classes: Vec<String>,
    /// Interface GUIDs
    pub interfaces: Option<Vec<[u8; 16]>>,
    pub hid_descriptor: Option<Vec<u8>>,
}

/// Device driver bound to a client by class string.
///
/// `probe` and `remove` run on the adapter's work queue while holding the
/// client's driver slot exclusively; the per-packet operations run under a
/// shared borrow of the slot, so an in-flight callback blocks removal.
pub trait GipDriver: Send + Sync {
    fn name(&self) -> &str;
    fn class(&self) -> &str;

    fn probe(&self, client: &Arc<GipClient>) -> Result<()>;

    fn remove(&self, _client: &Arc<GipClient>) {}

    fn battery(
        &self,
        _client: &Arc<GipClient>,
        _battery_type: BatteryType,
        _level: BatteryLevel,
    ) -> Result<()> {
        Ok(())
    }

    fn guide_button(&self, _client: &Arc<GipClient>, _pressed: bool) -> Result<()> {
        Ok(())
    }

    fn audio_ready(&self, _client: &Arc<GipClient>) -> Result<()> {
        Ok(())
    }

    fn audio_volume(&self, _client: &Arc<GipClient>, _in_level: u8, _out_level: u8) -> Result<()> {
        Ok(())
    }

    fn hid_report(&self, _client: &Arc<GipClient>, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn input(&self, _client: &Arc<GipClient>, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn audio_samples(&self, _client: &Arc<GipClient>, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Work items processed in order by the adapter's state queue
#[derive(Debug, Clone, Copy)]
pub(crate) enum ClientWork {
    Register(u8),
    Unregister(u8),
    AuthRsaExchange(u8),
    AuthEcdhExchange(u8),
    AuthComplete(u8),
}

/// TX sequence counters, guarded together with buffer submission
#[derive(Debug, Default)]
pub(crate) struct Sequences {
    pub data: u8,
    pub audio: u8,
}

/// A single GIP client slot on an adapter
pub struct GipClient {
    id: u8,
    adapter: Weak<GipAdapter>,

    pub(crate) state: Mutex<ClientState>,
    pub(crate) chunk_buf: Mutex<Option<ChunkBuffer>>,
    pub(crate) hardware: Mutex<GipHardware>,
    pub(crate) info: Mutex<GipClientInfo>,
    pub(crate) audio_config_in: Mutex<AudioConfig>,
    pub(crate) audio_config_out: Mutex<AudioConfig>,
    pub(crate) auth: Mutex<GipAuth>,

    driver: RwLock<Option<Arc<dyn GipDriver>>>,
}

impl GipClient {
    fn new(adapter: &GipAdapter, id: u8) -> Arc<Self> {
        debug!("gip{}.{}: initialized", adapter.id, id);

        Arc::new(Self {
            id,
            adapter: adapter.weak_self.clone(),
            state: Mutex::new(ClientState::Connected),
            chunk_buf: Mutex::new(None),
            hardware: Mutex::new(GipHardware::default()),
            info: Mutex::new(GipClientInfo::default()),
            audio_config_in: Mutex::new(AudioConfig::default()),
            audio_config_out: Mutex::new(AudioConfig::default()),
            auth: Mutex::new(GipAuth::default()),
            driver: RwLock::new(None),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Owning adapter; `None` once the adapter has been torn down
    pub fn adapter(&self) -> Option<Arc<GipAdapter>> {
        self.adapter.upgrade()
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn hardware(&self) -> GipHardware {
        *self.hardware.lock().unwrap()
    }

    pub fn info(&self) -> GipClientInfo {
        self.info.lock().unwrap().clone()
    }

    /// Number of audio packets per transmit buffer on the owning adapter
    pub fn audio_packet_count(&self) -> usize {
        self.adapter().map_or(1, |a| a.audio_packet_count)
    }

    /// Run a driver operation under a shared borrow of the driver slot.
    ///
    /// Returns `Ok(None)` when no driver is bound.
    pub(crate) fn with_driver<R>(
        &self,
        f: impl FnOnce(&Arc<dyn GipDriver>) -> Result<R>,
    ) -> Result<Option<R>> {
        let guard = self.driver.read().unwrap();
        match guard.as_ref() {
            Some(driver) => f(driver).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_driver(&self) -> bool {
        self.driver.read().unwrap().is_some()
    }

    /// Queue deferred work for this client on the adapter's state queue
    pub(crate) fn queue_work(&self, work: ClientWork) {
        if let Some(adapter) = self.adapter() {
            adapter.queue_work(work);
        }
    }

    /// Bind a driver directly, bypassing class matching
    #[cfg(test)]
    pub(crate) fn bind_driver_for_test(&self, driver: Arc<dyn GipDriver>) {
        *self.driver.write().unwrap() = Some(driver);
    }
}

/// A GIP adapter: one per transport instance
pub struct GipAdapter {
    pub(crate) id: usize,
    pub(crate) ops: Box<dyn GipAdapterOps>,
    pub(crate) audio_packet_count: usize,
    weak_self: Weak<GipAdapter>,

    clients: Mutex<[Option<Arc<GipClient>>; GIP_MAX_CLIENTS]>,
    pub(crate) sequences: Mutex<Sequences>,

    drivers: RwLock<Vec<Arc<dyn GipDriver>>>,

    work_tx: mpsc::UnboundedSender<ClientWork>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientWork>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl GipAdapter {
    /// Create an adapter over the given transport operations.
    ///
    /// `audio_packet_count` is the number of audio fragments per transmit
    /// buffer and must be at least one.
    pub fn new(id: usize, ops: Box<dyn GipAdapterOps>, audio_packet_count: usize) -> Arc<Self> {
        assert!(audio_packet_count >= 1);

        let (work_tx, work_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak| Self {
            id,
            ops,
            audio_packet_count,
            weak_self: weak.clone(),
            clients: Mutex::new(Default::default()),
            sequences: Mutex::new(Sequences::default()),
            drivers: RwLock::new(Vec::new()),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            worker: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start the ordered state queue worker. Must be called from within a
    /// tokio runtime before clients can be registered.
    pub fn start(&self) {
        let mut rx = match self.work_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let adapter = match self.weak_self.upgrade() {
            Some(adapter) => adapter,
            None => return,
        };
        let handle = tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                adapter.run_work(work);
            }
        });

        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Add a driver to the adapter's registry
    pub fn register_driver(&self, driver: Arc<dyn GipDriver>) {
        self.drivers.write().unwrap().push(driver);
    }

    pub fn client(&self, id: u8) -> Option<Arc<GipClient>> {
        self.clients
            .lock()
            .unwrap()
            .get(id as usize)
            .and_then(|slot| slot.clone())
    }

    /// Look up a client slot, creating it in `Connected` state on demand
    pub(crate) fn get_or_init_client(&self, id: u8) -> Result<Arc<GipClient>> {
        if id as usize >= GIP_MAX_CLIENTS {
            return Err(GipError::MalformedHeader);
        }

        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = &clients[id as usize] {
            return Ok(Arc::clone(client));
        }

        let client = GipClient::new(self, id);
        clients[id as usize] = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Number of occupied client slots
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub(crate) fn queue_work(&self, work: ClientWork) {
        // send only fails after shutdown, when the work is moot anyway
        let _ = self.work_tx.send(work);
    }

    /// Move a client to `Identified` and schedule driver registration
    pub(crate) fn register_client(&self, client: &GipClient) {
        client.set_state(ClientState::Identified);
        self.queue_work(ClientWork::Register(client.id()));
    }

    /// Move a client to `Disconnected`, drop its slot and schedule driver
    /// removal. Repeated calls are a no-op.
    pub(crate) fn unregister_client(&self, client: &Arc<GipClient>) {
        if client.state() == ClientState::Disconnected {
            return;
        }

        client.set_state(ClientState::Disconnected);
        self.clients.lock().unwrap()[client.id() as usize] = None;
        self.queue_work(ClientWork::Unregister(client.id()));
    }

    fn run_work(&self, work: ClientWork) {
        match work {
            ClientWork::Register(id) => {
                if let Some(client) = self.client(id) {
                    self.run_register(&client);
                }
            }
            ClientWork::Unregister(id) => {
                // the slot is already vacated; removal only needs the driver
                debug!("gip{}.{}: removed", self.id, id);
            }
            ClientWork::AuthRsaExchange(id) => {
                if let Some(client) = self.client(id) {
                    crate::auth::run_rsa_exchange(&client);
                }
            }
            ClientWork::AuthEcdhExchange(id) => {
                if let Some(client) = self.client(id) {
                    crate::auth::run_ecdh_exchange(&client);
                }
            }
            ClientWork::AuthComplete(id) => {
                if let Some(client) = self.client(id) {
                    crate::auth::run_complete(&client);
                }
            }
        }
    }

    fn run_register(&self, client: &Arc<GipClient>) {
        let classes = client.info.lock().unwrap().classes.clone();
        let driver = {
            let drivers = self.drivers.read().unwrap();
            drivers
                .iter()
                .find(|drv| classes.iter().any(|class| class == drv.class()))
                .cloned()
        };

        let driver = match driver {
            Some(driver) => driver,
            None => {
                debug!("gip{}.{}: no driver for {:?}", self.id, client.id(), classes);
                return;
            }
        };

        {
            let mut slot = client.driver.write().unwrap();
            if slot.is_some() {
                return;
            }

            if let Err(err) = driver.probe(client) {
                error!("gip{}.{}: probe failed: {}", self.id, client.id(), err);
                return;
            }

            *slot = Some(Arc::clone(&driver));
        }

        debug!("gip{}.{}: bound to {}", self.id, client.id(), driver.name());

        if let Err(err) = crate::auth::start_handshake(client) {
            error!("gip{}.{}: handshake start failed: {}", self.id, client.id(), err);
        }
    }

    /// Send Power(Off) to the main client
    pub fn power_off(&self) -> Result<()> {
        match self.client(0) {
            Some(client) => client.set_power_mode(PowerMode::Off),
            None => Ok(()),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Tear the adapter down: stop the work queue, detach drivers and drop
    /// all client slots. Pending crypto work is cancelled with the queue.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);

        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }

        let slots: Vec<Arc<GipClient>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.iter_mut().rev().filter_map(|slot| slot.take()).collect()
        };

        for client in slots {
            client.set_state(ClientState::Disconnected);
            client.chunk_buf.lock().unwrap().take();

            let driver = client.driver.write().unwrap().take();
            if let Some(driver) = driver {
                driver.remove(&client);
            }
        }

        if let Err(err) = self.ops.disable_audio() {
            debug!("gip{}: disable audio: {}", self.id, err);
        }

        debug!("gip{}: unregistered", self.id);
    }
}

impl Drop for GipAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}
