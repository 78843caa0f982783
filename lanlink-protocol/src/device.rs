//! Device State Management
//!
//! A [`Device`] is the local view of one peer: its latest identity, pairing
//! state, the single attached channel and the open transfers. Devices are
//! shared as `Arc<Device>` and synchronise internally.
//!
//! ## Device Lifecycle
//!
//! 1. **Discovery**: created from an identity (UDP broadcast or inbound TCP)
//! 2. **Connected**: a channel is attached; actions are evaluated
//! 3. **Pairing**: the channel's certificate is pinned in the trust store
//! 4. **Disconnected**: the channel's cancellation token fired
//!
//! ## Events
//!
//! Lifecycle transitions are published on a per-device broadcast channel
//! ([`Device::subscribe`]).
//!
//! ## Device Registry
//!
//! The [`DeviceRegistry`] keeps every known device keyed by device id and
//! persists paired devices across restarts.

use crate::capability::{ActionStates, PeerCapabilities, PluginRegistry};
use crate::channel::Direction;
use crate::identity::{DeviceInfo, DeviceType};
use crate::trust::TrustStore;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of event broadcast channels
const EVENT_CAPACITY: usize = 64;

/// Receives packets read from an attached channel
///
/// Errors are logged per packet and never end the read loop.
#[async_trait]
pub trait PacketRouter: Send + Sync {
    async fn route(&self, device_id: &str, packet: Packet) -> Result<()>;
}

/// Lifecycle events of one device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected {
        device_id: String,
    },
    Disconnected {
        device_id: String,
    },
    CapabilitiesChanged {
        device_id: String,
        incoming: Vec<String>,
        outgoing: Vec<String>,
    },
    /// Enabled actions as `plugin.action`
    ActionsChanged {
        device_id: String,
        enabled: Vec<String>,
    },
    PairedChanged {
        device_id: String,
        paired: bool,
    },
}

/// A device's exclusive handle on its attached channel
pub struct ChannelHandle {
    id: u64,
    direction: Direction,
    host: IpAddr,
    certificate: Vec<u8>,
    cancel: CancellationToken,
    sender: mpsc::UnboundedSender<Packet>,
    listener: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        host: IpAddr,
        certificate: Vec<u8>,
        cancel: CancellationToken,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Self {
        Self {
            id,
            direction,
            host,
            certificate,
            cancel,
            sender,
            listener: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop marking the device disconnected when this channel closes
    fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    /// Detach, then cancel
    fn close(mut self) {
        self.detach();
        self.cancel.cancel();
    }
}

struct DeviceState {
    info: DeviceInfo,
    paired: bool,
    connected: bool,
    last_seen: i64,
    channel: Option<ChannelHandle>,
    actions: ActionStates,
}

/// Transfer registered on a device
#[derive(Debug, Clone)]
pub struct TransferEntry {
    pub size: u64,
    pub cancel: CancellationToken,
}

/// Complete device state
pub struct Device {
    id: String,
    plugins: Arc<PluginRegistry>,
    trust: Arc<TrustStore>,
    state: RwLock<DeviceState>,
    transfers: Mutex<HashMap<Uuid, TransferEntry>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Device {
    /// Create a device from an identity
    ///
    /// The device starts paired if the trust store holds a pinned certificate for it.
    pub fn new(info: DeviceInfo, plugins: Arc<PluginRegistry>, trust: Arc<TrustStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let paired = trust.pinned_certificate(&info.device_id).is_some();
        let actions = plugins.disabled_actions();

        Arc::new(Self {
            id: info.device_id.clone(),
            plugins,
            trust,
            state: RwLock::new(DeviceState {
                info,
                paired,
                connected: false,
                last_seen: crate::current_timestamp(),
                channel: None,
                actions,
            }),
            transfers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Get device ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get device name
    pub async fn name(&self) -> String {
        self.state.read().await.info.device_name.clone()
    }

    pub async fn device_type(&self) -> DeviceType {
        self.state.read().await.info.device_type
    }

    /// Latest identity of the device
    pub async fn info(&self) -> DeviceInfo {
        self.state.read().await.info.clone()
    }

    /// Address the device was last seen at
    pub async fn host(&self) -> Option<IpAddr> {
        let state = self.state.read().await;
        state
            .channel
            .as_ref()
            .map(|c| c.host)
            .or(state.info.tcp_host)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    pub async fn is_paired(&self) -> bool {
        self.state.read().await.paired
    }

    pub async fn last_seen(&self) -> i64 {
        self.state.read().await.last_seen
    }

    /// Id of the attached channel, if any
    pub async fn channel_id(&self) -> Option<u64> {
        self.state.read().await.channel.as_ref().map(|c| c.id)
    }

    /// Direction of the attached channel while it is open
    pub async fn channel_direction(&self) -> Option<Direction> {
        self.state
            .read()
            .await
            .channel
            .as_ref()
            .filter(|c| !c.is_closed())
            .map(|c| c.direction)
    }

    pub async fn capabilities(&self) -> PeerCapabilities {
        self.state.read().await.info.capabilities()
    }

    pub async fn action_states(&self) -> ActionStates {
        self.state.read().await.actions.clone()
    }

    pub async fn is_action_enabled(&self, plugin: &str, action: &str) -> bool {
        self.state.read().await.actions.is_enabled(plugin, action)
    }

    /// Subscribe to this device's lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Install a freshly attached channel
    ///
    /// A previous channel is detached from this device before it is closed,
    /// so its closure does not mark the device disconnected. A handle that
    /// is already cancelled is refused and the previous channel kept.
    pub(crate) async fn attach_channel(self: &Arc<Self>, mut handle: ChannelHandle) -> Result<()> {
        let weak: Weak<Device> = Arc::downgrade(self);
        let token = handle.cancel.clone();
        let channel_id = handle.id;
        handle.listener = Some(tokio::spawn(async move {
            token.cancelled().await;
            if let Some(device) = weak.upgrade() {
                device.channel_closed(channel_id).await;
            }
        }));

        let previous = {
            let mut state = self.state.write().await;
            // Checked under the lock: a later cancel finds the handle installed
            if handle.is_closed() {
                drop(state);
                handle.close();
                return Err(ProtocolError::Cancelled(format!(
                    "channel {} closed before attach",
                    channel_id
                )));
            }
            state.last_seen = crate::current_timestamp();
            state.channel.replace(handle)
        };

        if let Some(old) = previous {
            if old.id != channel_id {
                info!(
                    "Device {}: replacing channel {} with {}",
                    self.id, old.id, channel_id
                );
                old.close();
            }
        }
        Ok(())
    }

    /// Apply a fresh identity from the peer
    ///
    /// Updates name, type and capabilities. Action states are recomputed when
    /// connected, so a capability added by a re-broadcast takes effect
    /// without reconnecting.
    pub async fn handle_identity(&self, info: DeviceInfo) {
        if info.device_id != self.id {
            warn!(
                "Ignoring identity for {} applied to device {}",
                info.device_id, self.id
            );
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            let capabilities_changed = state.info.incoming_capabilities != info.incoming_capabilities
                || state.info.outgoing_capabilities != info.outgoing_capabilities;

            let tcp_host = info.tcp_host.or(state.info.tcp_host);
            state.info = DeviceInfo { tcp_host, ..info };
            state.last_seen = crate::current_timestamp();

            if capabilities_changed {
                debug!("Device {}: capabilities changed", self.id);
                events.push(DeviceEvent::CapabilitiesChanged {
                    device_id: self.id.clone(),
                    incoming: state.info.incoming_capabilities.clone(),
                    outgoing: state.info.outgoing_capabilities.clone(),
                });
                if state.connected {
                    state.actions = self.plugins.evaluate_actions(&state.info.capabilities());
                    events.push(DeviceEvent::ActionsChanged {
                        device_id: self.id.clone(),
                        enabled: state.actions.enabled(),
                    });
                }
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    /// Mark connected once the channel's packet loop runs
    ///
    /// No-op if already connected or if `channel_id` is no longer attached
    /// and open.
    pub(crate) async fn set_connected(&self, channel_id: u64) {
        let enabled = {
            let mut state = self.state.write().await;
            let attached = state
                .channel
                .as_ref()
                .is_some_and(|c| c.id == channel_id && !c.is_closed());
            if !attached || state.connected {
                return;
            }
            state.connected = true;
            state.actions = self.plugins.evaluate_actions(&state.info.capabilities());
            state.actions.enabled()
        };

        info!("Device {} connected", self.id);
        self.emit(DeviceEvent::Connected {
            device_id: self.id.clone(),
        });
        self.emit(DeviceEvent::ActionsChanged {
            device_id: self.id.clone(),
            enabled,
        });
    }

    /// Called when the attached channel's token fires
    async fn channel_closed(&self, channel_id: u64) {
        {
            let mut state = self.state.write().await;
            match state.channel.as_ref() {
                Some(current) if current.id == channel_id => {}
                _ => return,
            }
            state.channel = None;
            if !state.connected {
                return;
            }
            state.connected = false;
            state.actions = self.plugins.disabled_actions();
        }

        info!("Device {} disconnected", self.id);
        self.emit(DeviceEvent::Disconnected {
            device_id: self.id.clone(),
        });
        self.emit(DeviceEvent::ActionsChanged {
            device_id: self.id.clone(),
            enabled: Vec::new(),
        });
    }

    /// Queue a packet on the attached channel
    ///
    /// Packets are written whole and in call order.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        let state = self.state.read().await;
        let channel = state
            .channel
            .as_ref()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| ProtocolError::NotConnected(self.id.clone()))?;

        channel
            .sender
            .send(packet)
            .map_err(|_| ProtocolError::NotConnected(self.id.clone()))
    }

    /// Close the attached channel, if any
    pub async fn disconnect(&self) {
        let token = self
            .state
            .read()
            .await
            .channel
            .as_ref()
            .map(|c| c.cancel.clone());
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Pair or unpair the device
    ///
    /// Pairing pins the certificate captured during the attached channel's
    /// handshake; unpairing removes the pin.
    pub async fn set_paired(&self, paired: bool) -> Result<()> {
        if paired {
            let certificate = self
                .state
                .read()
                .await
                .channel
                .as_ref()
                .map(|c| c.certificate.clone())
                .ok_or_else(|| ProtocolError::NotConnected(self.id.clone()))?;
            self.trust.pin(&self.id, &certificate)?;
        } else {
            self.trust.unpin(&self.id)?;
        }

        {
            let mut state = self.state.write().await;
            if state.paired == paired {
                return Ok(());
            }
            state.paired = paired;
        }
        self.emit(DeviceEvent::PairedChanged {
            device_id: self.id.clone(),
            paired,
        });
        Ok(())
    }

    fn transfers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TransferEntry>> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_transfer(&self, uuid: Uuid, entry: TransferEntry) {
        self.transfers().insert(uuid, entry);
    }

    pub(crate) fn unregister_transfer(&self, uuid: &Uuid) {
        if self.transfers().remove(uuid).is_some() {
            debug!("Device {}: transfer {} removed", self.id, uuid);
        }
    }

    /// Ids of open transfers
    pub fn transfer_ids(&self) -> Vec<Uuid> {
        self.transfers().keys().copied().collect()
    }

    pub fn has_transfer(&self, uuid: &Uuid) -> bool {
        self.transfers().contains_key(uuid)
    }

    /// Cancel every open transfer
    pub fn cancel_transfers(&self) {
        for entry in self.transfers().values() {
            entry.cancel.cancel();
        }
    }

    async fn record(&self) -> DeviceRecord {
        let state = self.state.read().await;
        let tcp_host = state.channel.as_ref().map(|c| c.host).or(state.info.tcp_host);
        DeviceRecord {
            info: DeviceInfo {
                tcp_host,
                ..state.info.clone()
            },
            paired: state.paired,
            last_seen: state.last_seen,
        }
    }
}

/// Registry-level events
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DeviceDiscovered { device_id: String, device_name: String },
    DeviceRemoved { device_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceRecord {
    #[serde(flatten)]
    info: DeviceInfo,
    paired: bool,
    last_seen: i64,
}

/// Registry of known devices
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    plugins: Arc<PluginRegistry>,
    trust: Arc<TrustStore>,
    registry_path: Option<PathBuf>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create an in-memory registry
    pub fn new(plugins: Arc<PluginRegistry>, trust: Arc<TrustStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            plugins,
            trust,
            registry_path: None,
            events,
        }
    }

    /// Create a registry persisted to `registry_path` (JSON)
    pub fn with_storage(
        plugins: Arc<PluginRegistry>,
        trust: Arc<TrustStore>,
        registry_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry_path: Some(registry_path.into()),
            ..Self::new(plugins, trust)
        }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Subscribe to discovered/removed events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Create a device, or return the existing one with the same id
    pub async fn create(&self, info: DeviceInfo) -> Arc<Device> {
        self.get_or_create(info).await.0
    }

    /// Like [`create`](Self::create), also reporting whether the device is new
    pub async fn get_or_create(&self, info: DeviceInfo) -> (Arc<Device>, bool) {
        let (device, created) = {
            let mut devices = self.devices.write().await;
            match devices.get(&info.device_id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let device = Device::new(info.clone(), Arc::clone(&self.plugins), Arc::clone(&self.trust));
                    devices.insert(info.device_id.clone(), Arc::clone(&device));
                    (device, true)
                }
            }
        };

        if created {
            info!("Discovered device {} ({})", info.device_name, info.device_id);
            let _ = self.events.send(RegistryEvent::DeviceDiscovered {
                device_id: info.device_id,
                device_name: info.device_name,
            });
        }
        (device, created)
    }

    /// Remove a device, closing its channel and transfers
    pub async fn remove(&self, device_id: &str) -> Option<Arc<Device>> {
        let removed = self.devices.write().await.remove(device_id);
        if let Some(device) = &removed {
            device.disconnect().await;
            device.cancel_transfers();
            info!("Removed device {}", device_id);
            let _ = self.events.send(RegistryEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        }
        removed
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn connected_devices(&self) -> Vec<Arc<Device>> {
        let mut connected = Vec::new();
        for device in self.devices().await {
            if device.is_connected().await {
                connected.push(device);
            }
        }
        connected
    }

    /// Persist paired devices
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let mut records = Vec::new();
        for device in self.devices().await {
            let record = device.record().await;
            if record.paired {
                records.push(record);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&records)?)?;
        debug!("Saved {} paired devices to {:?}", records.len(), path);
        Ok(())
    }

    /// Restore persisted devices whose certificate is still pinned
    pub async fn load(&self) -> Result<usize> {
        let Some(path) = &self.registry_path else {
            return Ok(0);
        };
        if !path.exists() {
            debug!("No existing registry file at {:?}", path);
            return Ok(0);
        }

        let records: Vec<DeviceRecord> = serde_json::from_str(&fs::read_to_string(path)?)?;
        let mut devices = self.devices.write().await;
        let mut loaded = 0;
        for record in records {
            if self.trust.pinned_certificate(&record.info.device_id).is_none() {
                warn!(
                    "Skipping {}: no pinned certificate",
                    record.info.device_id
                );
                continue;
            }
            let id = record.info.device_id.clone();
            let device = Device::new(record.info, Arc::clone(&self.plugins), Arc::clone(&self.trust));
            device.state.write().await.last_seen = record.last_seen;
            devices.insert(id, device);
            loaded += 1;
        }

        info!("Loaded {} devices from registry", loaded);
        Ok(loaded)
    }
}
