//! In-memory radio
//!
//! Behaves like a platform adapter with a scriptable neighbourhood: devices
//! can be seeded or "discovered", connect outcomes and pairing answers are
//! configurable, and every resource it hands out is counted so callers can
//! check that nothing leaks.

use super::{
    BondState, DeviceClass, ListenerCallback, ListenerId, ListenerKind, ListenerSet, Peer,
    RadioBridge, RadioChannel, RadioError, RadioEvent,
};
use crate::address::DeviceAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// How a channel's `connect` resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connect succeeds immediately
    Succeed,
    /// Connect fails immediately
    Refuse,
    /// Connect blocks until the channel is closed
    Hang,
}

struct LoopbackState {
    powered: bool,
    discovering: bool,
    discovery_starts: usize,
    devices: HashMap<DeviceAddress, Peer>,
    serial_behavior: ConnectBehavior,
    l2cap_behavior: ConnectBehavior,
    serial_for_unknown: bool,
    l2cap_supported: bool,
    accept_bonds: bool,
    bond_requests: Vec<DeviceAddress>,
    channels_opened: usize,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            powered: true,
            discovering: false,
            discovery_starts: 0,
            devices: HashMap::new(),
            serial_behavior: ConnectBehavior::Succeed,
            l2cap_behavior: ConnectBehavior::Refuse,
            serial_for_unknown: false,
            l2cap_supported: true,
            accept_bonds: true,
            bond_requests: Vec::new(),
            channels_opened: 0,
        }
    }
}

/// Scriptable in-memory [`RadioBridge`]
#[derive(Default)]
pub struct LoopbackRadio {
    state: Mutex<LoopbackState>,
    listeners: ListenerSet,
    channels_closed: Arc<AtomicUsize>,
    connect_attempts: Arc<AtomicUsize>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a device known to remote lookups without reporting it
    pub fn add_device(&self, peer: Peer) {
        self.state.lock().devices.insert(peer.address.clone(), peer);
    }

    /// Report a device the way a discovery sweep would. Ignored unless
    /// discovery is running.
    pub fn discover(&self, peer: Peer) -> bool {
        {
            let mut state = self.state.lock();
            if !state.discovering {
                return false;
            }
            state
                .devices
                .entry(peer.address.clone())
                .or_insert_with(|| peer.clone());
        }
        self.listeners.emit(RadioEvent::DeviceFound(peer));
        true
    }

    /// Finish a pairing flow started by `create_bond`
    pub fn finish_bond(&self, address: &DeviceAddress, outcome: BondState) {
        self.listeners.emit(RadioEvent::BondStateChanged {
            address: address.clone(),
            previous: BondState::Bonding,
            current: outcome,
        });
    }

    /// Deliver an arbitrary event to registered listeners
    pub fn emit(&self, event: RadioEvent) {
        self.listeners.emit(event);
    }

    pub fn set_powered(&self, powered: bool) {
        self.state.lock().powered = powered;
    }

    pub fn set_serial_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().serial_behavior = behavior;
    }

    pub fn set_l2cap_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().l2cap_behavior = behavior;
    }

    /// Whether a serial channel can be created for devices of unknown class
    pub fn set_serial_for_unknown(&self, allowed: bool) {
        self.state.lock().serial_for_unknown = allowed;
    }

    pub fn set_l2cap_supported(&self, supported: bool) {
        self.state.lock().l2cap_supported = supported;
    }

    pub fn set_accept_bonds(&self, accept: bool) {
        self.state.lock().accept_bonds = accept;
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovering
    }

    pub fn discovery_starts(&self) -> usize {
        self.state.lock().discovery_starts
    }

    pub fn bond_requests(&self) -> Vec<DeviceAddress> {
        self.state.lock().bond_requests.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }

    /// Channels opened and not yet closed
    pub fn open_channels(&self) -> usize {
        self.channels_opened().saturating_sub(self.channels_closed())
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self, kind: ListenerKind) -> usize {
        self.listeners.count(kind)
    }

    fn new_channel(&self, behavior: ConnectBehavior) -> Box<dyn RadioChannel> {
        self.state.lock().channels_opened += 1;
        let (closed, _) = watch::channel(false);
        Box::new(LoopbackChannel {
            behavior,
            closed,
            close_counter: Arc::clone(&self.channels_closed),
            connect_counter: Arc::clone(&self.connect_attempts),
        })
    }
}

#[async_trait]
impl RadioBridge for LoopbackRadio {
    async fn start_discovery(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if !state.powered {
            return Err(RadioError::Unavailable);
        }
        state.discovering = true;
        state.discovery_starts += 1;
        Ok(())
    }

    async fn cancel_discovery(&self) -> Result<(), RadioError> {
        self.state.lock().discovering = false;
        Ok(())
    }

    async fn remote_device(&self, address: &DeviceAddress) -> Result<Peer, RadioError> {
        let state = self.state.lock();
        if !state.powered {
            return Err(RadioError::Unavailable);
        }
        Ok(state
            .devices
            .get(address)
            .cloned()
            .unwrap_or_else(|| Peer::unknown(address.clone())))
    }

    async fn open_serial_channel(
        &self,
        address: &DeviceAddress,
        _service_uuid: &str,
    ) -> Result<Box<dyn RadioChannel>, RadioError> {
        let (class, behavior, for_unknown) = {
            let state = self.state.lock();
            let class = state
                .devices
                .get(address)
                .map(|p| p.device_class)
                .unwrap_or(DeviceClass::Unknown);
            (class, state.serial_behavior, state.serial_for_unknown)
        };

        match class {
            DeviceClass::Classic | DeviceClass::Dual => Ok(self.new_channel(behavior)),
            DeviceClass::Unknown if for_unknown => Ok(self.new_channel(behavior)),
            other => Err(RadioError::Unsupported(format!(
                "no serial profile for {} device {}",
                other, address
            ))),
        }
    }

    async fn open_insecure_l2cap_channel(
        &self,
        address: &DeviceAddress,
        psm: u16,
    ) -> Result<Box<dyn RadioChannel>, RadioError> {
        let (supported, behavior) = {
            let state = self.state.lock();
            (state.l2cap_supported, state.l2cap_behavior)
        };
        if !supported {
            return Err(RadioError::Unsupported("insecure L2CAP channels".to_string()));
        }
        debug!("Loopback L2CAP channel to {} on PSM {:#06x}", address, psm);
        Ok(self.new_channel(behavior))
    }

    async fn create_bond(&self, address: &DeviceAddress) -> Result<bool, RadioError> {
        let mut state = self.state.lock();
        state.bond_requests.push(address.clone());
        Ok(state.accept_bonds)
    }

    fn register_listener(&self, kind: ListenerKind, callback: ListenerCallback) -> ListenerId {
        self.listeners.register(kind, callback)
    }

    fn unregister_listener(&self, id: ListenerId) -> Result<(), RadioError> {
        self.listeners.unregister(id)
    }
}

struct LoopbackChannel {
    behavior: ConnectBehavior,
    closed: watch::Sender<bool>,
    close_counter: Arc<AtomicUsize>,
    connect_counter: Arc<AtomicUsize>,
}

#[async_trait]
impl RadioChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), RadioError> {
        self.connect_counter.fetch_add(1, Ordering::SeqCst);
        if *self.closed.borrow() {
            return Err(RadioError::Closed);
        }
        match self.behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Refuse => Err(RadioError::ConnectFailed("refused".to_string())),
            ConnectBehavior::Hang => {
                let mut rx = self.closed.subscribe();
                let _ = rx.wait_for(|closed| *closed).await;
                Err(RadioError::Closed)
            }
        }
    }

    async fn close(&self) -> Result<(), RadioError> {
        if self.closed.send_replace(true) {
            return Err(RadioError::Closed);
        }
        self.close_counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
