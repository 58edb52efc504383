//! Radio bridge abstraction
//!
//! The orchestration layer never talks to a Bluetooth stack directly. Every
//! platform operation (discovery, remote device lookup, channel creation,
//! pairing, event listeners) goes through [`RadioBridge`], implemented by the
//! host: the in-memory [`loopback::LoopbackRadio`] for tests and dry runs, or a
//! real adapter binding in the CLI.

pub mod loopback;

use crate::address::DeviceAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use loopback::{ConnectBehavior, LoopbackRadio};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("Radio unavailable")]
    Unavailable,
    #[error("Operation not supported by this radio: {0}")]
    Unsupported(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Channel closed")]
    Closed,
    #[error("Platform error: {0}")]
    Platform(String),
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// Device class as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// BR/EDR only
    Classic,
    /// Low energy only
    LowEnergy,
    /// BR/EDR and low energy
    Dual,
    /// Not yet known to the platform
    Unknown,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Classic => write!(f, "Classic"),
            DeviceClass::LowEnergy => write!(f, "LowEnergy"),
            DeviceClass::Dual => write!(f, "Dual"),
            DeviceClass::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A discovered or looked-up remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: DeviceAddress,
    pub display_name: Option<String>,
    pub device_class: DeviceClass,
}

impl Peer {
    pub fn new(address: DeviceAddress, device_class: DeviceClass) -> Self {
        Self {
            address,
            display_name: None,
            device_class,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Placeholder for an address the platform knows nothing about
    pub fn unknown(address: DeviceAddress) -> Self {
        Self::new(address, DeviceClass::Unknown)
    }
}

/// Bond (pairing) state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

impl BondState {
    /// Bonded and explicitly-unbonded end a pairing flow
    pub fn is_terminal(self) -> bool {
        matches!(self, BondState::Bonded | BondState::None)
    }
}

/// Asynchronous notifications delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    DeviceFound(Peer),
    BondStateChanged {
        address: DeviceAddress,
        previous: BondState,
        current: BondState,
    },
}

impl RadioEvent {
    pub fn kind(&self) -> ListenerKind {
        match self {
            RadioEvent::DeviceFound(_) => ListenerKind::DeviceFound,
            RadioEvent::BondStateChanged { .. } => ListenerKind::BondStateChanged,
        }
    }
}

/// Which notifications a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    DeviceFound,
    BondStateChanged,
}

/// Handle identifying one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub type ListenerCallback = Arc<dyn Fn(RadioEvent) + Send + Sync>;

// ============================================================================
// PLATFORM BRIDGE TRAITS
// ============================================================================

/// Platform radio API abstraction
///
/// Listener callbacks are invoked on the platform's notification context and
/// never while the bridge holds internal locks, so a callback may unregister
/// itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioBridge: Send + Sync {
    /// Put the radio into discovery mode
    async fn start_discovery(&self) -> Result<(), RadioError>;

    /// Leave discovery mode. Calling this while not discovering is harmless.
    async fn cancel_discovery(&self) -> Result<(), RadioError>;

    /// Look up a device by address, even if it was never discovered
    async fn remote_device(&self, address: &DeviceAddress) -> Result<Peer, RadioError>;

    /// Create a serial-profile channel to the given service record
    async fn open_serial_channel(
        &self,
        address: &DeviceAddress,
        service_uuid: &str,
    ) -> Result<Box<dyn RadioChannel>, RadioError>;

    /// Create an unauthenticated connection-oriented channel on `psm`
    async fn open_insecure_l2cap_channel(
        &self,
        address: &DeviceAddress,
        psm: u16,
    ) -> Result<Box<dyn RadioChannel>, RadioError>;

    /// Ask the platform to start pairing. `Ok(false)` is a synchronous rejection.
    async fn create_bond(&self, address: &DeviceAddress) -> Result<bool, RadioError>;

    /// Register a listener for one kind of notification
    fn register_listener(&self, kind: ListenerKind, callback: ListenerCallback) -> ListenerId;

    /// Remove a listener. Unknown ids are an error the caller may ignore.
    fn unregister_listener(&self, id: ListenerId) -> Result<(), RadioError>;
}

/// One connection-oriented channel
///
/// `close` may be called from another task while `connect` is pending and
/// must make that `connect` return an error.
#[async_trait]
pub trait RadioChannel: Send + Sync {
    async fn connect(&self) -> Result<(), RadioError>;
    async fn close(&self) -> Result<(), RadioError>;
}

// ============================================================================
// OWNERSHIP HELPERS
// ============================================================================

/// A registered listener that is released at most once
///
/// Dropping the subscription releases it too, so a listener can never outlive
/// its owner by accident.
pub struct Subscription {
    bridge: Arc<dyn RadioBridge>,
    id: ListenerId,
    kind: ListenerKind,
    released: AtomicBool,
}

impl Subscription {
    pub fn register(
        bridge: Arc<dyn RadioBridge>,
        kind: ListenerKind,
        callback: ListenerCallback,
    ) -> Self {
        let id = bridge.register_listener(kind, callback);
        debug!("Registered {:?} listener {:?}", kind, id);
        Self {
            bridge,
            id,
            kind,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Unregister the listener. Returns `true` only for the call that did it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.bridge.unregister_listener(self.id) {
            warn!(
                "Resource cleanup failure: unregistering {:?} listener {:?}: {}",
                self.kind, self.id, e
            );
        } else {
            debug!("Released {:?} listener {:?}", self.kind, self.id);
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Exclusive owner of one open channel; closes it exactly once
pub struct ChannelHandle {
    channel: Box<dyn RadioChannel>,
    closed: AtomicBool,
}

impl ChannelHandle {
    pub fn new(channel: Box<dyn RadioChannel>) -> Self {
        Self {
            channel,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> Result<(), RadioError> {
        if self.is_released() {
            return Err(RadioError::Closed);
        }
        self.channel.connect().await
    }

    pub fn is_released(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel. Close failures are logged, never returned.
    pub async fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.channel.close().await {
            warn!("Resource cleanup failure: closing channel: {}", e);
        }
        true
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Listener table shared by bridge implementations
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, (ListenerKind, ListenerCallback)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ListenerKind, callback: ListenerCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.listeners.lock().insert(id, (kind, callback));
        id
    }

    pub fn unregister(&self, id: ListenerId) -> Result<(), RadioError> {
        self.listeners
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RadioError::Platform(format!("listener {} not registered", id.0)))
    }

    /// Number of listeners currently registered for `kind`
    pub fn count(&self, kind: ListenerKind) -> usize {
        self.listeners
            .lock()
            .values()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Deliver an event to every matching listener, outside the table lock
    pub fn emit(&self, event: RadioEvent) {
        let kind = event.kind();
        let targets: Vec<ListenerCallback> = self
            .listeners
            .lock()
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in targets {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn addr() -> DeviceAddress {
        DeviceAddress::parse("00:11:22:33:44:55").expect("valid address")
    }

    #[test]
    fn test_terminal_bond_states() {
        assert!(BondState::Bonded.is_terminal());
        assert!(BondState::None.is_terminal());
        assert!(!BondState::Bonding.is_terminal());
    }

    #[test]
    fn test_subscription_release_is_idempotent() {
        let radio = Arc::new(LoopbackRadio::new());
        let sub = Subscription::register(
            radio.clone(),
            ListenerKind::DeviceFound,
            Arc::new(|_: RadioEvent| {}),
        );
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 1);

        assert!(sub.release());
        assert!(!sub.release());
        assert!(sub.is_released());
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 0);
        assert!(radio.unregister_listener(sub.id()).is_err());
    }

    #[test]
    fn test_subscription_drop_releases() {
        let radio = Arc::new(LoopbackRadio::new());
        {
            let _sub = Subscription::register(
                radio.clone(),
                ListenerKind::BondStateChanged,
                Arc::new(|_: RadioEvent| {}),
            );
            assert_eq!(radio.listener_count(ListenerKind::BondStateChanged), 1);
        }
        assert_eq!(radio.listener_count(ListenerKind::BondStateChanged), 0);
    }

    #[test]
    fn test_listener_set_filters_by_kind() {
        let set = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        set.register(
            ListenerKind::DeviceFound,
            Arc::new(move |_: RadioEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        set.emit(RadioEvent::DeviceFound(Peer::unknown(addr())));
        set.emit(RadioEvent::BondStateChanged {
            address: addr(),
            previous: BondState::Bonding,
            current: BondState::Bonded,
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let set = Arc::new(ListenerSet::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let (set_cb, slot_cb) = (set.clone(), slot.clone());
        let id = set.register(
            ListenerKind::DeviceFound,
            Arc::new(move |_: RadioEvent| {
                if let Some(id) = slot_cb.lock().take() {
                    set_cb.unregister(id).expect("registered");
                }
            }),
        );
        *slot.lock() = Some(id);

        set.emit(RadioEvent::DeviceFound(Peer::unknown(addr())));
        assert_eq!(set.count(ListenerKind::DeviceFound), 0);
        assert!(set.unregister(id).is_err());
    }

    #[tokio::test]
    async fn test_channel_handle_closes_once() {
        let radio = LoopbackRadio::new();
        let channel = radio
            .open_insecure_l2cap_channel(&addr(), 0x1001)
            .await
            .expect("open");
        let handle = ChannelHandle::new(channel);

        assert!(handle.release().await);
        assert!(!handle.release().await);
        assert_eq!(radio.channels_closed(), 1);
        assert_eq!(handle.connect().await, Err(RadioError::Closed));
    }
}
