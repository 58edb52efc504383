//! Outbound link establishment
//!
//! At most one attempt is tracked at a time. A new `connect` first cancels
//! and releases the previous attempt, then installs its own and hands the
//! slow part to a spawned worker so the request path returns immediately.
//!
//! Classic devices get a serial-profile socket connect. Low-energy and dual
//! devices go through pairing; the platform reports the outcome through a
//! bond-state listener that removes itself once the bond settles.

use crate::address::{AddressError, DeviceAddress};
use crate::config::LinkConfig;
use crate::radio::{
    ChannelHandle, DeviceClass, ListenerKind, Peer, RadioBridge, RadioEvent, Subscription,
};
use crate::registry::{LinkAttempt, LinkSnapshot, LinkStatus, LinkStrategy, StateRegistry};
use crate::scan::ScanSession;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Invalid MAC address provided.")]
    InvalidAddress,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Unsupported device type: {0}")]
    UnsupportedDeviceType(DeviceClass),
    #[error("Pairing request rejected")]
    PairingRejected,
    #[error("Bond not established")]
    BondNotEstablished,
}

impl From<AddressError> for LinkError {
    fn from(_err: AddressError) -> Self {
        LinkError::InvalidAddress
    }
}

/// Connection strategy for a device class
///
/// Unknown devices are tried as classic; the worker fails them as
/// unsupported if no serial channel can be opened.
pub fn strategy_for(class: DeviceClass) -> LinkStrategy {
    match class {
        DeviceClass::Classic | DeviceClass::Unknown => LinkStrategy::DirectSocket,
        DeviceClass::LowEnergy | DeviceClass::Dual => LinkStrategy::PairingFlow,
    }
}

#[derive(Clone)]
pub struct LinkEstablisher {
    registry: Arc<StateRegistry>,
    bridge: Arc<dyn RadioBridge>,
    scan: ScanSession,
    config: LinkConfig,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl LinkEstablisher {
    pub fn new(
        registry: Arc<StateRegistry>,
        bridge: Arc<dyn RadioBridge>,
        scan: ScanSession,
        config: LinkConfig,
    ) -> Self {
        Self {
            registry,
            bridge,
            scan,
            config,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Snapshot of the tracked attempt, if any
    pub fn current(&self) -> Option<LinkSnapshot> {
        self.registry.link()
    }

    /// Replace the tracked attempt with a new one against `address`
    pub async fn connect(&self, address: &str) -> Result<LinkSnapshot, LinkError> {
        let address = DeviceAddress::parse(address)?;
        let _gate = self.gate.lock().await;

        self.release_current("superseded").await;

        let target = self.resolve(&address).await;
        let strategy = strategy_for(target.device_class);
        if strategy == LinkStrategy::DirectSocket {
            // Discovery slows down or breaks a concurrent socket connect
            self.scan.stop_scan().await;
        }

        let id = self.registry.next_id();
        let attempt = LinkAttempt::new(id, target.clone(), strategy);
        let snapshot = attempt.snapshot();
        self.registry.lock().link = Some(attempt);

        info!(
            "Link attempt {} to {} ({}) via {:?}",
            id, address, target.device_class, strategy
        );

        let worker = self.clone();
        tokio::spawn(async move {
            match strategy {
                LinkStrategy::DirectSocket => worker.run_direct(id, target).await,
                LinkStrategy::PairingFlow => worker.run_pairing(id, target).await,
            }
        });

        Ok(snapshot)
    }

    /// Stop the tracked attempt if it is still connecting.
    ///
    /// A socket connect is unblocked by closing its channel. Pairing has no
    /// platform-level cancel; the attempt is only marked and the bond is left
    /// to finish unobserved.
    pub async fn cancel(&self) -> bool {
        let channel = {
            let mut state = self.registry.lock();
            match state.link.as_mut() {
                Some(attempt) if attempt.status == LinkStatus::Connecting => {
                    attempt.status = LinkStatus::Cancelled;
                    info!("Link attempt {} cancelled", attempt.id);
                    attempt.channel.take()
                }
                _ => return false,
            }
        };
        if let Some(channel) = channel {
            channel.release().await;
        }
        true
    }

    /// Drop the tracked attempt and release everything it owns
    pub async fn shutdown(&self) {
        let _gate = self.gate.lock().await;
        self.release_current("shutdown").await;
    }

    async fn release_current(&self, why: &str) {
        let previous = self.registry.lock().link.take();
        let Some(mut attempt) = previous else {
            return;
        };

        if attempt.status == LinkStatus::Connecting {
            info!("Link attempt {} cancelled ({})", attempt.id, why);
        }
        match attempt.strategy {
            LinkStrategy::DirectSocket => {
                if let Some(channel) = attempt.channel.take() {
                    channel.release().await;
                }
            }
            LinkStrategy::PairingFlow => {
                debug!(
                    "Pairing with {} left to finish in the background",
                    attempt.target.address
                );
            }
        }
    }

    /// Prefer what the platform knows, fill gaps from the discovered set
    async fn resolve(&self, address: &DeviceAddress) -> Peer {
        let mut target = match self.bridge.remote_device(address).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Remote device lookup for {} failed: {}", address, e);
                Peer::unknown(address.clone())
            }
        };
        if let Some(seen) = self.registry.peer(address) {
            if target.display_name.is_none() {
                target.display_name = seen.display_name;
            }
            if target.device_class == DeviceClass::Unknown {
                target.device_class = seen.device_class;
            }
        }
        target
    }

    /// Settle attempt `id` if it is still the tracked, connecting attempt
    fn settle(&self, id: u64, status: LinkStatus, failure: Option<LinkError>) -> bool {
        settle_attempt(&self.registry, id, status, failure)
    }

    fn attach_channel(&self, id: u64, channel: &Arc<ChannelHandle>) -> bool {
        let mut state = self.registry.lock();
        match state.link.as_mut() {
            Some(attempt) if attempt.id == id && attempt.status == LinkStatus::Connecting => {
                attempt.channel = Some(Arc::clone(channel));
                true
            }
            _ => false,
        }
    }

    async fn run_direct(&self, id: u64, target: Peer) {
        let channel = match self
            .bridge
            .open_serial_channel(&target.address, &self.config.serial_service_uuid)
            .await
        {
            Ok(channel) => Arc::new(ChannelHandle::new(channel)),
            Err(e) => {
                let reason = if target.device_class == DeviceClass::Unknown {
                    LinkError::UnsupportedDeviceType(target.device_class)
                } else {
                    LinkError::ConnectionFailed(e.to_string())
                };
                warn!("Link attempt {}: cannot open channel: {}", id, e);
                self.settle(id, LinkStatus::Failed, Some(reason));
                return;
            }
        };

        if !self.attach_channel(id, &channel) {
            debug!("Link attempt {} dropped before its channel opened", id);
            channel.release().await;
            return;
        }

        debug!("Link attempt {}: connecting to {}", id, target.address);
        match channel.connect().await {
            Ok(()) => {
                if self.settle(id, LinkStatus::Connected, None) {
                    info!("Link attempt {}: connected to {}", id, target.address);
                } else {
                    channel.release().await;
                }
            }
            Err(e) => {
                if self.settle(id, LinkStatus::Failed, Some(LinkError::ConnectionFailed(e.to_string()))) {
                    warn!("Link attempt {}: connection failed: {}", id, e);
                } else {
                    debug!("Link attempt {}: connect ended after cancel: {}", id, e);
                }
                channel.release().await;
                let mut state = self.registry.lock();
                if let Some(attempt) = state.link.as_mut().filter(|a| a.id == id) {
                    attempt.channel = None;
                }
            }
        }
    }

    async fn run_pairing(&self, id: u64, target: Peer) {
        let watch = Arc::new(BondWatch {
            registry: Arc::clone(&self.registry),
            attempt_id: id,
            address: target.address.clone(),
            slot: Mutex::new(WatchSlot::default()),
        });

        let observer = Arc::clone(&watch);
        let subscription = Subscription::register(
            Arc::clone(&self.bridge),
            ListenerKind::BondStateChanged,
            Arc::new(move |event: RadioEvent| observer.on_event(event)),
        );
        watch.arm(subscription);

        match self.bridge.create_bond(&target.address).await {
            Ok(true) => info!("Link attempt {}: pairing requested with {}", id, target.address),
            Ok(false) => {
                warn!("Link attempt {}: pairing request rejected", id);
                self.settle(id, LinkStatus::Failed, Some(LinkError::PairingRejected));
                watch.release();
            }
            Err(e) => {
                warn!("Link attempt {}: pairing request failed: {}", id, e);
                self.settle(id, LinkStatus::Failed, Some(LinkError::PairingRejected));
                watch.release();
            }
        }
    }
}

fn settle_attempt(
    registry: &StateRegistry,
    id: u64,
    status: LinkStatus,
    failure: Option<LinkError>,
) -> bool {
    let mut state = registry.lock();
    match state.link.as_mut() {
        Some(attempt) if attempt.id == id && attempt.status == LinkStatus::Connecting => {
            attempt.status = status;
            attempt.failure = failure;
            true
        }
        _ => false,
    }
}

#[derive(Default)]
struct WatchSlot {
    subscription: Option<Subscription>,
    finished: bool,
}

/// Bond listener state for one pairing attempt. Releases its own
/// subscription once the bond reaches a terminal state.
struct BondWatch {
    registry: Arc<StateRegistry>,
    attempt_id: u64,
    address: DeviceAddress,
    slot: Mutex<WatchSlot>,
}

impl BondWatch {
    /// Store the subscription, or release it at once if the bond already
    /// settled while it was being registered
    fn arm(&self, subscription: Subscription) {
        let mut slot = self.slot.lock();
        if slot.finished {
            drop(slot);
            subscription.release();
        } else {
            slot.subscription = Some(subscription);
        }
    }

    fn release(&self) {
        let subscription = {
            let mut slot = self.slot.lock();
            slot.finished = true;
            slot.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.release();
        }
    }

    fn on_event(&self, event: RadioEvent) {
        let RadioEvent::BondStateChanged {
            address,
            previous,
            current,
        } = event
        else {
            return;
        };
        if address != self.address {
            return;
        }

        debug!(
            "Bond state changed for {}: {:?} -> {:?}",
            address, previous, current
        );
        if !current.is_terminal() {
            return;
        }

        let settled = match current {
            crate::radio::BondState::Bonded => {
                settle_attempt(&self.registry, self.attempt_id, LinkStatus::Connected, None)
            }
            _ => settle_attempt(
                &self.registry,
                self.attempt_id,
                LinkStatus::Failed,
                Some(LinkError::BondNotEstablished),
            ),
        };
        if settled {
            info!("Link attempt {}: bond {:?}", self.attempt_id, current);
        }
        self.release();
    }
}
