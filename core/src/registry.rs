//! Shared state registry
//!
//! One mutual-exclusion domain covers every piece of state that the request
//! path and the platform notification paths both touch: the scan state and
//! its listener registration, the discovered-peer set, the active link
//! attempt and the active flood job. Components receive an
//! `Arc<StateRegistry>`; nothing here is global.
//!
//! The lock is a `parking_lot::Mutex` and is never held across an `.await`.

use crate::address::DeviceAddress;
use crate::link::LinkError;
use crate::radio::{ChannelHandle, Peer, Subscription};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

// ============================================================================
// SCAN STATE
// ============================================================================

/// Discovery is active on the radio iff the state is `Scanning`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Scanning,
}

pub(crate) struct ScanSlot {
    pub state: ScanState,
    /// Bumped on every start so a stale timeout can recognise itself
    pub generation: u64,
    /// A scan was started and its results have not been handed out yet
    pub harvest_pending: bool,
    pub listener: Option<Subscription>,
    pub timer: Option<JoinHandle<()>>,
}

impl Default for ScanSlot {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            generation: 0,
            harvest_pending: false,
            listener: None,
            timer: None,
        }
    }
}

/// Discovered peers keyed by address, in first-seen order
#[derive(Debug, Default)]
pub struct PeerSet {
    order: Vec<DeviceAddress>,
    peers: HashMap<DeviceAddress, Peer>,
}

impl PeerSet {
    /// Insert a peer, merging into an existing entry for the same address.
    /// Returns `true` if the address was new.
    pub fn upsert(&mut self, peer: Peer) -> bool {
        match self.peers.get_mut(&peer.address) {
            Some(existing) => {
                if peer.display_name.is_some() {
                    existing.display_name = peer.display_name;
                }
                if existing.device_class == crate::radio::DeviceClass::Unknown {
                    existing.device_class = peer.device_class;
                }
                false
            }
            None => {
                self.order.push(peer.address.clone());
                self.peers.insert(peer.address.clone(), peer);
                true
            }
        }
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn to_vec(&self) -> Vec<Peer> {
        self.order
            .iter()
            .filter_map(|addr| self.peers.get(addr).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.peers.clear();
    }
}

// ============================================================================
// LINK ATTEMPT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStrategy {
    /// Serial-profile socket connect
    DirectSocket,
    /// Pairing request, outcome reported by the bond listener
    PairingFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Failed,
    Cancelled,
}

impl LinkStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LinkStatus::Connecting)
    }
}

/// One outbound connection attempt. Owns its channel exclusively.
#[derive(Debug)]
pub(crate) struct LinkAttempt {
    pub id: u64,
    pub target: Peer,
    pub strategy: LinkStrategy,
    pub status: LinkStatus,
    pub failure: Option<LinkError>,
    pub channel: Option<Arc<ChannelHandle>>,
}

impl LinkAttempt {
    pub fn new(id: u64, target: Peer, strategy: LinkStrategy) -> Self {
        Self {
            id,
            target,
            strategy,
            status: LinkStatus::Connecting,
            failure: None,
            channel: None,
        }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            id: self.id,
            target: self.target.clone(),
            strategy: self.strategy,
            status: self.status,
            failure: self.failure.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Read-only view of a link attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub id: u64,
    pub target: Peer,
    pub strategy: LinkStrategy,
    pub status: LinkStatus,
    pub failure: Option<String>,
}

// ============================================================================
// FLOOD JOB
// ============================================================================

/// Per-job iteration counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodStats {
    pub attempts: u64,
    pub connected: u64,
    pub failed: u64,
}

pub(crate) struct FloodJob {
    pub id: u64,
    pub target: DeviceAddress,
    pub port: u16,
    pub running: bool,
    pub stats: FloodStats,
    pub stop: watch::Sender<bool>,
    pub task: Option<JoinHandle<()>>,
}

impl FloodJob {
    /// Running and its loop has not exited
    pub fn is_alive(&self) -> bool {
        self.running
            && self
                .task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(true)
    }

    pub fn snapshot(&self) -> FloodSnapshot {
        FloodSnapshot {
            id: self.id,
            target: self.target.clone(),
            port: self.port,
            running: self.is_alive(),
            stats: self.stats,
        }
    }
}

/// Read-only view of a flood job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodSnapshot {
    pub id: u64,
    pub target: DeviceAddress,
    pub port: u16,
    pub running: bool,
    pub stats: FloodStats,
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Default)]
pub(crate) struct RegistryState {
    pub scan: ScanSlot,
    pub peers: PeerSet,
    pub link: Option<LinkAttempt>,
    pub flood: Option<FloodJob>,
}

/// The synchronized slots shared by scan, link and flood components
#[derive(Default)]
pub struct StateRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Fresh identifier for a link attempt or flood job
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn scan_state(&self) -> ScanState {
        self.state.lock().scan.state
    }

    pub fn harvest_pending(&self) -> bool {
        self.state.lock().scan.harvest_pending
    }

    /// Whether the discovery listener registration is outstanding
    pub fn scan_listener_active(&self) -> bool {
        self.state
            .lock()
            .scan
            .listener
            .as_ref()
            .map(|sub| !sub.is_released())
            .unwrap_or(false)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.state.lock().peers.to_vec()
    }

    pub fn peer(&self, address: &DeviceAddress) -> Option<Peer> {
        self.state.lock().peers.get(address).cloned()
    }

    /// Record a discovery result. Results arriving outside a scan are dropped.
    pub fn record_discovered(&self, peer: Peer) -> bool {
        let mut state = self.state.lock();
        if state.scan.state != ScanState::Scanning {
            debug!("Dropping discovery result for {} while idle", peer.address);
            return false;
        }
        let address = peer.address.clone();
        if state.peers.upsert(peer) {
            debug!("Discovered {}", address);
        }
        true
    }

    pub fn link(&self) -> Option<LinkSnapshot> {
        self.state.lock().link.as_ref().map(LinkAttempt::snapshot)
    }

    pub fn flood(&self) -> Option<FloodSnapshot> {
        self.state.lock().flood.as_ref().map(FloodJob::snapshot)
    }
}
