//! Time-boxed discovery
//!
//! A scan registers the device-found listener, puts the radio into discovery
//! and arms a timer for the configured window. It ends on whichever comes
//! first: the timer, an explicit stop, or a link attempt that needs the radio.
//! Ending a scan does not hand out its results; the next `poll_or_start`
//! harvests them.

use crate::config::LinkConfig;
use crate::radio::{ListenerKind, Peer, RadioBridge, RadioError, RadioEvent, Subscription};
use crate::registry::{ScanState, StateRegistry};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("A scan is already running")]
    AlreadyScanning,
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

/// Outcome of the toggle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll {
    /// A new scan window was opened
    Started { window_secs: u64 },
    /// The previous scan ended and these peers were collected
    Harvested(Vec<Peer>),
}

impl ScanPoll {
    pub fn started_message(window_secs: u64) -> String {
        format!(
            "Scanning for {} seconds... Run the command again to see results.",
            window_secs
        )
    }
}

/// Owner of the radio's discovery mode
#[derive(Clone)]
pub struct ScanSession {
    registry: Arc<StateRegistry>,
    bridge: Arc<dyn RadioBridge>,
    config: LinkConfig,
    /// Serializes start, stop and timeout so discovery calls never interleave
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl ScanSession {
    pub fn new(
        registry: Arc<StateRegistry>,
        bridge: Arc<dyn RadioBridge>,
        config: LinkConfig,
    ) -> Self {
        Self {
            registry,
            bridge,
            config,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn state(&self) -> ScanState {
        self.registry.scan_state()
    }

    /// Open a new scan window
    pub async fn start_scan(&self) -> Result<(), ScanError> {
        let _gate = self.gate.lock().await;
        self.start_locked().await
    }

    /// End the current scan. Safe to call any number of times.
    pub async fn stop_scan(&self) -> bool {
        let _gate = self.gate.lock().await;
        self.stop_locked(None).await
    }

    /// First call starts a scan; the next one ends it and returns what was
    /// found, whether or not the window already timed out.
    pub async fn poll_or_start(&self) -> Result<ScanPoll, ScanError> {
        let _gate = self.gate.lock().await;

        if !self.registry.harvest_pending() {
            self.start_locked().await?;
            return Ok(ScanPoll::Started {
                window_secs: self.config.scan_window_secs,
            });
        }

        self.stop_locked(None).await;
        let peers = {
            let mut state = self.registry.lock();
            state.scan.harvest_pending = false;
            state.peers.to_vec()
        };
        info!("Scan harvested: {} peer(s)", peers.len());
        Ok(ScanPoll::Harvested(peers))
    }

    /// Platform notification path for discovery results
    pub fn on_peer_discovered(&self, peer: Peer) -> bool {
        self.registry.record_discovered(peer)
    }

    async fn start_locked(&self) -> Result<(), ScanError> {
        let generation = {
            let mut state = self.registry.lock();
            if state.scan.state == ScanState::Scanning {
                return Err(ScanError::AlreadyScanning);
            }
            state.peers.clear();
            state.scan.state = ScanState::Scanning;
            state.scan.harvest_pending = true;
            state.scan.generation += 1;
            state.scan.generation
        };

        // Released by stop_locked, which also drops this clone of the session
        let session = self.clone();
        let subscription = Subscription::register(
            Arc::clone(&self.bridge),
            ListenerKind::DeviceFound,
            Arc::new(move |event: RadioEvent| {
                if let RadioEvent::DeviceFound(peer) = event {
                    session.on_peer_discovered(peer);
                }
            }),
        );
        let stale = self.registry.lock().scan.listener.replace(subscription);
        if let Some(stale) = stale {
            warn!("Replacing a discovery listener that was never released");
            stale.release();
        }

        if let Err(e) = self.bridge.start_discovery().await {
            warn!("Radio refused to start discovery: {}", e);
            let listener = {
                let mut state = self.registry.lock();
                state.scan.state = ScanState::Idle;
                state.scan.harvest_pending = false;
                state.scan.listener.take()
            };
            if let Some(listener) = listener {
                listener.release();
            }
            return Err(e.into());
        }

        let session = self.clone();
        let window = self.config.scan_window();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            session.expire(generation).await;
        });
        self.registry.lock().scan.timer = Some(timer);

        info!(
            "Scan {} started for {}s",
            generation, self.config.scan_window_secs
        );
        Ok(())
    }

    /// Timer callback. Only ends the scan that armed it.
    async fn expire(&self, generation: u64) {
        let _gate = self.gate.lock().await;
        if self.stop_locked(Some(generation)).await {
            info!("Scan {} window elapsed", generation);
        }
    }

    /// Shared stop path. `from_timer` carries the generation of the timer
    /// doing the stop; the timer never aborts itself.
    async fn stop_locked(&self, from_timer: Option<u64>) -> bool {
        let (listener, timer) = {
            let mut state = self.registry.lock();
            if state.scan.state == ScanState::Idle {
                return false;
            }
            if let Some(generation) = from_timer {
                if generation != state.scan.generation {
                    debug!("Ignoring stale scan timer {}", generation);
                    return false;
                }
            }
            state.scan.state = ScanState::Idle;
            (state.scan.listener.take(), state.scan.timer.take())
        };

        if let Some(timer) = timer {
            if from_timer.is_none() {
                timer.abort();
            }
        }

        if let Err(e) = self.bridge.cancel_discovery().await {
            warn!("Resource cleanup failure: cancelling discovery: {}", e);
        }
        if let Some(listener) = listener {
            listener.release();
        }
        debug!("Scan stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DeviceAddress;
    use crate::radio::{DeviceClass, LoopbackRadio, MockRadioBridge};
    use std::time::Duration;

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::parse(s).expect("valid address")
    }

    fn session() -> (ScanSession, Arc<LoopbackRadio>, Arc<StateRegistry>) {
        let radio = Arc::new(LoopbackRadio::new());
        let registry = Arc::new(StateRegistry::new());
        let session = ScanSession::new(registry.clone(), radio.clone(), LinkConfig::default());
        (session, radio, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_one_listener() {
        let (session, radio, registry) = session();
        session.start_scan().await.expect("start");

        assert_eq!(session.state(), ScanState::Scanning);
        assert!(radio.is_discovering());
        assert!(registry.scan_listener_active());
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        let (session, radio, _) = session();
        session.start_scan().await.expect("start");
        assert_eq!(session.start_scan().await, Err(ScanError::AlreadyScanning));
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 1);
        assert_eq!(radio.discovery_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_idempotent() {
        let (session, radio, registry) = session();
        session.start_scan().await.expect("start");

        assert!(session.stop_scan().await);
        assert!(!session.stop_scan().await);

        assert_eq!(session.state(), ScanState::Idle);
        assert!(!radio.is_discovering());
        assert!(!registry.scan_listener_active());
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_results_only_while_scanning() {
        let (session, radio, registry) = session();
        let peer = Peer::new(addr("00:11:22:33:44:55"), DeviceClass::Classic);
        assert!(!session.on_peer_discovered(peer.clone()));

        session.start_scan().await.expect("start");
        assert!(session.on_peer_discovered(peer.clone()));
        radio.discover(Peer::new(addr("00:11:22:33:44:66"), DeviceClass::Dual));
        assert_eq!(registry.peers().len(), 2);

        session.stop_scan().await;
        radio.discover(Peer::new(addr("00:11:22:33:44:77"), DeviceClass::Dual));
        assert_eq!(registry.peers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapses_on_its_own() {
        let (session, radio, registry) = session();
        session.start_scan().await.expect("start");

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(session.state(), ScanState::Idle);
        assert!(!radio.is_discovering());
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 0);
        assert!(registry.harvest_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_end_next_scan() {
        let (session, radio, _) = session();
        session.start_scan().await.expect("first");
        tokio::time::sleep(Duration::from_secs(20)).await;
        session.stop_scan().await;
        session.start_scan().await.expect("second");

        // First scan's deadline passes; second scan still has 20s left.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(session.state(), ScanState::Scanning);
        assert!(radio.is_discovering());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(session.state(), ScanState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_toggles_and_clears_peers() {
        let (session, radio, _) = session();

        let first = session.poll_or_start().await.expect("start");
        assert_eq!(first, ScanPoll::Started { window_secs: 30 });

        radio.discover(Peer::new(addr("00:11:22:33:44:55"), DeviceClass::Classic));
        let second = session.poll_or_start().await.expect("harvest");
        match second {
            ScanPoll::Harvested(peers) => assert_eq!(peers.len(), 1),
            other => panic!("expected harvest, got {:?}", other),
        }
        assert_eq!(session.state(), ScanState::Idle);

        let third = session.poll_or_start().await.expect("restart");
        assert!(matches!(third, ScanPoll::Started { .. }));
        match session.poll_or_start().await.expect("harvest") {
            ScanPoll::Harvested(peers) => assert!(peers.is_empty()),
            other => panic!("expected harvest, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_after_timeout_still_harvests() {
        let (session, radio, _) = session();
        session.poll_or_start().await.expect("start");
        radio.discover(Peer::unknown(addr("00:11:22:33:44:66")));

        tokio::time::sleep(Duration::from_secs(45)).await;

        match session.poll_or_start().await.expect("harvest") {
            ScanPoll::Harvested(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address.as_str(), "00:11:22:33:44:66");
            }
            other => panic!("expected harvest, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_after_stop_are_ignored() {
        let (session, radio, registry) = session();
        session.start_scan().await.expect("start");
        session.stop_scan().await;

        radio.emit(RadioEvent::DeviceFound(Peer::unknown(addr("00:11:22:33:44:77"))));
        assert!(registry.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_releases_listener() {
        let (session, radio, registry) = session();
        radio.set_powered(false);

        let result = session.start_scan().await;
        assert_eq!(result, Err(ScanError::Radio(RadioError::Unavailable)));
        assert_eq!(session.state(), ScanState::Idle);
        assert!(!registry.harvest_pending());
        assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discovery_failure_is_not_escalated() {
        let mut bridge = MockRadioBridge::new();
        bridge
            .expect_register_listener()
            .times(1)
            .returning(|_, _| crate::radio::ListenerId(7));
        bridge.expect_start_discovery().times(1).returning(|| Ok(()));
        bridge
            .expect_cancel_discovery()
            .times(1)
            .returning(|| Err(RadioError::Platform("adapter went away".to_string())));
        bridge
            .expect_unregister_listener()
            .times(1)
            .returning(|_| Ok(()));

        let registry = Arc::new(StateRegistry::new());
        let session = ScanSession::new(registry.clone(), Arc::new(bridge), LinkConfig::default());

        session.start_scan().await.expect("start");
        assert!(session.stop_scan().await);
        assert_eq!(session.state(), ScanState::Idle);
        assert!(!registry.scan_listener_active());
    }
}
