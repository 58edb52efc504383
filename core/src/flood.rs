//! Connection flood worker
//!
//! Repeatedly opens a connection-oriented channel to one target, attempts a
//! connect and closes the channel again, with a short pause between rounds.
//! Used to probe how a peer copes with connection churn. Individual outcomes
//! are only counted; the loop ends on an explicit stop and nothing else.

use crate::address::{AddressError, DeviceAddress};
use crate::config::LinkConfig;
use crate::radio::{ChannelHandle, RadioBridge, RadioError};
use crate::registry::{FloodJob, FloodSnapshot, FloodStats, StateRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FloodError {
    #[error("Invalid MAC address provided.")]
    InvalidAddress,
    #[error("Invalid PSM: {0}")]
    InvalidPort(u16),
}

impl From<AddressError> for FloodError {
    fn from(_err: AddressError) -> Self {
        FloodError::InvalidAddress
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloodStatus {
    Running,
    NotRunning,
}

/// Acknowledgement for a started job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodStarted {
    pub id: u64,
    pub address: DeviceAddress,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Round {
    Connected,
    Failed(RadioError),
    Interrupted,
}

#[derive(Clone)]
pub struct FloodWorker {
    registry: Arc<StateRegistry>,
    bridge: Arc<dyn RadioBridge>,
    config: LinkConfig,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl FloodWorker {
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

    /// Start a job against `address`, replacing any running one.
    /// `port` falls back to the configured default.
    pub async fn start(&self, address: &str, port: Option<u16>) -> Result<FloodStarted, FloodError> {
        let address = DeviceAddress::parse(address)?;
        let port = port.unwrap_or(self.config.default_psm);
        if port == 0 {
            return Err(FloodError::InvalidPort(port));
        }
        let _gate = self.gate.lock().await;

        if let Some(replaced) = self.join_current().await {
            info!("Flood job {} replaced", replaced);
        }

        let id = self.registry.next_id();
        let (stop, stop_rx) = watch::channel(false);
        self.registry.lock().flood = Some(FloodJob {
            id,
            target: address.clone(),
            port,
            running: true,
            stats: FloodStats::default(),
            stop,
            task: None,
        });

        let round = FloodRound {
            registry: Arc::clone(&self.registry),
            bridge: Arc::clone(&self.bridge),
            id,
            address: address.clone(),
            port,
            pause: self.config.flood_pause(),
            stop: stop_rx,
        };
        let task = tokio::spawn(round.run());
        {
            let mut state = self.registry.lock();
            match state.flood.as_mut() {
                Some(job) if job.id == id => job.task = Some(task),
                _ => task.abort(),
            }
        }

        info!(
            "Flood job {} started against {} on PSM {:#06x}",
            id, address, port
        );
        Ok(FloodStarted { id, address, port })
    }

    /// Stop the installed job and wait until its last channel is closed
    pub async fn shutdown(&self) -> bool {
        let _gate = self.gate.lock().await;
        match self.join_current().await {
            Some(id) => {
                info!("Flood job {} shut down", id);
                true
            }
            None => false,
        }
    }

    /// Take the installed job, signal it and join its task. Caller holds the gate.
    async fn join_current(&self) -> Option<u64> {
        let mut job = self.registry.lock().flood.take()?;
        job.running = false;
        job.stop.send_replace(true);
        if let Some(task) = job.task.take() {
            if let Err(e) = task.await {
                warn!("Flood job {} ended abnormally: {}", job.id, e);
            }
        }
        Some(job.id)
    }

    /// Signal the installed job to stop without waiting for it
    pub fn cancel(&self) -> Option<FloodSnapshot> {
        let job = self.registry.lock().flood.take()?;
        Some(signal_stop(job))
    }

    /// Stop the installed job. Stopping when nothing runs is not an error.
    pub fn stop(&self) -> StopOutcome {
        let job = self.registry.lock().flood.take();
        match job {
            Some(job) if job.is_alive() => {
                let snapshot = signal_stop(job);
                info!(
                    "Flood job {} stopped after {} attempt(s)",
                    snapshot.id, snapshot.stats.attempts
                );
                StopOutcome::Stopped
            }
            Some(job) => {
                debug!("Flood job {} had already exited", job.id);
                StopOutcome::NotRunning
            }
            None => StopOutcome::NotRunning,
        }
    }

    pub fn status(&self) -> FloodStatus {
        let state = self.registry.lock();
        match state.flood.as_ref() {
            Some(job) if job.is_alive() => FloodStatus::Running,
            _ => FloodStatus::NotRunning,
        }
    }

    pub fn current(&self) -> Option<FloodSnapshot> {
        self.registry.flood()
    }
}

fn signal_stop(mut job: FloodJob) -> FloodSnapshot {
    job.running = false;
    job.stop.send_replace(true);
    job.snapshot()
}

/// The loop body and what it needs, moved onto its own task
struct FloodRound {
    registry: Arc<StateRegistry>,
    bridge: Arc<dyn RadioBridge>,
    id: u64,
    address: DeviceAddress,
    port: u16,
    pause: Duration,
    stop: watch::Receiver<bool>,
}

impl FloodRound {
    async fn run(mut self) {
        debug!("Flood job {}: loop running", self.id);

        while self.is_running() {
            let round = self.once().await;
            if round == Round::Interrupted {
                break;
            }
            self.record(&round);

            tokio::select! {
                _ = self.stop.changed() => break,
                _ = tokio::time::sleep(self.pause) => {}
            }
        }

        self.mark_stopped();
        debug!("Flood job {}: loop exited", self.id);
    }

    fn is_running(&self) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        let state = self.registry.lock();
        state
            .flood
            .as_ref()
            .map(|job| job.id == self.id && job.running)
            .unwrap_or(false)
    }

    /// One open/connect/close round. The channel is closed on every path.
    async fn once(&mut self) -> Round {
        let channel = match self
            .bridge
            .open_insecure_l2cap_channel(&self.address, self.port)
            .await
        {
            Ok(channel) => ChannelHandle::new(channel),
            Err(e) => return Round::Failed(e),
        };

        let round = tokio::select! {
            _ = self.stop.changed() => Round::Interrupted,
            result = channel.connect() => match result {
                Ok(()) => Round::Connected,
                Err(e) => Round::Failed(e),
            },
        };
        channel.release().await;
        round
    }

    fn record(&self, round: &Round) {
        let mut state = self.registry.lock();
        let Some(job) = state.flood.as_mut().filter(|job| job.id == self.id) else {
            return;
        };
        job.stats.attempts += 1;
        match round {
            Round::Connected => {
                job.stats.connected += 1;
                debug!("Flood job {}: connected", self.id);
            }
            Round::Failed(e) => {
                job.stats.failed += 1;
                debug!("Flood job {}: attempt ended: {}", self.id, e);
            }
            Round::Interrupted => {}
        }
    }

    fn mark_stopped(&self) {
        let mut state = self.registry.lock();
        if let Some(job) = state.flood.as_mut().filter(|job| job.id == self.id) {
            job.running = false;
        }
    }
}
