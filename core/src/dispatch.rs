//! Request dispatcher
//!
//! Maps the four external requests onto the components and turns every
//! outcome into a structured record. Nothing is thrown across this boundary:
//! validation problems come back in an `error` field, and failures of
//! background work are only visible through later status.

use crate::config::LinkConfig;
use crate::flood::{FloodWorker, StopOutcome};
use crate::link::LinkEstablisher;
use crate::radio::{Peer, RadioBridge};
use crate::registry::StateRegistry;
use crate::scan::{ScanPoll, ScanSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Incoming command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Request {
    Scan,
    Connect {
        address: String,
    },
    Attack {
        address: String,
        #[serde(default)]
        psm: Option<u16>,
    },
    AttackStop,
}

/// One discovered device in a scan result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    /// The literal string `"null"` when the device has no name
    pub name: String,
}

impl From<Peer> for PeerRecord {
    fn from(peer: Peer) -> Self {
        Self {
            address: peer.address.to_string(),
            name: peer.display_name.unwrap_or_else(|| "null".to_string()),
        }
    }
}

/// Outgoing result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Message { message: String },
    Error { error: String },
    Status { status: StopOutcome },
    Peers(Vec<PeerRecord>),
}

impl Response {
    pub fn message(text: impl Into<String>) -> Self {
        Response::Message {
            message: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Response::Error { error: text.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Owns the registry and the three components built around it
pub struct Dispatcher {
    config: LinkConfig,
    registry: Arc<StateRegistry>,
    scan: ScanSession,
    link: LinkEstablisher,
    flood: FloodWorker,
}

impl Dispatcher {
    pub fn new(bridge: Arc<dyn RadioBridge>, config: LinkConfig) -> Self {
        let registry = Arc::new(StateRegistry::new());
        let scan = ScanSession::new(registry.clone(), bridge.clone(), config.clone());
        let link = LinkEstablisher::new(registry.clone(), bridge.clone(), scan.clone(), config.clone());
        let flood = FloodWorker::new(registry.clone(), bridge, config.clone());
        Self {
            config,
            registry,
            scan,
            link,
            flood,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn scan(&self) -> &ScanSession {
        &self.scan
    }

    pub fn link(&self) -> &LinkEstablisher {
        &self.link
    }

    pub fn flood(&self) -> &FloodWorker {
        &self.flood
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("Dispatching {:?}", request);
        match request {
            Request::Scan => match self.scan.poll_or_start().await {
                Ok(ScanPoll::Started { window_secs }) => {
                    Response::message(ScanPoll::started_message(window_secs))
                }
                Ok(ScanPoll::Harvested(peers)) => {
                    Response::Peers(peers.into_iter().map(PeerRecord::from).collect())
                }
                Err(e) => {
                    warn!("Scan request failed: {}", e);
                    Response::error(e.to_string())
                }
            },
            Request::Connect { address } => match self.link.connect(&address).await {
                Ok(_) => Response::message(format!("Connecting to {}", address)),
                Err(e) => Response::error(e.to_string()),
            },
            Request::Attack { address, psm } => match self.flood.start(&address, psm).await {
                Ok(started) => Response::message(format!(
                    "Connection spam started against {} with PSM {}",
                    started.address, started.port
                )),
                Err(e) => Response::error(e.to_string()),
            },
            Request::AttackStop => Response::Status {
                status: self.flood.stop(),
            },
        }
    }

    /// Decode one JSON request, dispatch it and encode the result
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::error(format!("Invalid request: {}", e)),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|e| format!("{{\"error\":\"Failed to encode result: {}\"}}", e))
    }

    /// Release every radio resource the components hold
    pub async fn shutdown(&self) {
        self.flood.shutdown().await;
        self.link.shutdown().await;
        self.scan.stop_scan().await;
        info!("Dispatcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::LoopbackRadio;

    #[test]
    fn test_request_wire_names() {
        let scan: Request = serde_json::from_str(r#"{"command":"scan"}"#).expect("scan");
        assert_eq!(scan, Request::Scan);

        let stop: Request = serde_json::from_str(r#"{"command":"attackStop"}"#).expect("stop");
        assert_eq!(stop, Request::AttackStop);

        let attack: Request =
            serde_json::from_str(r#"{"command":"attack","address":"00:11:22:33:44:55"}"#)
                .expect("attack");
        assert_eq!(
            attack,
            Request::Attack {
                address: "00:11:22:33:44:55".to_string(),
                psm: None
            }
        );
    }

    #[test]
    fn test_response_shapes() {
        let json = serde_json::to_value(Response::Status {
            status: StopOutcome::NotRunning,
        })
        .expect("encode");
        assert_eq!(json, serde_json::json!({"status": "not_running"}));

        let json = serde_json::to_value(Response::Peers(vec![PeerRecord {
            address: "00:11:22:33:44:55".to_string(),
            name: "null".to_string(),
        }]))
        .expect("encode");
        assert_eq!(
            json,
            serde_json::json!([{"address": "00:11:22:33:44:55", "name": "null"}])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attack_message_uses_decimal_port() {
        let dispatcher = Dispatcher::new(Arc::new(LoopbackRadio::new()), LinkConfig::default());
        let response = dispatcher
            .handle(Request::Attack {
                address: "00:11:22:33:44:55".to_string(),
                psm: None,
            })
            .await;
        assert_eq!(
            response,
            Response::message("Connection spam started against 00:11:22:33:44:55 with PSM 4097")
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_line_is_an_error_record() {
        let dispatcher = Dispatcher::new(Arc::new(LoopbackRadio::new()), LinkConfig::default());
        let out = dispatcher.handle_json("{not json").await;
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert!(value["error"]
            .as_str()
            .expect("error field")
            .starts_with("Invalid request"));
    }
}
