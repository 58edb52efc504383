// bluelink core — proximity and link orchestration
//
// Decides when to scan, connect, bond or flood, and keeps every long-running
// operation to a single replaceable slot. The radio itself sits behind
// `radio::RadioBridge`.

pub mod address;
pub mod config;
pub mod dispatch;
pub mod flood;
pub mod link;
pub mod radio;
pub mod registry;
pub mod scan;

pub use address::{AddressError, DeviceAddress};
pub use config::{ConfigError, LinkConfig};
pub use dispatch::{Dispatcher, PeerRecord, Request, Response};
pub use flood::{FloodError, FloodStarted, FloodStatus, FloodWorker, StopOutcome};
pub use link::{LinkError, LinkEstablisher};
pub use radio::{
    BondState, ChannelHandle, ConnectBehavior, DeviceClass, ListenerCallback, ListenerId,
    ListenerKind, ListenerSet, LoopbackRadio, Peer, RadioBridge, RadioChannel, RadioError,
    RadioEvent, Subscription,
};
pub use registry::{
    FloodSnapshot, FloodStats, LinkSnapshot, LinkStatus, LinkStrategy, ScanState, StateRegistry,
};
pub use scan::{ScanError, ScanPoll, ScanSession};
