// btleplug-backed radio
//
// Binds the first system adapter. Discovery maps onto LE scanning and
// adapter events become device-found notifications. btleplug has no
// pairing API, so a pairing request is carried out as a peripheral connect
// and its result reported as a bond-state change. It exposes neither
// serial-profile sockets nor raw L2CAP channels; both report Unsupported.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bluelink_core::{
    BondState, DeviceAddress, DeviceClass, ListenerCallback, ListenerId, ListenerKind,
    ListenerSet, Peer, RadioBridge, RadioChannel, RadioError, RadioEvent,
};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BtleRadio {
    adapter: Adapter,
    listeners: Arc<ListenerSet>,
    pump: JoinHandle<()>,
}

impl BtleRadio {
    /// Open the first adapter the platform reports
    pub async fn first_adapter() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to start Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        let listeners = Arc::new(ListenerSet::new());
        let events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let pump = {
            let adapter = adapter.clone();
            let listeners = Arc::clone(&listeners);
            tokio::spawn(async move {
                let mut events = events;
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            let Ok(peripheral) = adapter.peripheral(&id).await else {
                                continue;
                            };
                            if let Some(peer) = describe(&peripheral).await {
                                listeners.emit(RadioEvent::DeviceFound(peer));
                            }
                        }
                        other => debug!("Adapter event: {:?}", other),
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            listeners,
            pump,
        })
    }

    async fn find(&self, address: &DeviceAddress) -> Result<Option<Peripheral>, RadioError> {
        let peripherals = self.adapter.peripherals().await.map_err(platform)?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.address().to_string() == address.as_str()))
    }
}

impl Drop for BtleRadio {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn platform(err: btleplug::Error) -> RadioError {
    RadioError::Platform(err.to_string())
}

async fn describe(peripheral: &Peripheral) -> Option<Peer> {
    let address = DeviceAddress::parse(&peripheral.address().to_string()).ok()?;
    let name = peripheral
        .properties()
        .await
        .ok()
        .flatten()
        .and_then(|props| props.local_name);
    Some(Peer {
        address,
        display_name: name,
        device_class: DeviceClass::LowEnergy,
    })
}

#[async_trait]
impl RadioBridge for BtleRadio {
    async fn start_discovery(&self) -> Result<(), RadioError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(platform)
    }

    async fn cancel_discovery(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await.map_err(platform)
    }

    async fn remote_device(&self, address: &DeviceAddress) -> Result<Peer, RadioError> {
        match self.find(address).await? {
            Some(peripheral) => Ok(describe(&peripheral)
                .await
                .unwrap_or_else(|| Peer::unknown(address.clone()))),
            None => Ok(Peer::unknown(address.clone())),
        }
    }

    async fn open_serial_channel(
        &self,
        _address: &DeviceAddress,
        _service_uuid: &str,
    ) -> Result<Box<dyn RadioChannel>, RadioError> {
        Err(RadioError::Unsupported(
            "serial-profile sockets are not available through btleplug".to_string(),
        ))
    }

    async fn open_insecure_l2cap_channel(
        &self,
        _address: &DeviceAddress,
        _psm: u16,
    ) -> Result<Box<dyn RadioChannel>, RadioError> {
        Err(RadioError::Unsupported(
            "L2CAP channels are not available through btleplug".to_string(),
        ))
    }

    async fn create_bond(&self, address: &DeviceAddress) -> Result<bool, RadioError> {
        let Some(peripheral) = self.find(address).await? else {
            warn!("Cannot pair with {}: not seen by the adapter", address);
            return Ok(false);
        };

        let listeners = Arc::clone(&self.listeners);
        let address = address.clone();
        tokio::spawn(async move {
            listeners.emit(RadioEvent::BondStateChanged {
                address: address.clone(),
                previous: BondState::None,
                current: BondState::Bonding,
            });
            let current = match peripheral.connect().await {
                Ok(()) => BondState::Bonded,
                Err(e) => {
                    warn!("Connecting to {} failed: {}", address, e);
                    BondState::None
                }
            };
            listeners.emit(RadioEvent::BondStateChanged {
                address,
                previous: BondState::Bonding,
                current,
            });
        });
        Ok(true)
    }

    fn register_listener(&self, kind: ListenerKind, callback: ListenerCallback) -> ListenerId {
        self.listeners.register(kind, callback)
    }

    fn unregister_listener(&self, id: ListenerId) -> Result<(), RadioError> {
        self.listeners.unregister(id)
    }
}
