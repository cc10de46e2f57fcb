//! btleplug Adapter
//!
//! [`BleTransport`] implementation on top of the cross-platform `btleplug`
//! stack. Notifications and adapter disconnect events are forwarded into the
//! session's [`LinkEvent`] channel by a background task per link.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Connection, DiscoveredDevice, LinkEvent, ScaleLink, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Pause between peripheral list polls while looking for a device
const POLL_INTERVAL: Duration = Duration::from_millis(250);

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::TimedOut(duration) => TransportError::Timeout(duration),
            btleplug::Error::PermissionDenied => TransportError::Rejected(error.to_string()),
            other => TransportError::Backend(other.to_string()),
        }
    }
}

/// Address reported for a peripheral. Platforms that hide the MAC (macOS)
/// fall back to the platform peripheral id.
fn peripheral_address(peripheral: &Peripheral, properties: &PeripheralProperties) -> DeviceAddress {
    if properties.address == BDAddr::default() {
        DeviceAddress::new(peripheral.id().to_string())
    } else {
        DeviceAddress::new(properties.address.to_string())
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Use the first adapter the platform reports
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using BLE adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self { adapter })
    }

    async fn describe(&self, peripheral: &Peripheral) -> Result<Option<DiscoveredDevice>, TransportError> {
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };
        Ok(Some(DiscoveredDevice {
            address: peripheral_address(peripheral, &properties),
            name: properties.local_name,
            rssi: properties.rssi,
            manufacturer_data: properties.manufacturer_data,
            services: properties.services,
        }))
    }

    /// Poll the adapter until `address` shows up. Bounded by the caller's
    /// connect timeout.
    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, TransportError> {
        let scan = ScanGuard::start(&self.adapter).await?;
        let found = loop {
            let mut found = None;
            for peripheral in self.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                if &peripheral_address(&peripheral, &properties) == address {
                    found = Some(peripheral);
                    break;
                }
            }
            if let Some(peripheral) = found {
                break peripheral;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        scan.stop().await;
        Ok(found)
    }
}

/// Stops an active scan, also when the scanning future is dropped
struct ScanGuard {
    adapter: Option<Adapter>,
}

impl ScanGuard {
    async fn start(adapter: &Adapter) -> Result<Self, TransportError> {
        adapter.start_scan(ScanFilter::default()).await?;
        Ok(Self {
            adapter: Some(adapter.clone()),
        })
    }

    async fn stop(mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Scan abandoned, stopping it");
                handle.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        debug!("Failed to stop scan: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to stop the scan on"),
        }
    }
}

/// Disconnects a peripheral whose connect future was dropped before the
/// link was handed out
struct PendingLink {
    peripheral: Option<Peripheral>,
}

impl PendingLink {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral: Some(peripheral),
        }
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }

    fn complete(mut self) -> Result<Peripheral, TransportError> {
        self.peripheral.take().ok_or(TransportError::NotConnected)
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Connect abandoned, releasing link");
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Disconnect after abandoned connect failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release an abandoned link on"),
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn discover(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let scan = ScanGuard::start(&self.adapter).await?;
        tokio::time::sleep(duration).await;
        scan.stop().await;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(device) = self.describe(&peripheral).await? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<Connection<BtleplugLink>, TransportError> {
        let pending = PendingLink::new(self.find_peripheral(address).await?);
        let peripheral = pending.peripheral()?;

        if !peripheral.is_connected().await? {
            info!(%address, "Connecting...");
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!(%address, "Discovered {} characteristics", characteristics.len());

        // Open both streams before subscribing so no notification is missed
        let notifications = peripheral.notifications().await?;
        let central_events = self.adapter.events().await?;
        let peripheral = pending.complete()?;
        let (sender, events) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(
            peripheral.id(),
            notifications,
            central_events,
            sender,
        ));

        Ok(Connection {
            link: BtleplugLink {
                peripheral,
                characteristics,
                forwarder,
            },
            events,
        })
    }
}

async fn forward_events<N, E>(
    id: btleplug::platform::PeripheralId,
    mut notifications: N,
    mut central_events: E,
    sender: mpsc::UnboundedSender<LinkEvent>,
) where
    N: tokio_stream::Stream<Item = btleplug::api::ValueNotification> + Unpin,
    E: tokio_stream::Stream<Item = CentralEvent> + Unpin,
{
    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(notification) => {
                    trace!(uuid = %notification.uuid, "Notification: {:02X?}", notification.value);
                    let event = LinkEvent::Notification {
                        characteristic: notification.uuid,
                        value: notification.value,
                    };
                    if sender.send(event).is_err() {
                        return;
                    }
                }
                None => break,
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                Some(_) => {}
                None => break,
            },
        }
    }
    debug!("Link closed");
    let _ = sender.send(LinkEvent::Disconnected);
}

pub struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarder: JoinHandle<()>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl ScaleLink for BtleplugLink {
    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains_key(&characteristic)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .write(characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.forwarder.abort();
        match self.peripheral.disconnect().await {
            Ok(()) => Ok(()),
            Err(btleplug::Error::NotConnected) => Ok(()),
            Err(e) => {
                warn!("Disconnect failed: {}", e);
                Err(e.into())
            }
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
