//! BLE Transport Seam
//!
//! The session never talks to a Bluetooth stack directly. An adapter
//! implements [`BleTransport`] to scan and open links, and [`ScaleLink`] for
//! GATT access on an open link. Notifications and link loss flow back to the
//! session through the [`LinkEvent`] channel returned by `connect`.

use crate::domain::models::DeviceAddress;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no BLE adapter available")]
    NoAdapter,
    #[error("device {0} not found")]
    DeviceNotFound(DeviceAddress),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("not connected")]
    NotConnected,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// Something the link pushed to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    Disconnected,
}

/// Advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub services: Vec<Uuid>,
}

/// An open link to a scale
pub struct Connection<L> {
    pub link: L,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Entry point into a BLE stack
#[async_trait]
pub trait BleTransport: Send + Sync {
    type Link: ScaleLink + 'static;

    /// Scan for `duration` and report every device seen
    async fn discover(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Open a GATT connection. The returned receiver yields notifications of
    /// subscribed characteristics and a final `Disconnected` on link loss.
    ///
    /// The session drops this future on cancel or timeout. An implementation
    /// must not leave a link open when that happens.
    async fn connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<Connection<Self::Link>, TransportError>;
}

/// GATT operations on an open link
#[async_trait]
pub trait ScaleLink: Send + Sync {
    /// Whether the peripheral exposes `characteristic`
    fn has_characteristic(&self, characteristic: Uuid) -> bool;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Write with response; resolves once the peripheral confirmed the write
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Caller side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: std::sync::Arc<watch::Sender<bool>>,
}

/// Session side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

/// Create a linked cancel handle and token
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle {
            sender: std::sync::Arc::new(sender),
        },
        CancelToken { receiver },
    )
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation was requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
