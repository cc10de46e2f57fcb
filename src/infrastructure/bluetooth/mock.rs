//! Scripted in-memory transport for tests
//!
//! Records every call the session makes. Events pushed before `connect` are
//! queued on the link channel and delivered in order.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{checksum, command, WEIGHT_CHAR_UUID};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Connection, DiscoveredDevice, LinkEvent, ScaleLink, TransportError,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Discover,
    Connect(DeviceAddress),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Write(Uuid, Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct Script {
    calls: Vec<MockCall>,
    devices: Vec<DiscoveredDevice>,
    fail_discover: bool,
    hang_discover: bool,
    fail_connect: bool,
    hang_connect: bool,
    connect_delay: Option<Duration>,
    hidden_characteristics: HashSet<Uuid>,
    rejected_subscriptions: HashSet<Uuid>,
    failing_writes: u32,
    write_delay: Option<Duration>,
}

struct Shared {
    script: Mutex<Script>,
    sender: mpsc::UnboundedSender<LinkEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

pub struct MockLink {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.shared.script.lock().unwrap()
    }

    pub fn push_event(&self, event: LinkEvent) {
        self.shared.sender.send(event).unwrap();
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<LinkEvent> {
        self.shared.sender.clone()
    }

    pub fn add_device(&self, device: DiscoveredDevice) {
        self.script().devices.push(device);
    }

    pub fn fail_discover(&self) {
        self.script().fail_discover = true;
    }

    pub fn hang_discover(&self) {
        self.script().hang_discover = true;
    }

    pub fn fail_connect(&self) {
        self.script().fail_connect = true;
    }

    pub fn hang_connect(&self) {
        self.script().hang_connect = true;
    }

    /// Open the link only after `delay`
    pub fn delay_connect(&self, delay: Duration) {
        self.script().connect_delay = Some(delay);
    }

    /// Make the peripheral lack these characteristics
    pub fn hide_characteristics(&self, characteristics: &[Uuid]) {
        self.script()
            .hidden_characteristics
            .extend(characteristics.iter().copied());
    }

    pub fn reject_subscribe(&self, characteristic: Uuid) {
        self.script().rejected_subscriptions.insert(characteristic);
    }

    /// Reject the next `count` writes
    pub fn fail_writes(&self, count: u32) {
        self.script().failing_writes = count;
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.script().write_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.script().calls.clone()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Write(uuid, bytes) => Some((uuid, bytes)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.script().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn write_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Write(..)))
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Unsubscribe(_)))
    }

    pub fn disconnect_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Disconnect))
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Connect(_)))
    }

    /// Whether a `connect` call handed out a link
    pub fn link_opened(&self) -> bool {
        self.shared.receiver.lock().unwrap().is_none()
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Link = MockLink;

    async fn discover(&self, _duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let hang = {
            let mut script = self.script();
            script.calls.push(MockCall::Discover);
            if script.fail_discover {
                return Err(TransportError::NoAdapter);
            }
            script.hang_discover
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(self.script().devices.clone())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<Connection<MockLink>, TransportError> {
        let (hang, delay) = {
            let mut script = self.script();
            script.calls.push(MockCall::Connect(address.clone()));
            if script.fail_connect {
                return Err(TransportError::DeviceNotFound(address.clone()));
            }
            (script.hang_connect, script.connect_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let events = self
            .shared
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::Rejected("link already open".to_string()))?;
        Ok(Connection {
            link: MockLink {
                shared: Arc::clone(&self.shared),
            },
            events,
        })
    }
}

impl MockLink {
    fn record(&self, call: MockCall) {
        self.shared.script.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ScaleLink for MockLink {
    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        !self
            .shared
            .script
            .lock()
            .unwrap()
            .hidden_characteristics
            .contains(&characteristic)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let mut script = self.shared.script.lock().unwrap();
        script.calls.push(MockCall::Subscribe(characteristic));
        if script.rejected_subscriptions.contains(&characteristic) {
            return Err(TransportError::Rejected("subscribe".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.record(MockCall::Unsubscribe(characteristic));
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let (fail, delay) = {
            let mut script = self.shared.script.lock().unwrap();
            script
                .calls
                .push(MockCall::Write(characteristic, value.to_vec()));
            let fail = script.failing_writes > 0;
            if fail {
                script.failing_writes -= 1;
            }
            (fail, script.write_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransportError::Rejected("write".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(MockCall::Disconnect);
        Ok(())
    }
}

/// Notification on the weight characteristic
pub fn weight_notification(value: Vec<u8>) -> LinkEvent {
    LinkEvent::Notification {
        characteristic: WEIGHT_CHAR_UUID,
        value,
    }
}

/// Standard-layout weight frame
fn weight_frame(raw_weight: u16, stability: u8, resistance: u16) -> LinkEvent {
    let [w_hi, w_lo] = raw_weight.to_be_bytes();
    let [r_hi, r_lo] = resistance.to_be_bytes();
    let mut bytes = vec![
        command::WEIGHT,
        0x0B,
        0x01,
        w_hi,
        w_lo,
        stability,
        r_hi,
        r_lo,
        r_hi,
        r_lo,
    ];
    bytes.push(checksum(&bytes));
    weight_notification(bytes)
}

pub fn in_progress_frame(raw_weight: u16) -> LinkEvent {
    weight_frame(raw_weight, 0x00, 0x0000)
}

pub fn final_frame(raw_weight: u16, resistance: u16) -> LinkEvent {
    weight_frame(raw_weight, 0x01, resistance)
}
