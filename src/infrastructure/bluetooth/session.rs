//! Scale Session
//!
//! Drives one measurement from connect to teardown:
//!
//! ```text
//! Idle -> Connecting -> SubscribingNotifications -> SendingHandshake
//!      -> AwaitingMeasurement -> Completed | Failed
//! ```
//!
//! The link is always released (unsubscribe, disconnect) before `run`
//! returns, whatever the outcome.

use crate::domain::body_composition::compute_body_composition;
use crate::domain::models::{
    DeviceAddress, Measurement, ParsedMeasurement, UserProfile, WeightUnit,
};
use crate::infrastructure::bluetooth::protocol::{
    self, CommandKind, GattProfile, ParsedFrame, StatusFrame, StatusKind, WeightScale,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CancelToken, Connection, LinkEvent, ScaleLink, TransportError,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// A rejected write is retried once
const WRITE_ATTEMPTS: u32 = 2;

/// Protocol type sent before the scale announced its own
const INITIAL_PROTOCOL_TYPE: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Time allowed to open the link
    pub connect: Duration,
    /// Time allowed between handshake completion (or the last in-progress
    /// reading) and the final reading
    pub measurement: Duration,
    /// Hard cap on the measurement phase, counted from handshake completion
    pub max_measurement_window: Duration,
    /// Time allowed for a single subscribe, write or teardown step
    pub gatt: Duration,
    /// Pause before retrying a rejected write
    pub write_retry_backoff: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            measurement: Duration::from_secs(30),
            max_measurement_window: Duration::from_secs(90),
            gatt: Duration::from_secs(5),
            write_retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionConfig {
    pub unit: WeightUnit,
    pub profile: UserProfile,
    pub timeouts: SessionTimeouts,
    /// Characteristic layout; detected per link when `None`
    pub gatt_profile: Option<GattProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    SubscribingNotifications,
    SendingHandshake,
    AwaitingMeasurement,
    Completed,
    Failed,
}

/// Classification of a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    DiscoveryFailed,
    ConnectFailed,
    SubscribeFailed,
    WriteFailed,
    MeasurementTimeout,
    Cancelled,
    Disconnected,
}

impl FailureKind {
    /// Process exit code for this failure
    pub fn exit_code(self) -> i32 {
        match self {
            Self::DiscoveryFailed => 10,
            Self::ConnectFailed => 11,
            Self::SubscribeFailed => 12,
            Self::WriteFailed => 13,
            Self::MeasurementTimeout => 14,
            Self::Cancelled => 15,
            Self::Disconnected => 16,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("no scale found: {reason}")]
    DiscoveryFailed { reason: String },
    #[error("could not connect: {reason}")]
    ConnectFailed { reason: String },
    #[error("subscribing to {characteristic} failed: {source}")]
    SubscribeFailed {
        characteristic: Uuid,
        source: TransportError,
    },
    #[error("writing {command} failed after retry: {source}")]
    WriteFailed {
        command: &'static str,
        source: TransportError,
    },
    #[error("no final reading within {waited:?} ({malformed_frames} malformed frames)")]
    MeasurementTimeout {
        waited: Duration,
        malformed_frames: u32,
    },
    #[error("session cancelled")]
    Cancelled,
    #[error("scale disconnected during measurement")]
    Disconnected,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DiscoveryFailed { .. } => FailureKind::DiscoveryFailed,
            Self::ConnectFailed { .. } => FailureKind::ConnectFailed,
            Self::SubscribeFailed { .. } => FailureKind::SubscribeFailed,
            Self::WriteFailed { .. } => FailureKind::WriteFailed,
            Self::MeasurementTimeout { .. } => FailureKind::MeasurementTimeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Disconnected => FailureKind::Disconnected,
        }
    }

    fn link_dropped() -> Self {
        Self::ConnectFailed {
            reason: "link dropped before handshake completed".to_string(),
        }
    }
}

pub type SessionResult<T = Measurement> = Result<T, SessionError>;

/// Releases the link exactly once: explicitly through [`Self::release`], or
/// from `Drop` on the current runtime when the session future is abandoned.
struct TeardownGuard<L: ScaleLink + 'static> {
    link: Option<Arc<L>>,
    subscribed: Vec<Uuid>,
    step_timeout: Duration,
}

impl<L: ScaleLink + 'static> TeardownGuard<L> {
    fn new(link: L, step_timeout: Duration) -> Self {
        Self {
            link: Some(Arc::new(link)),
            subscribed: Vec::new(),
            step_timeout,
        }
    }

    fn link(&self) -> Option<Arc<L>> {
        self.link.clone()
    }

    async fn release(mut self) {
        if let Some(link) = self.link.take() {
            let subscribed = std::mem::take(&mut self.subscribed);
            release_link(link.as_ref(), &subscribed, self.step_timeout).await;
        }
    }
}

impl<L: ScaleLink + 'static> Drop for TeardownGuard<L> {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let subscribed = std::mem::take(&mut self.subscribed);
        let step_timeout = self.step_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Session abandoned mid-flight, releasing link in background");
                handle.spawn(async move {
                    release_link(link.as_ref(), &subscribed, step_timeout).await;
                });
            }
            Err(_) => warn!("Session dropped outside a runtime, link left open"),
        }
    }
}

async fn release_link<L: ScaleLink>(link: &L, subscribed: &[Uuid], step_timeout: Duration) {
    for &characteristic in subscribed {
        match time::timeout(step_timeout, link.unsubscribe(characteristic)).await {
            Ok(Ok(())) => trace!(%characteristic, "Unsubscribed"),
            Ok(Err(e)) => warn!(%characteristic, "Unsubscribe failed: {}", e),
            Err(_) => warn!(%characteristic, "Unsubscribe timed out"),
        }
    }
    match time::timeout(step_timeout, link.disconnect()).await {
        Ok(Ok(())) => debug!("Link released"),
        Ok(Err(e)) => warn!("Disconnect failed: {}", e),
        Err(_) => warn!("Disconnect timed out"),
    }
}

/// Link events, plus notifications that arrived before the session was
/// ready to interpret them
struct LinkEvents {
    receiver: mpsc::UnboundedReceiver<LinkEvent>,
    backlog: VecDeque<(Uuid, Vec<u8>)>,
    lost: bool,
}

impl LinkEvents {
    fn new(receiver: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        Self {
            receiver,
            backlog: VecDeque::new(),
            lost: false,
        }
    }

    fn accept(&mut self, event: Option<LinkEvent>) -> Option<(Uuid, Vec<u8>)> {
        match event {
            Some(LinkEvent::Notification {
                characteristic,
                value,
            }) => Some((characteristic, value)),
            Some(LinkEvent::Disconnected) | None => {
                self.lost = true;
                None
            }
        }
    }

    /// Resolves once the link is reported lost. Notifications seen meanwhile
    /// are kept for [`Self::next`].
    async fn lost(&mut self) {
        while !self.lost {
            let event = self.receiver.recv().await;
            if let Some(notification) = self.accept(event) {
                self.backlog.push_back(notification);
            }
        }
    }

    /// Next notification in arrival order, `None` once the link is lost
    async fn next(&mut self) -> Option<(Uuid, Vec<u8>)> {
        if let Some(notification) = self.backlog.pop_front() {
            return Some(notification);
        }
        if self.lost {
            return None;
        }
        let event = self.receiver.recv().await;
        self.accept(event)
    }
}

/// Per-measurement state, owned exclusively by one session
struct Accumulator {
    profile: GattProfile,
    weight_scale: WeightScale,
    malformed_frames: u32,
    in_progress_frames: u32,
}

/// One end-to-end measurement against one scale
pub struct ScaleSession<'a, T: BleTransport> {
    transport: &'a T,
    config: SessionConfig,
    state: SessionState,
}

impl<'a, T: BleTransport> ScaleSession<'a, T> {
    pub fn new(transport: &'a T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the session to completion. Cancellation through `cancel` is
    /// observed at every suspension point.
    pub async fn run(&mut self, address: &DeviceAddress, mut cancel: CancelToken) -> SessionResult {
        info!(%address, unit = %self.config.unit, "Starting measurement session");

        let result = self.drive(address, &mut cancel).await;
        match &result {
            Ok(measurement) => {
                self.transition(SessionState::Completed);
                info!(
                    %address,
                    weight_kg = measurement.reading.weight_kg,
                    malformed_frames = measurement.malformed_frames,
                    "Measurement completed"
                );
            }
            Err(e) => {
                self.transition(SessionState::Failed);
                warn!(%address, kind = ?e.kind(), "Measurement failed: {}", e);
            }
        }
        result
    }

    async fn drive(&mut self, address: &DeviceAddress, cancel: &mut CancelToken) -> SessionResult {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        self.transition(SessionState::Connecting);
        let Connection { link, events } = self.connect(address, cancel).await?;
        let mut events = LinkEvents::new(events);

        let mut guard = TeardownGuard::new(link, self.config.timeouts.gatt);
        let result = self.exchange(&mut guard, &mut events, cancel).await;
        guard.release().await;
        result
    }

    /// A link that opens after cancel or timeout won the race is never handed
    /// out; the transport releases it when the connect future is dropped.
    async fn connect(
        &self,
        address: &DeviceAddress,
        cancel: &mut CancelToken,
    ) -> SessionResult<Connection<T::Link>> {
        let timeout = self.config.timeouts.connect;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = time::timeout(timeout, self.transport.connect(address)) => match result {
                Ok(Ok(connection)) => {
                    info!(%address, "Link open");
                    Ok(connection)
                }
                Ok(Err(e)) => Err(SessionError::ConnectFailed { reason: e.to_string() }),
                Err(_) => Err(SessionError::ConnectFailed {
                    reason: format!("no link within {:?}", timeout),
                }),
            },
        }
    }

    async fn exchange(
        &mut self,
        guard: &mut TeardownGuard<T::Link>,
        events: &mut LinkEvents,
        cancel: &mut CancelToken,
    ) -> SessionResult {
        let Some(link) = guard.link() else {
            return Err(SessionError::link_dropped());
        };
        let link = link.as_ref();

        let profile = match self.config.gatt_profile {
            Some(profile) => profile,
            None => {
                let detected = GattProfile::detect(|uuid| link.has_characteristic(uuid));
                debug!(?detected, "Detected GATT profile");
                detected
            }
        };
        let mut acc = Accumulator {
            profile,
            weight_scale: profile.weight_scale(WeightScale::default()),
            malformed_frames: 0,
            in_progress_frames: 0,
        };

        self.transition(SessionState::SubscribingNotifications);
        for characteristic in profile.subscriptions() {
            match self
                .guarded(cancel, events, link.subscribe(characteristic))
                .await?
            {
                Ok(()) => {
                    debug!(%characteristic, "Subscribed");
                    guard.subscribed.push(characteristic);
                }
                Err(TransportError::NotConnected) => return Err(self.link_lost()),
                Err(source) => {
                    return Err(SessionError::SubscribeFailed {
                        characteristic,
                        source,
                    })
                }
            }
        }

        // Scales only start streaming when the weight request precedes the time sync
        self.transition(SessionState::SendingHandshake);
        self.write_command(
            link,
            events,
            cancel,
            profile.command_characteristic(),
            CommandKind::WeightRequest {
                unit: self.config.unit,
                protocol_type: INITIAL_PROTOCOL_TYPE,
            },
        )
        .await?;
        self.write_command(
            link,
            events,
            cancel,
            profile.time_sync_characteristic(),
            CommandKind::TimeSync {
                timestamp: chrono::Utc::now().timestamp(),
            },
        )
        .await?;

        self.transition(SessionState::AwaitingMeasurement);
        self.await_measurement(link, events, cancel, &mut acc).await
    }

    async fn await_measurement(
        &self,
        link: &T::Link,
        events: &mut LinkEvents,
        cancel: &mut CancelToken,
        acc: &mut Accumulator,
    ) -> SessionResult {
        let timeouts = self.config.timeouts;
        let started = Instant::now();
        let hard_deadline = started + timeouts.max_measurement_window;
        let mut deadline = started + timeouts.measurement;

        loop {
            let notification = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = time::sleep_until(deadline.min(hard_deadline)) => {
                    return Err(SessionError::MeasurementTimeout {
                        waited: started.elapsed(),
                        malformed_frames: acc.malformed_frames,
                    });
                }
                notification = events.next() => notification,
            };

            let Some((characteristic, value)) = notification else {
                return Err(SessionError::Disconnected);
            };

            let Some(source) = acc.profile.characteristic_id(characteristic) else {
                trace!(%characteristic, "Ignoring notification from unexpected characteristic");
                continue;
            };
            trace!(?source, "Notification: {:02X?}", value);

            match protocol::parse_notification(source, &value, acc.weight_scale) {
                Err(e) => {
                    acc.malformed_frames += 1;
                    warn!(?source, "Dropping malformed frame: {}", e);
                }
                Ok(ParsedFrame::InProgress(reading)) => {
                    acc.in_progress_frames += 1;
                    debug!(weight_kg = reading.weight_kg, "Unsteady reading");
                    deadline = Instant::now() + timeouts.measurement;
                }
                Ok(ParsedFrame::Final(reading)) if reading.weight_kg > 0.0 => {
                    debug!(
                        in_progress_frames = acc.in_progress_frames,
                        "Final reading {:.2} kg, resistance {:?}/{:?}",
                        reading.weight_kg,
                        reading.resistance,
                        reading.secondary_resistance
                    );
                    return Ok(self.complete(reading, acc.malformed_frames));
                }
                Ok(ParsedFrame::Final(_)) => debug!("Ignoring empty final reading"),
                Ok(ParsedFrame::Status(status)) => {
                    self.handle_status(link, events, cancel, acc, status).await?;
                }
                Ok(ParsedFrame::Unknown { command }) => {
                    debug!("Ignoring unknown command {:#04X}", command);
                }
            }
        }
    }

    fn complete(&self, reading: ParsedMeasurement, malformed_frames: u32) -> Measurement {
        Measurement {
            reading,
            body_composition: compute_body_composition(&reading, &self.config.profile),
            malformed_frames,
            completed_at: chrono::Utc::now(),
        }
    }

    /// Apply a control frame and send the reply the scale expects
    async fn handle_status(
        &self,
        link: &T::Link,
        events: &mut LinkEvents,
        cancel: &mut CancelToken,
        acc: &mut Accumulator,
        status: StatusFrame,
    ) -> SessionResult<()> {
        if let StatusKind::ScaleSettings {
            weight_scale: Some(reported),
        } = status.kind
        {
            acc.weight_scale = acc.profile.weight_scale(reported);
            debug!(divisor = acc.weight_scale.divisor(), "Scale reported weight precision");
        }

        let Some(kind) = status.kind.ack() else {
            trace!(?status, "Status frame");
            return Ok(());
        };

        let bytes = protocol::build_command(CommandKind::Ack {
            kind,
            protocol_type: status.protocol_type,
            unit: self.config.unit,
        });
        debug!(?kind, "Acknowledging: {:02X?}", bytes);

        // Best effort: a lost reply only delays the scale
        let characteristic = acc.profile.command_characteristic();
        if let Err(e) = self
            .guarded(cancel, events, link.write(characteristic, &bytes))
            .await?
        {
            warn!(?kind, "Reply rejected: {}", e);
        }
        Ok(())
    }

    /// Write a command, retrying once after a short backoff
    async fn write_command(
        &self,
        link: &T::Link,
        events: &mut LinkEvents,
        cancel: &mut CancelToken,
        characteristic: Uuid,
        kind: CommandKind,
    ) -> SessionResult<()> {
        let bytes = protocol::build_command(kind);
        let command = kind.name();

        let mut attempt = 1;
        loop {
            debug!(command, attempt, "Writing {:02X?}", bytes);
            match self
                .guarded(cancel, events, link.write(characteristic, &bytes))
                .await?
            {
                Ok(()) => return Ok(()),
                Err(TransportError::NotConnected) => return Err(self.link_lost()),
                Err(source) if attempt >= WRITE_ATTEMPTS => {
                    return Err(SessionError::WriteFailed { command, source });
                }
                Err(e) => {
                    warn!(command, "Write rejected: {}. Retrying...", e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                        _ = events.lost() => return Err(self.link_lost()),
                        _ = time::sleep(self.config.timeouts.write_retry_backoff) => {}
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Failure reported when the link goes away in the current state
    fn link_lost(&self) -> SessionError {
        match self.state {
            SessionState::AwaitingMeasurement => SessionError::Disconnected,
            _ => SessionError::link_dropped(),
        }
    }

    /// Await a GATT operation bounded by the step timeout, aborting on cancel
    /// or link loss
    async fn guarded<F, R>(
        &self,
        cancel: &mut CancelToken,
        events: &mut LinkEvents,
        operation: F,
    ) -> SessionResult<Result<R, TransportError>>
    where
        F: Future<Output = Result<R, TransportError>>,
    {
        let timeout = self.config.timeouts.gatt;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = events.lost() => Err(self.link_lost()),
            result = time::timeout(timeout, operation) => {
                Ok(result.unwrap_or(Err(TransportError::Timeout(timeout))))
            }
        }
    }
}
