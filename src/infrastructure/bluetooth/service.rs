//! Scale Service Module
//!
//! Caller-facing coordinator: resolves the scale to use, runs one session per
//! request, serializes sessions per address and pushes results as
//! [`ScaleEvent`]s.

use crate::domain::models::{DeviceAddress, MeasurementReport, ScaleEvent, UserProfile, WeightUnit};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    scanner::BleScanner,
    session::{ScaleSession, SessionConfig, SessionError, SessionResult, SessionTimeouts},
    transport::{cancel_pair, BleTransport, CancelHandle, CancelToken},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A request the service is working on, from discovery to teardown
struct ActiveRequest {
    /// `None` while the scale is still being discovered
    address: Option<DeviceAddress>,
    handle: CancelHandle,
}

type ActiveRequests = Mutex<HashMap<u64, ActiveRequest>>;

/// Keeps a request cancellable until it is dropped
struct Registration<'a> {
    active: &'a ActiveRequests,
    id: u64,
}

impl Registration<'_> {
    fn set_address(&self, address: &DeviceAddress) {
        if let Some(request) = lock(self.active).get_mut(&self.id) {
            request.address = Some(address.clone());
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.id);
    }
}

/// Main service coordinating measurements against one transport
pub struct ScaleService<T: BleTransport> {
    transport: Arc<T>,
    settings: Arc<Mutex<SettingsService>>,
    event_sender: mpsc::UnboundedSender<ScaleEvent>,
    device_locks: Mutex<HashMap<DeviceAddress, Arc<tokio::sync::Mutex<()>>>>,
    active: ActiveRequests,
    next_request: AtomicU64,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: BleTransport> ScaleService<T> {
    pub fn new(
        transport: Arc<T>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<ScaleEvent>,
    ) -> Self {
        Self {
            transport,
            settings,
            event_sender,
            device_locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
        }
    }

    /// Run one measurement. Scans for a scale first when `address` is `None`.
    pub async fn run_measurement_session(
        &self,
        address: Option<DeviceAddress>,
        unit: WeightUnit,
        profile: UserProfile,
        timeouts: SessionTimeouts,
    ) -> SessionResult<MeasurementReport> {
        let (registration, mut token) = self.register(address.clone());
        let address = match address {
            Some(address) => address,
            None => self.discover(&mut token).await?,
        };
        registration.set_address(&address);

        self.measure(&address, unit, profile, timeouts, token).await
    }

    /// Manual trigger using the configured address, unit, profile and
    /// timeouts. A scale found by scanning is remembered once it delivered a
    /// measurement.
    pub async fn trigger_measurement(&self) -> SessionResult<MeasurementReport> {
        let settings = lock(&self.settings).get().clone();
        let (registration, mut token) = self.register(settings.device_address.clone());

        let (address, discovered) = match settings.device_address {
            Some(address) => (address, false),
            None => (self.discover(&mut token).await?, true),
        };
        registration.set_address(&address);

        let report = self
            .measure(
                &address,
                settings.weight_unit,
                settings.profile,
                settings.timeouts.session_timeouts(),
                token,
            )
            .await?;

        if discovered {
            if let Err(e) = lock(&self.settings).set_device_address(address.clone()) {
                warn!(%address, "Could not remember scale address: {:#}", e);
            }
        }
        Ok(report)
    }

    /// Cancel every request for `address`, running or waiting for its turn
    pub fn cancel(&self, address: &DeviceAddress) -> bool {
        let mut cancelled = false;
        for request in lock(&self.active).values() {
            if request.address.as_ref() == Some(address) {
                request.handle.cancel();
                cancelled = true;
            }
        }
        if cancelled {
            info!(%address, "Cancelling session");
        }
        cancelled
    }

    /// Cancel every request, including those still discovering a scale
    pub fn cancel_all(&self) {
        for request in lock(&self.active).values() {
            match &request.address {
                Some(address) => info!(%address, "Cancelling session"),
                None => info!("Cancelling discovery"),
            }
            request.handle.cancel();
        }
    }

    fn register(&self, address: Option<DeviceAddress>) -> (Registration<'_>, CancelToken) {
        let (handle, token) = cancel_pair();
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        lock(&self.active).insert(id, ActiveRequest { address, handle });
        (
            Registration {
                active: &self.active,
                id,
            },
            token,
        )
    }

    async fn discover(&self, token: &mut CancelToken) -> SessionResult<DeviceAddress> {
        let scan_duration = lock(&self.settings).get().timeouts.discovery_timeout();
        let scanner = BleScanner::new(self.transport.as_ref(), scan_duration);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = scanner.find_first() => result,
        };
        result
            .map(|device| device.address)
            .map_err(|e| self.failed(None, e))
    }

    async fn measure(
        &self,
        address: &DeviceAddress,
        unit: WeightUnit,
        profile: UserProfile,
        timeouts: SessionTimeouts,
        mut token: CancelToken,
    ) -> SessionResult<MeasurementReport> {
        let config = SessionConfig {
            unit,
            profile,
            timeouts,
            gatt_profile: lock(&self.settings).get().gatt_profile,
        };

        let device_lock = Arc::clone(
            lock(&self.device_locks)
                .entry(address.clone())
                .or_default(),
        );
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(self.failed(Some(address.clone()), SessionError::Cancelled));
            }
            permit = device_lock.lock() => permit,
        };
        debug!(%address, "Scale is free");

        self.publish(ScaleEvent::SessionStarted(address.clone()));
        let result = ScaleSession::new(self.transport.as_ref(), config)
            .run(address, token)
            .await;

        match result {
            Ok(measurement) => {
                let report = MeasurementReport::new(&measurement, unit);
                self.publish(ScaleEvent::Measurement {
                    address: address.clone(),
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => Err(self.failed(Some(address.clone()), e)),
        }
    }

    /// Publish a failure and hand the error back
    fn failed(&self, address: Option<DeviceAddress>, error: SessionError) -> SessionError {
        self.publish(ScaleEvent::Failed {
            address,
            kind: error.kind(),
            message: error.to_string(),
        });
        error
    }

    fn publish(&self, event: ScaleEvent) {
        // Observers are optional
        let _ = self.event_sender.send(event);
    }
}
