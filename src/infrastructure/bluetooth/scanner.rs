//! BLE Scanner Module
//!
//! Finds Renpho scales among the advertisements a transport reports.

use crate::infrastructure::bluetooth::protocol::{self, GattProfile};
use crate::infrastructure::bluetooth::session::{SessionError, SessionResult};
use crate::infrastructure::bluetooth::transport::{BleTransport, DiscoveredDevice};
use std::time::Duration;
use tracing::{debug, info};

/// Discovers scales through a [`BleTransport`]
pub struct BleScanner<'a, T: BleTransport> {
    transport: &'a T,
    scan_duration: Duration,
}

/// Whether an advertisement looks like a Renpho scale
pub fn is_renpho_scale(device: &DiscoveredDevice) -> bool {
    if device
        .manufacturer_data
        .contains_key(&protocol::MANUFACTURER_ID)
    {
        return true;
    }

    let advertises_service = [GattProfile::Primary, GattProfile::Alternative]
        .iter()
        .any(|profile| device.services.contains(&profile.service()));
    if advertises_service {
        return true;
    }

    device
        .name
        .as_deref()
        .is_some_and(|name| name.to_lowercase().contains("renpho"))
}

impl<'a, T: BleTransport> BleScanner<'a, T> {
    pub fn new(transport: &'a T, scan_duration: Duration) -> Self {
        Self {
            transport,
            scan_duration,
        }
    }

    /// Scan once and return every scale seen, strongest signal first
    pub async fn find_scales(&self) -> SessionResult<Vec<DiscoveredDevice>> {
        info!("Scanning for scales for {:?}...", self.scan_duration);

        let devices = self
            .transport
            .discover(self.scan_duration)
            .await
            .map_err(|e| SessionError::DiscoveryFailed {
                reason: e.to_string(),
            })?;
        debug!("Scan saw {} devices", devices.len());

        let mut scales: Vec<DiscoveredDevice> =
            devices.into_iter().filter(is_renpho_scale).collect();
        scales.sort_by_key(|device| std::cmp::Reverse(device.rssi.unwrap_or(i16::MIN)));

        for scale in &scales {
            debug!(
                address = %scale.address,
                name = scale.name.as_deref().unwrap_or("Unknown"),
                rssi = ?scale.rssi,
                "Found scale"
            );
        }
        Ok(scales)
    }

    /// The scale with the strongest signal
    pub async fn find_first(&self) -> SessionResult<DiscoveredDevice> {
        let scale = self
            .find_scales()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::DiscoveryFailed {
                reason: format!("no scale advertised within {:?}", self.scan_duration),
            })?;
        info!(address = %scale.address, "Selected scale");
        Ok(scale)
    }
}
