use crate::domain::models::{DeviceAddress, UserProfile, WeightUnit};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::session::SessionTimeouts;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "renpho_scale".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timeout overrides, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_measurement_timeout_ms")]
    pub measurement_timeout_ms: u64,
    #[serde(default = "default_max_measurement_window_ms")]
    pub max_measurement_window_ms: u64,
    #[serde(default = "default_gatt_timeout_ms")]
    pub gatt_timeout_ms: u64,
    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            measurement_timeout_ms: default_measurement_timeout_ms(),
            max_measurement_window_ms: default_max_measurement_window_ms(),
            gatt_timeout_ms: default_gatt_timeout_ms(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            measurement: Duration::from_millis(self.measurement_timeout_ms),
            max_measurement_window: Duration::from_millis(self.max_measurement_window_ms),
            gatt: Duration::from_millis(self.gatt_timeout_ms),
            write_retry_backoff: Duration::from_millis(self.write_retry_backoff_ms),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_measurement_timeout_ms() -> u64 {
    30_000
}
fn default_max_measurement_window_ms() -> u64 {
    90_000
}
fn default_gatt_timeout_ms() -> u64 {
    5_000
}
fn default_write_retry_backoff_ms() -> u64 {
    250
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Scale to talk to; discovered by scanning when unset
    #[serde(default)]
    pub device_address: Option<DeviceAddress>,
    #[serde(default)]
    pub weight_unit: WeightUnit,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Forces a characteristic layout; detected per connection when unset
    #[serde(default)]
    pub gatt_profile: Option<GattProfile>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from `settings_path`, falling back to defaults when the
    /// file is missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir().context("Could not determine config directory")?;
        path.push("RenphoScale");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember the scale address after a successful discovery
    pub fn set_device_address(&mut self, address: DeviceAddress) -> anyhow::Result<()> {
        if self.settings.device_address.as_ref() != Some(&address) {
            self.settings.device_address = Some(address);
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Sex;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "weight_unit": "lb",
            "profile": { "height_cm": 182.0, "sex": "female" },
            "timeouts": { "measurement_timeout_ms": 45000 }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.weight_unit, WeightUnit::Lb);
        assert_eq!(settings.profile.height_cm, Some(182.0));
        assert_eq!(settings.profile.sex, Some(Sex::Female));
        assert_eq!(settings.profile.age, None);
        assert_eq!(settings.device_address, None);
        assert_eq!(settings.gatt_profile, None);

        let timeouts = settings.timeouts.session_timeouts();
        assert_eq!(timeouts.measurement, Duration::from_secs(45));
        assert_eq!(timeouts.connect, Duration::from_secs(10));
        assert_eq!(timeouts.write_retry_backoff, Duration::from_millis(250));
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_gatt_profile_override() {
        let settings: Settings = serde_json::from_str(r#"{ "gatt_profile": "alternative" }"#).unwrap();
        assert_eq!(settings.gatt_profile, Some(GattProfile::Alternative));
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "renpho_settings_{}_{}.json",
            std::process::id(),
            line!()
        ));

        let mut service = SettingsService::with_path(path.clone());
        assert!(service.get().device_address.is_none());
        service
            .set_device_address(DeviceAddress::new("C8:47:8C:00:11:22"))
            .unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(
            reloaded.get().device_address,
            Some(DeviceAddress::new("C8:47:8C:00:11:22"))
        );

        let _ = fs::remove_file(path);
    }
}
