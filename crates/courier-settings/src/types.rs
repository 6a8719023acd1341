//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file deserializes with the remaining fields at their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{
    ApiKey, AppInfo, CodeBundleId, DeliveryConfig, DeviceInfo, config::DEFAULT_ENDPOINT,
};

use crate::errors::{Result, SettingsError};

/// Root settings, loaded from `~/.courier/settings.json`.
///
/// ```json
/// {
///   "delivery": { "apiKey": "abc123", "releaseStage": "production" },
///   "app": { "id": "com.example.app", "version": "2.1.0" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    pub version: String,
    pub delivery: DeliverySettings,
    pub app: AppInfo,
    pub device: DeviceOverrides,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl Default for CourierSettings {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            delivery: DeliverySettings::default(),
            app: AppInfo::default(),
            device: DeviceOverrides::default(),
            store: StoreSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Collector endpoint, credentials and release-stage gating.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_stage: Option<String>,
    /// Absent means every release stage delivers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_release_stages: Option<Vec<String>>,
    pub timeout_ms: u64,
    /// Name of the delivery worker thread.
    pub queue_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_bundle_id: Option<String>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            enabled: true,
            release_stage: None,
            enabled_release_stages: None,
            timeout_ms: 15_000,
            queue_name: "courier-delivery".to_string(),
            code_bundle_id: None,
        }
    }
}

/// Device fields that cannot be detected portably. Anything left unset
/// keeps the detected value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Pending-session database (relative to `~/.courier`).
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "sessions.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
    pub metrics_enabled: bool,
    pub metrics_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
            metrics_enabled: true,
            metrics_db_path: "metrics.db".to_string(),
        }
    }
}

/// `~/.courier`, falling back to `/tmp/.courier` without `HOME`.
pub fn courier_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier")
}

/// Resolve a configured path against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl CourierSettings {
    pub fn validate(&self) -> Result<()> {
        if self.delivery.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.timeoutMs must be greater than zero".into(),
            ));
        }
        if self.delivery.endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue("delivery.endpoint is empty".into()));
        }
        if self.delivery.queue_name.trim().is_empty() {
            return Err(SettingsError::InvalidValue("delivery.queueName is empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.timeout_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        resolve_path(&courier_home(), &self.store.db_path)
    }

    /// Build the engine configuration. The code bundle id starts from the
    /// configured value and can be changed later through the client.
    pub fn delivery_config(&self) -> DeliveryConfig {
        let mut device = DeviceInfo::detect();
        if let Some(v) = &self.device.os_version {
            device.os_version = Some(v.clone());
        }
        if let Some(v) = &self.device.model {
            device.model = Some(v.clone());
        }
        if let Some(v) = &self.device.manufacturer {
            device.manufacturer = Some(v.clone());
        }

        DeliveryConfig {
            endpoint: self.delivery.endpoint.clone(),
            api_key: self.delivery.api_key.as_deref().map(ApiKey::new),
            enabled: self.delivery.enabled,
            release_stage: self.delivery.release_stage.clone(),
            enabled_release_stages: self.delivery.enabled_release_stages.clone(),
            app: self.app.clone(),
            device,
            request_timeout: self.request_timeout(),
            code_bundle_id: CodeBundleId::new(self.delivery.code_bundle_id.clone()),
            ..DeliveryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = CourierSettings::default();
        assert_eq!(settings.delivery.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.delivery.timeout_ms, 15_000);
        assert!(settings.delivery.enabled);
        assert!(settings.delivery.api_key.is_none());
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(CourierSettings::default()).unwrap();
        assert!(json["delivery"]["timeoutMs"].is_u64());
        assert!(json["delivery"]["queueName"].is_string());
        assert!(json["logging"]["logToSqlite"].is_boolean());
        assert!(json["delivery"].get("apiKey").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: CourierSettings =
            serde_json::from_str(r#"{"delivery": {"apiKey": "k"}}"#).unwrap();
        assert_eq!(settings.delivery.api_key.as_deref(), Some("k"));
        assert_eq!(settings.delivery.timeout_ms, 15_000);
        assert_eq!(settings.store.db_path, "sessions.db");
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut settings = CourierSettings::default();
        settings.delivery.timeout_ms = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn delivery_config_maps_fields() {
        let mut settings = CourierSettings::default();
        settings.delivery.api_key = Some("secret".into());
        settings.delivery.release_stage = Some("beta".into());
        settings.delivery.enabled_release_stages = Some(vec!["beta".into()]);
        settings.delivery.timeout_ms = 2_500;
        settings.delivery.code_bundle_id = Some("bundle-1".into());
        settings.app.id = Some("com.example".into());
        settings.device.model = Some("Pixel 9".into());

        let config = settings.delivery_config();
        assert_eq!(config.api_key.as_ref().map(|k| k.expose()), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_millis(2_500));
        assert_eq!(config.code_bundle_id.get().as_deref(), Some("bundle-1"));
        assert_eq!(config.app.id.as_deref(), Some("com.example"));
        assert_eq!(config.device.model.as_deref(), Some("Pixel 9"));
        assert_eq!(config.device.os_name.as_deref(), Some(std::env::consts::OS));
        assert_eq!(config.skip_reason(), None);
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let base = Path::new("/data/courier");
        assert_eq!(resolve_path(base, "logs.db"), PathBuf::from("/data/courier/logs.db"));
        assert_eq!(resolve_path(base, "/var/x.db"), PathBuf::from("/var/x.db"));
    }
}
