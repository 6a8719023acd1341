use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::SkipReason;

pub const DEFAULT_ENDPOINT: &str = "https://sessions.courier.dev";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Wraps the collector API key (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Identifies the library that produced the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierInfo {
    pub name: String,
    pub version: String,
    pub url: String,
}

impl Default for NotifierInfo {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            url: "https://github.com/courier-rs/courier".to_string(),
        }
    }
}

/// Static description of the host application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_version: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
}

/// Description of the device the host application runs on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_versions: BTreeMap<String, String>,
}

impl DeviceInfo {
    /// Whatever can be learned about the current machine without platform APIs.
    pub fn detect() -> Self {
        let mut runtime_versions = BTreeMap::new();
        runtime_versions.insert("courier".to_string(), env!("CARGO_PKG_VERSION").to_string());
        Self {
            os_name: Some(std::env::consts::OS.to_string()),
            os_version: None,
            model: Some(std::env::consts::ARCH.to_string()),
            manufacturer: None,
            runtime_versions,
        }
    }
}

/// Shared, externally mutable code bundle tag (for apps whose JS/asset bundle
/// is updated over the air). Every clone observes the same value; a read
/// always yields one whole value, never a partial write.
#[derive(Clone, Debug, Default)]
pub struct CodeBundleId(Arc<RwLock<Option<Arc<str>>>>);

impl CodeBundleId {
    pub fn new(value: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(value.map(Arc::from))))
    }

    pub fn get(&self) -> Option<Arc<str>> {
        self.0.read().clone()
    }

    pub fn set(&self, value: Option<String>) {
        *self.0.write() = value.map(Arc::from);
    }
}

/// Everything the delivery engine reads from the host application.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub endpoint: String,
    pub api_key: Option<ApiKey>,
    pub enabled: bool,
    pub release_stage: Option<String>,
    /// `None` means every stage delivers.
    pub enabled_release_stages: Option<Vec<String>>,
    pub app: AppInfo,
    pub device: DeviceInfo,
    pub notifier: NotifierInfo,
    pub request_timeout: Duration,
    pub code_bundle_id: CodeBundleId,
}

impl DeliveryConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: Some(ApiKey::new(api_key)),
            ..Self::default()
        }
    }

    /// `Some(reason)` if attempts under this configuration must not touch
    /// the network.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if !self.enabled {
            return Some(SkipReason::Disabled);
        }
        match &self.api_key {
            Some(key) if !key.expose().trim().is_empty() => {}
            _ => return Some(SkipReason::MissingApiKey),
        }
        if let Some(stages) = &self.enabled_release_stages {
            let allowed = self
                .release_stage
                .as_ref()
                .is_some_and(|stage| stages.iter().any(|s| s == stage));
            if !allowed {
                return Some(SkipReason::ReleaseStageFiltered {
                    stage: self.release_stage.clone(),
                });
            }
        }
        None
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            enabled: true,
            release_stage: None,
            enabled_release_stages: None,
            app: AppInfo::default(),
            device: DeviceInfo::detect(),
            notifier: NotifierInfo::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            code_bundle_id: CodeBundleId::default(),
        }
    }
}
