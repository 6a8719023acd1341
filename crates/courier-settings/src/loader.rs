//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If `~/.courier/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CourierSettings, courier_home};

pub const ENV_ENDPOINT: &str = "COURIER_ENDPOINT";
pub const ENV_API_KEY: &str = "COURIER_API_KEY";
pub const ENV_ENABLED: &str = "COURIER_ENABLED";
pub const ENV_RELEASE_STAGE: &str = "COURIER_RELEASE_STAGE";
pub const ENV_TIMEOUT_MS: &str = "COURIER_TIMEOUT_MS";
pub const ENV_STORE_PATH: &str = "COURIER_STORE_PATH";
pub const ENV_LOG_LEVEL: &str = "COURIER_LOG_LEVEL";

/// Path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    courier_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Empty values are treated as unset;
/// values that fail to parse are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut CourierSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read(ENV_ENDPOINT) {
        settings.delivery.endpoint = v;
    }
    if let Some(v) = read(ENV_API_KEY) {
        settings.delivery.api_key = Some(v);
    }
    if let Some(v) = read(ENV_ENABLED) {
        match parse_bool(&v) {
            Some(enabled) => settings.delivery.enabled = enabled,
            None => warn!(key = ENV_ENABLED, value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_RELEASE_STAGE) {
        settings.delivery.release_stage = Some(v);
    }
    if let Some(v) = read(ENV_TIMEOUT_MS) {
        match parse_u64_range(&v, 100, 600_000) {
            Some(ms) => settings.delivery.timeout_ms = ms,
            None => warn!(key = ENV_TIMEOUT_MS, value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_STORE_PATH) {
        settings.store.db_path = v;
    }
    if let Some(v) = read(ENV_LOG_LEVEL) {
        settings.logging.level = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"delivery": {"timeoutMs": 15000, "enabled": true}});
        let source = serde_json::json!({"delivery": {"timeoutMs": 500}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["delivery"]["timeoutMs"], 500);
        assert_eq!(merged["delivery"]["enabled"], true);
    }

    #[test]
    fn merge_array_replaces() {
        let target = serde_json::json!({"stages": ["a", "b"]});
        let source = serde_json::json!({"stages": ["c"]});
        assert_eq!(deep_merge(target, source)["stages"], serde_json::json!(["c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null, "c": 3});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["c"], 3);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.delivery.timeout_ms, 15_000);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"delivery": {"apiKey": "file-key", "enabledReleaseStages": ["production"]},
                "app": {"version": "3.0.0", "type": "android"}}"#,
        )
        .unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.delivery.api_key.as_deref(), Some("file-key"));
        assert_eq!(
            settings.delivery.enabled_release_stages,
            Some(vec!["production".to_string()])
        );
        assert_eq!(settings.app.version.as_deref(), Some("3.0.0"));
        assert_eq!(settings.app.app_type.as_deref(), Some("android"));
        assert_eq!(settings.delivery.queue_name, "courier-delivery");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"delivery": {"queueName": " "}}"#).unwrap();
        let settings = load_file(&path).unwrap();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_win_over_file_values() {
        let mut settings = CourierSettings::default();
        settings.delivery.api_key = Some("file-key".into());
        apply_overrides(
            &mut settings,
            env(&[
                (ENV_API_KEY, "env-key"),
                (ENV_ENDPOINT, "https://collector.test"),
                (ENV_ENABLED, "off"),
                (ENV_RELEASE_STAGE, "staging"),
                (ENV_TIMEOUT_MS, "2500"),
                (ENV_STORE_PATH, "/var/lib/courier.db"),
                (ENV_LOG_LEVEL, "debug"),
            ]),
        );
        assert_eq!(settings.delivery.api_key.as_deref(), Some("env-key"));
        assert_eq!(settings.delivery.endpoint, "https://collector.test");
        assert!(!settings.delivery.enabled);
        assert_eq!(settings.delivery.release_stage.as_deref(), Some("staging"));
        assert_eq!(settings.delivery.timeout_ms, 2_500);
        assert_eq!(settings.store.db_path, "/var/lib/courier.db");
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_and_empty_overrides_are_ignored() {
        let mut settings = CourierSettings::default();
        apply_overrides(
            &mut settings,
            env(&[(ENV_ENABLED, "maybe"), (ENV_TIMEOUT_MS, "5"), (ENV_API_KEY, "")]),
        );
        assert!(settings.delivery.enabled);
        assert_eq!(settings.delivery.timeout_ms, 15_000);
        assert!(settings.delivery.api_key.is_none());
    }

    #[test]
    fn invalid_env_values_are_reported() {
        let captured = std::sync::Arc::new(parking_lot::Mutex::new(Vec::<u8>::new()));
        let writer = {
            let captured = captured.clone();
            move || CaptureWriter(captured.clone())
        };
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();

        let mut settings = CourierSettings::default();
        tracing::subscriber::with_default(subscriber, || {
            apply_overrides(
                &mut settings,
                env(&[(ENV_ENABLED, "maybe"), (ENV_TIMEOUT_MS, "5")]),
            );
        });

        let output = String::from_utf8(captured.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("key=\"COURIER_ENABLED\""), "{output}");
        assert!(output.contains("key=\"COURIER_TIMEOUT_MS\""), "{output}");
        assert_eq!(settings.delivery.timeout_ms, 15_000);
    }

    struct CaptureWriter(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("100", 100, 600_000), Some(100));
        assert_eq!(parse_u64_range("99", 100, 600_000), None);
        assert_eq!(parse_u64_range("600001", 100, 600_000), None);
        assert_eq!(parse_u64_range("abc", 100, 600_000), None);
    }
}
