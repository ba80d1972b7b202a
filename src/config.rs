//! Configuration loader: merges an optional TOML file with environment
//! variables (a `.env` file is honoured) and validates the result.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fetch::MET_USER_AGENT;
use crate::models::{Location, LocationList};
use crate::notify::NotificationConfig;

/// Where observations come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    /// MET Locationforecast, looking ahead from now.
    #[default]
    Forecast,
    /// Frost station observations, looking back from now.
    Frost,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub locations_file: PathBuf,
    pub update_interval_secs: u64,
    pub horizon_hours: u32,
    pub use_cache: bool,
    pub output_dir: Option<PathBuf>,
    pub met_user_agent: String,
    pub source: ObservationSource,
    pub frost_client_id: Option<String>,
    pub notification: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("frcm_cache.db"),
            locations_file: PathBuf::from("locations.json"),
            update_interval_secs: 60,
            horizon_hours: 48,
            use_cache: true,
            output_dir: None,
            met_user_agent: MET_USER_AGENT.to_string(),
            source: ObservationSource::Forecast,
            frost_client_id: None,
            notification: NotificationConfig::default(),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    lowered != "0" && lowered != "false" && lowered != "no" && lowered != "off"
}

fn parse_number<T: std::str::FromStr>(raw: &str, env_name: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{env_name} must be a non-negative integer")))
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Applies `FRCM_*` overrides from `lookup` onto `config`.
pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).and_then(non_empty);

    if let Some(v) = var("FRCM_DATABASE_PATH") {
        config.database_path = PathBuf::from(v);
    }
    if let Some(v) = var("FRCM_LOCATIONS_FILE") {
        config.locations_file = PathBuf::from(v);
    }
    if let Some(v) = var("FRCM_WORKER_UPDATE_INTERVAL") {
        config.update_interval_secs = parse_number(&v, "FRCM_WORKER_UPDATE_INTERVAL")?;
    }
    if let Some(v) = var("FRCM_WORKER_FORECAST_HOURS") {
        config.horizon_hours = parse_number(&v, "FRCM_WORKER_FORECAST_HOURS")?;
    }
    if let Some(v) = var("FRCM_WORKER_OUTPUT_DIR") {
        config.output_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = var("FRCM_USE_CACHE") {
        config.use_cache = parse_bool(&v);
    }
    if let Some(v) = var("FRCM_MET_USER_AGENT") {
        config.met_user_agent = v;
    }
    if let Some(v) = var("FRCM_WORKER_SOURCE") {
        config.source = match v.to_ascii_lowercase().as_str() {
            "forecast" => ObservationSource::Forecast,
            "frost" => ObservationSource::Frost,
            other => {
                return Err(Error::Config(format!(
                    "FRCM_WORKER_SOURCE must be forecast or frost, got {other}"
                )))
            }
        };
    }
    if let Some(v) = var("FRCM_FROST_CLIENT_ID") {
        config.frost_client_id = Some(v);
    }

    let notification = &mut config.notification;
    if let Some(v) = var("FRCM_MQTT_ENABLED") {
        notification.enabled = parse_bool(&v);
    }
    if let Some(v) = var("FRCM_MQTT_HOST") {
        notification.broker_host = v;
    }
    if let Some(v) = var("FRCM_MQTT_PORT") {
        notification.broker_port = parse_number(&v, "FRCM_MQTT_PORT")?;
    }
    if let Some(v) = var("FRCM_MQTT_TOPIC") {
        notification.topic = v;
    }
    if let Some(v) = var("FRCM_MQTT_USERNAME") {
        notification.username = Some(v);
    }
    if let Some(v) = var("FRCM_MQTT_PASSWORD") {
        notification.password = Some(v);
    }
    if let Some(v) = var("FRCM_MQTT_CLIENT_ID") {
        notification.client_id = v;
    }

    Ok(())
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    let mut issues: Vec<String> = Vec::new();

    if config.update_interval_secs == 0 {
        issues.push("update_interval_secs must be > 0".into());
    }
    if config.horizon_hours == 0 {
        issues.push("horizon_hours must be > 0".into());
    }
    if config.met_user_agent.trim().is_empty() {
        issues.push("met_user_agent must not be empty".into());
    }
    if config.source == ObservationSource::Frost
        && config.frost_client_id.as_deref().map_or(true, |id| id.trim().is_empty())
    {
        issues.push("frost_client_id is required when source = \"frost\"".into());
    }

    let notification = &config.notification;
    if notification.enabled {
        if notification.broker_host.trim().is_empty() {
            issues.push("notification.broker_host must not be empty".into());
        }
        if notification.broker_port == 0 {
            issues.push("notification.broker_port must be > 0".into());
        }
        if notification.topic.trim().is_empty() {
            issues.push("notification.topic must not be empty".into());
        }
        if notification.client_id.trim().is_empty() {
            issues.push("notification.client_id must not be empty".into());
        }
        if notification.username.is_some() != notification.password.is_some() {
            issues.push("notification.username and notification.password go together".into());
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(issues.join("; ")))
    }
}

/// Loads `path` if it exists (defaults otherwise), then environment
/// overrides, then validates.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let _ = dotenvy::dotenv();

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
    } else {
        AppConfig::default()
    };

    apply_env(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_locations(path: &Path) -> Result<Vec<Location>> {
    let raw = std::fs::read_to_string(path)?;
    let list: LocationList = serde_json::from_str(&raw)?;

    if list.locations.is_empty() {
        return Err(Error::Config(format!(
            "{} must list at least one location",
            path.display()
        )));
    }
    Ok(list.locations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert_eq!(config.update_interval_secs, 60);
        assert_eq!(config.horizon_hours, 48);
        assert!(config.use_cache);
        validate_config(&config).unwrap();
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            database_path = "/var/lib/frcm/cache.db"
            update_interval_secs = 300

            [notification]
            enabled = true
            broker_host = "mqtt.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/frcm/cache.db"));
        assert_eq!(config.update_interval_secs, 300);
        assert_eq!(config.horizon_hours, 48);
        assert!(config.notification.enabled);
        assert_eq!(config.notification.broker_port, 1883);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("FRCM_WORKER_UPDATE_INTERVAL", "120"),
                ("FRCM_WORKER_FORECAST_HOURS", "24"),
                ("FRCM_USE_CACHE", "off"),
                ("FRCM_MQTT_ENABLED", "true"),
                ("FRCM_MQTT_PORT", "8883"),
                ("FRCM_WORKER_OUTPUT_DIR", "  "),
            ]),
        )
        .unwrap();

        assert_eq!(config.update_interval_secs, 120);
        assert_eq!(config.horizon_hours, 24);
        assert!(!config.use_cache);
        assert!(config.notification.enabled);
        assert_eq!(config.notification.broker_port, 8883);
        assert_eq!(config.output_dir, None);
    }

    #[test]
    fn frost_source_needs_client_id() {
        let mut config: AppConfig = toml::from_str(r#"source = "frost""#).unwrap();
        assert_eq!(config.source, ObservationSource::Frost);
        let Err(Error::Config(msg)) = validate_config(&config) else {
            panic!("expected config error");
        };
        assert!(msg.contains("frost_client_id"));

        apply_env(&mut config, env(&[("FRCM_FROST_CLIENT_ID", "abc-123")])).unwrap();
        validate_config(&config).unwrap();

        apply_env(&mut config, env(&[("FRCM_WORKER_SOURCE", "Forecast")])).unwrap();
        assert_eq!(config.source, ObservationSource::Forecast);
        assert!(apply_env(&mut config, env(&[("FRCM_WORKER_SOURCE", "radar")])).is_err());
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        let mut config = AppConfig::default();
        let err = apply_env(&mut config, env(&[("FRCM_MQTT_PORT", "-1")])).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("FRCM_MQTT_PORT")));
    }

    #[test]
    fn validation_collects_every_issue() {
        let mut config = AppConfig::default();
        config.update_interval_secs = 0;
        config.notification.enabled = true;
        config.notification.topic = String::new();
        config.notification.username = Some("user".into());

        let Err(Error::Config(msg)) = validate_config(&config) else {
            panic!("expected config error");
        };
        assert!(msg.contains("update_interval_secs"));
        assert!(msg.contains("notification.topic"));
        assert!(msg.contains("username and notification.password"));
    }

    #[test]
    fn locations_file_must_not_be_empty() {
        let path = std::env::temp_dir().join(format!("frcm-locations-{}.json", uuid::Uuid::new_v4()));

        std::fs::write(&path, r#"{"locations": []}"#).unwrap();
        assert!(matches!(load_locations(&path), Err(Error::Config(_))));

        std::fs::write(
            &path,
            r#"{"locations": [
                {"name": "Bergen", "latitude": 60.3913, "longitude": 5.3221, "altitude": 12},
                {"name": "Oslo", "latitude": 59.9139, "longitude": 10.7522}
            ]}"#,
        )
        .unwrap();
        let locations = load_locations(&path).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[1].altitude, 0);
        std::fs::remove_file(path).unwrap();
    }
}
