use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub billing: BillingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    /// QoS for reading subscriptions and billing publications
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub homes: Vec<String>,
    #[serde(default = "default_device_categories")]
    pub device_categories: Vec<String>,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// How far in the future a reading timestamp may be before it is rejected
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u64,
    /// Nominal device sampling interval, used to integrate power when a
    /// reading carries no energy value
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Fixed offset used for the local day and TOU hour boundaries
    #[serde(default)]
    pub utc_offset_hours: i32,
}

fn default_device_categories() -> Vec<String> {
    [
        "base_load",
        "office",
        "hvac",
        "garden_pump",
        "ev_charger",
        "entertainment",
        "kitchen",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_tick_interval_secs() -> u64 {
    300
}

fn default_retention_hours() -> u64 {
    24
}

fn default_max_future_skew_secs() -> u64 {
    30
}

fn default_sample_interval_secs() -> u64 {
    5
}

impl BillingConfig {
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// One month of raw readings is the most the accumulator keeps in memory.
const MAX_RETENTION_HOURS: u64 = 24 * 31;
const MAX_INTERVAL_SECS: u64 = 3600;

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards DATABASE_URL and MQTT_HOST, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(
            !self.billing.homes.is_empty(),
            "config must include at least one home"
        );
        anyhow::ensure!(
            self.billing.homes.iter().all(|h| !h.is_empty() && !h.contains('/')),
            "home ids must be non-empty and must not contain '/'"
        );
        anyhow::ensure!(
            !self.billing.device_categories.is_empty(),
            "config must include at least one device category"
        );
        anyhow::ensure!(
            self.billing.tick_interval_secs > 0,
            "billing.tick_interval_secs must be greater than 0"
        );
        anyhow::ensure!(
            (24..=MAX_RETENTION_HOURS).contains(&self.billing.retention_hours),
            "billing.retention_hours must be within 24..={MAX_RETENTION_HOURS}"
        );
        anyhow::ensure!(
            self.billing.max_future_skew_secs <= MAX_INTERVAL_SECS,
            "billing.max_future_skew_secs must be at most {MAX_INTERVAL_SECS}"
        );
        anyhow::ensure!(
            (1..=MAX_INTERVAL_SECS).contains(&self.billing.sample_interval_secs),
            "billing.sample_interval_secs must be within 1..={MAX_INTERVAL_SECS}"
        );
        anyhow::ensure!(
            self.billing.utc_offset_hours.abs() <= 14 && self.billing.utc_offset().is_some(),
            "billing.utc_offset_hours must be within -14..=14"
        );
        anyhow::ensure!(
            self.persistence.workers > 0,
            "persistence.workers must be greater than 0"
        );
        anyhow::ensure!(
            self.persistence.queue_capacity > 0,
            "persistence.queue_capacity must be greater than 0"
        );
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{}'", close))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consumes the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
mqtt:
  host: "localhost"
  port: 1883

database:
  url: "postgres://localhost/billing"

billing:
  homes: ["home_001"]
"#;

    #[test]
    #[serial]
    fn test_defaults_applied() {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("MQTT_HOST");

        let cfg = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.billing.tick_interval_secs, 300);
        assert_eq!(cfg.billing.retention_hours, 24);
        assert_eq!(cfg.billing.sample_interval_secs, 5);
        assert_eq!(cfg.billing.device_categories.len(), 7);
        assert_eq!(cfg.api.port, 8080);
        assert_eq!(cfg.persistence.workers, 4);
        assert_eq!(cfg.mqtt.qos, 1);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("DATABASE_URL", "postgres://override/billing");
        std::env::set_var("MQTT_HOST", "broker.local");

        let cfg = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.database.url, "postgres://override/billing");
        assert_eq!(cfg.mqtt.host, "broker.local");

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("MQTT_HOST");
    }

    #[test]
    #[serial]
    fn test_placeholder_expansion() {
        std::env::set_var("BILLING_TEST_DB_PASSWORD", "s3cret");
        let out = expand_env_placeholders(
            "postgres://u:${BILLING_TEST_DB_PASSWORD}@db/$(BILLING_TEST_DB_PASSWORD) costs $$5",
        )
        .unwrap();
        assert_eq!(out, "postgres://u:s3cret@db/s3cret costs $5");
        std::env::remove_var("BILLING_TEST_DB_PASSWORD");

        assert!(expand_env_placeholders("${UNTERMINATED").is_err());
        assert!(expand_env_placeholders("${BILLING_TEST_SURELY_MISSING_VAR}").is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_empty_homes() {
        std::env::remove_var("DATABASE_URL");
        let raw = MINIMAL.replace(r#"["home_001"]"#, "[]");
        assert!(Config::from_yaml(&raw).is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_out_of_range_offset() {
        let raw = format!("{MINIMAL}  utc_offset_hours: 20\n");
        assert!(Config::from_yaml(&raw).is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_retention_shorter_than_a_day() {
        std::env::remove_var("DATABASE_URL");
        let raw = format!("{MINIMAL}  retention_hours: 12\n");
        assert!(Config::from_yaml(&raw).is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_out_of_range_durations() {
        std::env::remove_var("DATABASE_URL");
        for extra in [
            format!("  retention_hours: {}\n", u64::MAX),
            "  retention_hours: 745\n".to_string(),
            format!("  max_future_skew_secs: {}\n", u64::MAX),
            "  sample_interval_secs: 0\n".to_string(),
            "  sample_interval_secs: 86400\n".to_string(),
        ] {
            let raw = format!("{MINIMAL}{extra}");
            assert!(Config::from_yaml(&raw).is_err(), "{extra}");
        }
        let raw = format!("{MINIMAL}  retention_hours: 744\n");
        assert_eq!(Config::from_yaml(&raw).unwrap().billing.retention_hours, 744);
    }

    #[test]
    #[serial]
    fn test_example_config_loads() {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("MQTT_HOST");
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.example.yaml");
        let cfg = Config::load(path).unwrap();
        assert_eq!(cfg.billing.homes, vec!["home_001".to_string()]);
        assert_eq!(cfg.billing.utc_offset_hours, -7);
        assert_eq!(cfg.billing.tick_interval(), Duration::from_secs(300));
    }
}
