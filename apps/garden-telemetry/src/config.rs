use crate::mqtt::RetryPolicy;
use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn setup_config_path() -> Option<PathBuf> {
    env::var("GARDEN_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    default_site_id: Option<String>,
    #[serde(default)]
    sample_every: Option<u32>,
    #[serde(default)]
    http_bind: Option<String>,
    #[serde(default)]
    enable_mqtt: Option<bool>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "garden-telemetry failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "garden-telemetry failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Setup-file values only fill in settings whose env var is unset.
fn apply_setup_overrides<F>(config: &mut Config, overrides: &SetupConfigOverrides, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env_allows = |key: &str| non_empty(lookup(key).as_deref()).is_none();

    if env_allows("GARDEN_DATABASE_URL") && env_allows("DATABASE_URL") {
        if let Some(url) = non_empty(overrides.database_url.as_deref()) {
            config.database_url = Some(normalize_database_url(url));
        }
    }
    if env_allows("GARDEN_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("GARDEN_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("GARDEN_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("GARDEN_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("GARDEN_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = non_empty(overrides.mqtt_topic_prefix.as_deref()) {
            if env_allows("GARDEN_MQTT_TOPICS") {
                config.mqtt_topics = default_topics(&prefix);
            }
            config.mqtt_topic_prefix = prefix;
        }
    }
    if env_allows("GARDEN_DEFAULT_SITE_ID") {
        if let Some(site_id) = overrides.default_site_id.as_deref() {
            config.default_site_id = non_empty(Some(site_id));
        }
    }
    if env_allows("GARDEN_SAMPLE_EVERY") {
        if let Some(value) = overrides.sample_every {
            config.sample_every = value;
        }
    }
    if env_allows("GARDEN_HTTP_BIND") {
        if let Some(bind) = non_empty(overrides.http_bind.as_deref()) {
            config.http_bind = bind;
        }
    }
    if env_allows("GARDEN_ENABLE_MQTT") {
        if let Some(value) = overrides.enable_mqtt {
            config.enable_mqtt = value;
        }
    }
}

fn default_topics(prefix: &str) -> Vec<String> {
    vec![format!("{prefix}/sensor"), format!("{prefix}/sensor/#")]
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw == "1" || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub enable_mqtt: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_topics: Vec<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_prefix: String,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub retry_cooldown_secs: u64,
    pub shutdown_timeout_ms: u64,
    pub default_site_id: Option<String>,
    pub sample_every: u32,
    pub history_memory_limit: usize,
    pub ingest_queue: usize,
    pub subscriber_buffer: usize,
    pub notify_window_secs: u64,
    pub notify_sweep_secs: u64,
    pub http_bind: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub persist_queue: usize,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let lookup = |key: &str| env::var(key).ok();
        let mut config = Self::from_lookup(lookup);
        if let Some(overrides) = setup_config_path()
            .as_deref()
            .and_then(load_setup_config_overrides)
        {
            apply_setup_overrides(&mut config, &overrides, lookup);
        }
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from any key source; unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key).as_deref());
        fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.parse::<T>().ok())
        }

        let database_url = get("GARDEN_DATABASE_URL")
            .or_else(|| get("DATABASE_URL"))
            .map(normalize_database_url);
        let mqtt_topic_prefix = get("GARDEN_MQTT_TOPIC_PREFIX")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "nutricomm".to_string());
        let mqtt_topics = get("GARDEN_MQTT_TOPICS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|topics| !topics.is_empty())
            .unwrap_or_else(|| default_topics(&mqtt_topic_prefix));
        let default_site_id = match lookup("GARDEN_DEFAULT_SITE_ID") {
            // Set but empty disables the substitution.
            Some(raw) => non_empty(Some(raw.as_str())),
            None => Some("KBG001".to_string()),
        };
        let batch_size = parsed::<usize>(get("GARDEN_BATCH_SIZE"))
            .filter(|v| *v != 0)
            .unwrap_or(200);

        Self {
            database_url,
            db_pool_size: parsed(get("GARDEN_DB_POOL_SIZE")).unwrap_or(5),
            enable_mqtt: get("GARDEN_ENABLE_MQTT")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            mqtt_host: get("GARDEN_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: parsed(get("GARDEN_MQTT_PORT")).unwrap_or(1883),
            mqtt_username: get("GARDEN_MQTT_USERNAME"),
            mqtt_password: get("GARDEN_MQTT_PASSWORD"),
            mqtt_topic_prefix,
            mqtt_topics,
            mqtt_keepalive_secs: parsed(get("GARDEN_MQTT_KEEPALIVE_SECS")).unwrap_or(60),
            mqtt_client_prefix: get("GARDEN_MQTT_CLIENT_PREFIX")
                .unwrap_or_else(|| "nutricomm-backend".to_string()),
            retry_delay_secs: parsed(get("GARDEN_MQTT_RETRY_DELAY_SECS")).unwrap_or(3),
            max_retries: parsed(get("GARDEN_MQTT_MAX_RETRIES")).unwrap_or(3),
            retry_cooldown_secs: parsed(get("GARDEN_MQTT_RETRY_COOLDOWN_SECS")).unwrap_or(30),
            shutdown_timeout_ms: parsed(get("GARDEN_SHUTDOWN_TIMEOUT_MS")).unwrap_or(2000),
            default_site_id,
            sample_every: parsed(get("GARDEN_SAMPLE_EVERY")).unwrap_or(120),
            history_memory_limit: parsed(get("GARDEN_HISTORY_MEMORY_LIMIT")).unwrap_or(5000),
            ingest_queue: parsed(get("GARDEN_INGEST_QUEUE")).unwrap_or(1024),
            subscriber_buffer: parsed(get("GARDEN_SUBSCRIBER_BUFFER")).unwrap_or(64),
            notify_window_secs: parsed(get("GARDEN_NOTIFY_WINDOW_SECS")).unwrap_or(3600),
            notify_sweep_secs: parsed(get("GARDEN_NOTIFY_SWEEP_SECS")).unwrap_or(300),
            http_bind: get("GARDEN_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            batch_size,
            flush_interval_ms: parsed(get("GARDEN_FLUSH_INTERVAL_MS")).unwrap_or(1000),
            persist_queue: parsed(get("GARDEN_PERSIST_QUEUE"))
                .unwrap_or_else(|| batch_size.saturating_mul(10)),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.enable_mqtt && self.mqtt_topics.is_empty() {
            bail!("GARDEN_MQTT_TOPICS resolved to no topic filters");
        }
        if self.ingest_queue == 0 || self.subscriber_buffer == 0 {
            bail!("GARDEN_INGEST_QUEUE and GARDEN_SUBSCRIBER_BUFFER must be positive");
        }
        self.http_addr()?;
        Ok(())
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http_bind.parse().with_context(|| {
            format!("GARDEN_HTTP_BIND is not a socket address: {}", self.http_bind)
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs.max(5))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn notify_window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.notify_window_secs.min(u32::MAX as u64) as i64)
    }

    pub fn notify_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.notify_sweep_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(self.retry_delay_secs),
            max_attempts: self.max_retries,
            cooldown: Duration::from_secs(self.retry_cooldown_secs),
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
