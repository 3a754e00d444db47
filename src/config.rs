use crate::pipeline::RetryPolicy;
use crate::store::StoreOptions;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub segment_roll_duration: Duration,
    pub segment_roll_bytes: u64,
    pub sync_interval: Duration,

    pub http_bind: String,

    pub enable_mqtt_listener: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,

    pub ingest_workers: usize,
    pub max_queue: usize,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,

    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let data_dir = PathBuf::from(env_string("WEATHER_DATA_DIR", Some("./data".to_string()))?);
        let segment_roll_duration =
            Duration::from_secs(env_u64("WEATHER_SEGMENT_ROLL_SECONDS", Some(24 * 3600))?);
        let segment_roll_bytes = env_u64("WEATHER_SEGMENT_ROLL_BYTES", Some(128 * 1024 * 1024))?;
        let sync_interval =
            Duration::from_millis(env_u64("WEATHER_SYNC_INTERVAL_MS", Some(1000))?);

        let http_bind = env_string("WEATHER_HTTP_BIND", Some("127.0.0.1:9180".to_string()))?;

        let enable_mqtt_listener = env_optional("WEATHER_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mqtt_url = env_string("WEATHER_MQTT_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let url = Url::parse(&mqtt_url).context("invalid WEATHER_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("WEATHER_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("WEATHER_MQTT_USERNAME");
        let mqtt_password = env_optional("WEATHER_MQTT_PASSWORD");
        let mqtt_topic_prefix =
            env_string("WEATHER_MQTT_TOPIC_PREFIX", Some("sensors".to_string()))?;
        let mqtt_client_id = env_string(
            "WEATHER_MQTT_CLIENT_ID",
            Some(format!("weather-ingest-{}", std::process::id())),
        )?;
        let mqtt_keepalive_secs = env_u64("WEATHER_MQTT_KEEPALIVE_SECS", Some(30))?;

        let ingest_workers = env_u64("WEATHER_INGEST_WORKERS", Some(4))? as usize;
        let max_queue = env_u64("WEATHER_MAX_QUEUE", Some(1024))? as usize;
        let retry_attempts = env_u64("WEATHER_RETRY_ATTEMPTS", Some(5))? as u32;
        let retry_initial_ms = env_u64("WEATHER_RETRY_INITIAL_MS", Some(200))?;
        let retry_max_ms = env_u64("WEATHER_RETRY_MAX_MS", Some(10_000))?;

        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            data_dir,
            segment_roll_duration,
            segment_roll_bytes,
            sync_interval,
            http_bind,
            enable_mqtt_listener,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            mqtt_keepalive_secs,
            ingest_workers: ingest_workers.max(1),
            max_queue: max_queue.max(1),
            retry_attempts,
            retry_initial_ms,
            retry_max_ms,
            otlp_endpoint,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            data_dir: self.data_dir.clone(),
            segment_roll_duration: self.segment_roll_duration,
            segment_roll_bytes: self.segment_roll_bytes,
            sync_interval: self.sync_interval,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_ms),
            max_backoff: Duration::from_millis(self.retry_max_ms),
        }
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
