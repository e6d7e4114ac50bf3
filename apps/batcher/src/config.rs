use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "configs/config.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub destination: DestinationConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Wall-clock bound on the whole run; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { timeout_secs: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub num_workers: usize,
    pub capacity: usize,
    pub dedup_ttl_secs: u64,
    pub dedup_sweep_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            capacity: 10,
            dedup_ttl_secs: 300,
            dedup_sweep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub buffer: Option<BufferConfig>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_offset_secs")]
    pub offset_secs: u64,
    /// Epoch anchor, supplied via BUFFER_START_TIME. Required for the event
    /// destination so windows align across restarts.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validator: Option<ValidatorConfig>,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_offset_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: PathBuf,
    #[serde(default)]
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub creds_path: PathBuf,
    #[serde(default = "default_db_pool_size")]
    pub pool_size: u32,
}

fn default_db_pool_size() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub partition: Option<u32>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Config {
    /// Reads `${CONFIG_PATH:-configs/config.json}`, applies environment
    /// overrides on top, and validates the result.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        let path = env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut bytes = contents.into_bytes();
        simd_json::serde::from_slice(&mut bytes)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(host) = env_string("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env_parse::<u16>("MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(username) = env_string("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_string("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(qos) = env_parse::<u8>("MQTT_QOS")? {
            self.mqtt.qos = qos;
        }
        if let Some(topic) = env_string("MQTT_TOPIC") {
            self.mqtt.topic = Some(topic);
        }
        if let Some(partition) = env_parse::<u32>("MQTT_PARTITION")? {
            self.mqtt.partition = Some(partition);
        }

        if let Some(workers) = env_parse::<usize>("POOL_NUM_WORKERS")? {
            self.pool.num_workers = workers;
        }
        if let Some(capacity) = env_parse::<usize>("POOL_CAPACITY")? {
            self.pool.capacity = capacity;
        }

        if let Some(kind) = env_string("DESTINATION_TYPE") {
            self.destination.kind = kind;
        }
        if let Some(path) = env_string("DESTINATION_PATH") {
            self.destination.path = Some(PathBuf::from(path));
        }
        if let Some(timeout) = env_parse::<u64>("BATCHER_TIMEOUT_SECS")? {
            self.batcher.timeout_secs = timeout;
        }

        if let Some(raw) = env_string("BUFFER_START_TIME") {
            let start_time = DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .with_context(|| format!("BUFFER_START_TIME {raw:?} is not RFC 3339"))?;
            if let Some(buffer) = self.destination.buffer.as_mut() {
                buffer.start_time = Some(start_time);
            }
        }

        if let Some(level) = env_string("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(format) = env_string("LOG_FORMAT") {
            self.log.format = format;
        }
        if let Some(output) = env_string("LOG_OUTPUT") {
            self.log.output = output;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.num_workers < 1 {
            bail!("pool.num_workers must be at least 1");
        }
        if self.mqtt.port == 0 {
            bail!("mqtt.port must be between 1 and 65535");
        }
        if self.mqtt.qos > 2 {
            bail!("mqtt.qos must be between 0 and 2");
        }
        if !matches!(self.log.format.as_str(), "text" | "json") {
            bail!("log.format must be text or json");
        }

        match self.destination.kind.as_str() {
            "event" | "file" | "stdout" => {
                let buffer = self
                    .destination
                    .buffer
                    .as_ref()
                    .with_context(|| {
                        format!(
                            "destination.buffer is required for type {}",
                            self.destination.kind
                        )
                    })?;
                if buffer.interval_secs == 0 {
                    bail!("destination.buffer.interval_secs must be positive");
                }
                if buffer.offset_secs >= buffer.interval_secs {
                    bail!("destination.buffer.offset_secs must be smaller than interval_secs");
                }
                let validator = buffer
                    .validator
                    .as_ref()
                    .context("destination.buffer.validator is required for buffered destinations")?;
                if validator.port == 0 {
                    bail!("destination.buffer.validator.port must be between 1 and 65535");
                }
                if let Some(tls) = validator.tls_config.as_ref().filter(|tls| tls.enabled) {
                    if tls.cert_path.as_os_str().is_empty() {
                        bail!("validator tls cert_path is required when tls is enabled");
                    }
                    if tls.key_path.as_os_str().is_empty() {
                        bail!("validator tls key_path is required when tls is enabled");
                    }
                }
                if self.destination.kind == "event" && buffer.start_time.is_none() {
                    bail!("BUFFER_START_TIME is required for the event destination");
                }
                if self.destination.kind == "file" && self.destination.path.is_none() {
                    bail!("destination.path is required for the file destination");
                }
            }
            "stream" => {}
            other => bail!("invalid destination type: {other}"),
        }

        if matches!(self.destination.kind.as_str(), "event" | "stream") {
            let database = self
                .destination
                .database
                .as_ref()
                .context("destination.database is required for event and stream destinations")?;
            if database.project_id.trim().is_empty() {
                bail!("destination.database.project_id must not be empty");
            }
            if database.dataset_id.is_empty()
                || !database
                    .dataset_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                bail!("destination.database.dataset_id must be alphanumeric or underscore");
            }
        }

        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has invalid value {raw:?}")),
    }
}
