//! Server configuration.

use crate::mqtt::BrokerAddr;
use anyhow::{bail, Context, Result};
use pointgraph_core::HashMode;
use pointgraph_proto::SubjectScheme;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Persistence engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// SQLite database file
    Sqlite,
    /// Volatile in-memory store
    Memory,
}

impl FromStr for StoreType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store type {other:?}, expected sqlite or memory"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Persistence engine
    pub store_type: StoreType,

    /// Database path (for SQLite)
    pub db_path: PathBuf,

    /// MQTT broker URL
    pub mqtt_broker: String,

    /// MQTT client identifier
    pub client_id: String,

    /// Optional namespace prepended to every subject
    pub subject_prefix: Option<String>,

    /// Number of handler workers
    pub workers: usize,

    /// Timeout for request/reply calls
    pub request_timeout: Duration,

    /// Period of the read-only verify task, `None` to disable
    pub verify_interval: Option<Duration>,

    /// Period of the handler metrics task, `None` to disable
    pub metrics_interval: Option<Duration>,

    /// Edge hash mode
    pub hash_mode: HashMode,

    /// Reply to `auth.getTransportURI`
    pub transport_uri: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mqtt_broker = "tcp://localhost:1883".to_string();
        Self {
            store_type: StoreType::Sqlite,
            db_path: PathBuf::from("./pointgraph.db"),
            transport_uri: mqtt_broker.clone(),
            mqtt_broker,
            client_id: format!("pointgraph-{}", Uuid::new_v4().simple()),
            subject_prefix: None,
            workers: 4,
            request_timeout: Duration::from_millis(1000),
            verify_interval: None,
            metrics_interval: Some(Duration::from_secs(60)),
            hash_mode: HashMode::Timestamps,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `POINTGRAPH_STORE_TYPE`: "sqlite" or "memory"
    /// - `POINTGRAPH_DB_PATH`: SQLite database path
    /// - `POINTGRAPH_MQTT_BROKER`: MQTT broker URL
    /// - `POINTGRAPH_CLIENT_ID`: MQTT client identifier
    /// - `POINTGRAPH_SUBJECT_PREFIX`: subject namespace
    /// - `POINTGRAPH_WORKERS`: handler worker count
    /// - `POINTGRAPH_REQUEST_TIMEOUT_MS`: request/reply timeout
    /// - `POINTGRAPH_VERIFY_INTERVAL_SECS`: periodic verify, 0 disables
    /// - `POINTGRAPH_METRICS_INTERVAL_SECS`: periodic metrics, 0 disables
    /// - `POINTGRAPH_HASH_MODE`: "timestamps" or "values"
    /// - `POINTGRAPH_TRANSPORT_URI`: URI handed out to clients
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(store_type) = var("POINTGRAPH_STORE_TYPE") {
            config.store_type = store_type
                .parse()
                .context("Invalid POINTGRAPH_STORE_TYPE")?;
        }

        if let Some(db_path) = var("POINTGRAPH_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        let transport_uri = var("POINTGRAPH_TRANSPORT_URI");
        if let Some(mqtt) = var("POINTGRAPH_MQTT_BROKER") {
            mqtt.parse::<BrokerAddr>()
                .context("Invalid POINTGRAPH_MQTT_BROKER")?;
            config.transport_uri.clone_from(&mqtt);
            config.mqtt_broker = mqtt;
        }
        if let Some(uri) = transport_uri {
            config.transport_uri = uri;
        }

        if let Some(client_id) = var("POINTGRAPH_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Some(prefix) = var("POINTGRAPH_SUBJECT_PREFIX").filter(|p| !p.is_empty()) {
            config.subject_prefix = Some(prefix);
        }

        if let Some(workers) = var("POINTGRAPH_WORKERS") {
            config.workers = workers.parse().context("Invalid POINTGRAPH_WORKERS")?;
            if config.workers == 0 {
                bail!("POINTGRAPH_WORKERS must be at least 1");
            }
        }

        if let Some(ms) = var("POINTGRAPH_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("Invalid POINTGRAPH_REQUEST_TIMEOUT_MS")?;
            config.request_timeout = Duration::from_millis(ms);
        }

        if let Some(secs) = var("POINTGRAPH_VERIFY_INTERVAL_SECS") {
            config.verify_interval =
                interval(&secs).context("Invalid POINTGRAPH_VERIFY_INTERVAL_SECS")?;
        }

        if let Some(secs) = var("POINTGRAPH_METRICS_INTERVAL_SECS") {
            config.metrics_interval =
                interval(&secs).context("Invalid POINTGRAPH_METRICS_INTERVAL_SECS")?;
        }

        if let Some(mode) = var("POINTGRAPH_HASH_MODE") {
            config.hash_mode = mode
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid POINTGRAPH_HASH_MODE")?;
        }

        Ok(config)
    }

    /// Subject scheme shared by the server and its clients.
    #[must_use]
    pub fn subject_scheme(&self) -> SubjectScheme {
        self.subject_prefix
            .as_ref()
            .map_or_else(SubjectScheme::default, |p| SubjectScheme::with_prefix(p.clone()))
    }
}

fn interval(secs: &str) -> Result<Option<Duration>> {
    let secs: u64 = secs.parse()?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
