use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use fabric_common::Row;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Stable id across restarts; a random one is generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
    pub worker_host: String,
    pub worker_port: u16,
    /// Address handed to the supervisor. Defaults to `worker_host:worker_port`.
    #[serde(default)]
    pub advertise_address: Option<String>,
    pub supervisor_address: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
    /// Rows served per partition key.
    #[serde(default)]
    pub dataset: HashMap<String, Vec<Row>>,
}

fn default_capacity() -> u32 {
    4
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_registration_timeout_secs() -> u64 {
    60
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("FABRIC_WORKER_CONFIG")
            .unwrap_or_else(|_| "crates/worker/config/default.toml".to_string());
        Self::from_file(&config_file_path)
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("FABRIC_WORKER").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Settings for a worker listening on `port` with no dataset.
    pub fn local(port: u16, supervisor_address: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            worker_host: "127.0.0.1".to_string(),
            worker_port: port,
            advertise_address: None,
            supervisor_address: supervisor_address.into(),
            capacity: default_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            registration_timeout_secs: default_registration_timeout_secs(),
            dataset: HashMap::new(),
        }
    }

    pub fn worker_server_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.worker_host, self.worker_port).parse()
    }

    pub fn advertised_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.worker_host, self.worker_port))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}
