use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a container turns suspect.
    #[serde(default = "default_suspect_after_missed")]
    pub suspect_after_missed: u32,
    /// Consecutive missed heartbeats before a container is evicted.
    #[serde(default = "default_dead_after_missed")]
    pub dead_after_missed: u32,
    /// Reassignments allowed per particle after its first attempt.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_particle_timeout_ms")]
    pub particle_timeout_ms: u64,
    #[serde(default = "default_global_inflight_limit")]
    pub global_inflight_limit: usize,
    #[serde(default = "default_min_worker_capacity")]
    pub min_worker_capacity: u32,
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_suspect_after_missed() -> u32 {
    1
}

fn default_dead_after_missed() -> u32 {
    3
}

fn default_retry_limit() -> u32 {
    3
}

fn default_particle_timeout_ms() -> u64 {
    30_000
}

fn default_global_inflight_limit() -> usize {
    256
}

fn default_min_worker_capacity() -> u32 {
    1
}

fn default_deadline_ms() -> u64 {
    60_000
}

fn default_result_retention_secs() -> u64 {
    300
}

fn default_prune_interval_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50051,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            suspect_after_missed: default_suspect_after_missed(),
            dead_after_missed: default_dead_after_missed(),
            retry_limit: default_retry_limit(),
            particle_timeout_ms: default_particle_timeout_ms(),
            global_inflight_limit: default_global_inflight_limit(),
            min_worker_capacity: default_min_worker_capacity(),
            default_deadline_ms: default_deadline_ms(),
            result_retention_secs: default_result_retention_secs(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("FABRIC_SUPERVISOR_CONFIG")
            .unwrap_or_else(|_| "crates/coordinator/config/default.toml".to_string());
        Self::from_file(&config_file_path)
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("FABRIC_SUPERVISOR").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn server_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn particle_timeout(&self) -> Duration {
        Duration::from_millis(self.particle_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}
