//! Configuration for the repository worker pool.
//!
//! A tree of `Default`-able, serde structs loaded from an optional TOML
//! file and overlaid on the compiled-in defaults below, then validated once
//! at startup (see [`Config::validate`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum per-message payload the bus must advertise; startup is fatal
/// below this.
pub const MIN_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Per-job deadline applied to every worker transaction.
pub const JOB_TIMEOUT_SECS: u64 = 120;

/// Depth of the shared inbound command channel.
pub const CMD_CHAN_DEPTH: usize = 5;

/// Queue group used for bus-side load balancing across workers.
pub const WORKER_QUEUE_GROUP: &str = "workerqueue";

/// Subject workers queue-subscribe to for inbound commands.
pub const COMMAND_SUBJECT: &str = "repo.Hosts.commands.*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bus: BusConfig,
    pub repo_root: PathBuf,
    pub workers: WorkerPoolConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// NATS server URL, e.g. `nats://127.0.0.1:4222`.
    pub url: String,
    /// Path to a NATS credentials file; omitted means anonymous connect.
    pub credentials_path: Option<PathBuf>,
    /// Smallest acceptable `max_payload` advertised by the server.
    pub min_max_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub count: usize,
    /// Depth of the shared inbound command channel.
    pub queue_depth: usize,
    /// Per-job timeout, in seconds.
    pub job_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or `"debug"`.
    pub level: String,
    /// Emit structured JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig {
                url: "nats://127.0.0.1:4222".to_string(),
                credentials_path: None,
                min_max_payload: MIN_MAX_PAYLOAD,
            },
            repo_root: PathBuf::from("repo"),
            workers: WorkerPoolConfig {
                count: 8,
                queue_depth: CMD_CHAN_DEPTH,
                job_timeout_secs: JOB_TIMEOUT_SECS,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl Config {
    /// Load configuration from a complete TOML file. Partial overrides
    /// aren't supported by plain `toml::from_str`; callers that only want
    /// to change a few fields should start from [`Config::default`] and
    /// edit the struct directly instead of writing a partial file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants. Startup errors here are fatal: the
    /// process should refuse to serve with a config it can't trust.
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(Error::Config("workers.count must be > 0".into()));
        }
        if self.workers.queue_depth == 0 {
            return Err(Error::Config("workers.queue_depth must be > 0".into()));
        }
        if self.workers.job_timeout_secs == 0 {
            return Err(Error::Config("workers.job_timeout_secs must be > 0".into()));
        }
        if self.bus.min_max_payload < MIN_MAX_PAYLOAD {
            return Err(Error::Config(format!(
                "bus.min_max_payload must be >= {MIN_MAX_PAYLOAD}"
            )));
        }
        Ok(())
    }
}
