use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::async_runtime::RetryConfig;
use crate::error::{FedNsError, Result};
use crate::types::SubclusterId;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "FEDNS";

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Subcluster serving paths no mount point covers
    #[serde(default)]
    pub default_subcluster: Option<SubclusterId>,

    /// Whether the default subcluster is used at all
    #[serde(default = "default_true")]
    pub default_subcluster_enabled: bool,

    /// Subcluster colocated with this router
    #[serde(default)]
    pub local_subcluster: Option<SubclusterId>,

    /// Periodic refresh cadence in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Table age past which a failed refresh degrades the cache
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,

    /// Bound on the initial load in milliseconds
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Bound on a single metadata store fetch in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Virtual nodes per subcluster on the consistent hash ring
    #[serde(default = "default_hash_ring_virtual_nodes")]
    pub hash_ring_virtual_nodes: usize,

    /// Durable mount store location used by the router binary
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval_ms() -> u64 {
    10_000
}

fn default_max_staleness_ms() -> u64 {
    60_000
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_backoff_ms() -> u64 {
    100
}

fn default_retry_max_backoff_ms() -> u64 {
    5_000
}

fn default_hash_ring_virtual_nodes() -> usize {
    100
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/fedns/mounttable")
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_subcluster: None,
            default_subcluster_enabled: default_true(),
            local_subcluster: None,
            refresh_interval_ms: default_refresh_interval_ms(),
            max_staleness_ms: default_max_staleness_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            hash_ring_virtual_nodes: default_hash_ring_virtual_nodes(),
            store_path: default_store_path(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from an optional TOML file, overlaid by `FEDNS_*` environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_ms == 0 {
            return Err(FedNsError::Config("refresh_interval_ms must be greater than 0".into()));
        }
        if self.max_staleness_ms < self.refresh_interval_ms {
            return Err(FedNsError::Config(format!(
                "max_staleness_ms ({}) must not be shorter than refresh_interval_ms ({})",
                self.max_staleness_ms, self.refresh_interval_ms
            )));
        }
        if self.startup_timeout_ms == 0 || self.fetch_timeout_ms == 0 {
            return Err(FedNsError::Config("timeouts must be greater than 0".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(FedNsError::Config("retry_max_attempts must be at least 1".into()));
        }
        if self.hash_ring_virtual_nodes == 0 {
            return Err(FedNsError::Config("hash_ring_virtual_nodes must be at least 1".into()));
        }
        if let Some(ns) = &self.default_subcluster {
            if ns.trim().is_empty() {
                return Err(FedNsError::Config("default_subcluster must not be blank".into()));
            }
        }
        Ok(())
    }

    /// The default subcluster, if one is configured and enabled
    pub fn effective_default(&self) -> Option<&SubclusterId> {
        if self.default_subcluster_enabled {
            self.default_subcluster.as_ref()
        } else {
            None
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Backoff policy for metadata store fetches
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..Default::default()
        }
    }
}
