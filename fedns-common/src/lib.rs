pub mod types;
pub mod error;
pub mod config;
pub mod async_runtime;
pub mod health;

pub use types::*;
pub use error::{ErrorClass, FedNsError, Result};
pub use config::RouterConfig;
pub use async_runtime::{
    RetryConfig, ShutdownCoordinator, retry_if, retry_with_backoff, timeouts,
};
pub use health::{HealthCheckResult, HealthChecker, HealthStatus};
