//! Health reporting for FedNS components

use std::collections::HashMap;
use std::time::SystemTime;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: SystemTime,
    pub metrics: HashMap<String, f64>,
    pub recommendations: Vec<String>,
}

impl HealthCheckResult {
    pub fn new(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message: message.into(),
            timestamp: SystemTime::now(),
            metrics: HashMap::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }
}

/// Health status levels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Degraded,
    Unknown,
}

impl HealthStatus {
    /// Whether the component can still serve requests
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning | HealthStatus::Degraded)
    }
}

/// Health check trait that components must implement
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(&self) -> Result<HealthCheckResult>;
    fn component_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_result_builder() {
        let result = HealthCheckResult::new("mount_table_cache", HealthStatus::Degraded, "stale")
            .with_metric("table_version", 3.0)
            .with_recommendation("check metadata store connectivity");
        assert_eq!(result.metrics["table_version"], 3.0);
        assert_eq!(result.recommendations.len(), 1);
        assert!(result.status.is_serving());
        assert!(!HealthStatus::Unknown.is_serving());
    }
}
