//! Health Check Components

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Health check status levels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Get status as HTTP status code equivalent
    pub fn as_http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Unhealthy { .. } => 503,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy { .. } => "unhealthy",
        }
    }
}

/// Health of a single dependency
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: SystemTime,
    /// Time the check itself took
    pub response_time: Duration,
    pub metadata: HashMap<String, String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>, response_time: Duration) -> Self {
        Self::with_status(name, HealthStatus::Healthy, response_time)
    }

    pub fn unhealthy(
        name: impl Into<String>,
        reason: impl Into<String>,
        response_time: Duration,
    ) -> Self {
        Self::with_status(
            name,
            HealthStatus::Unhealthy {
                reason: reason.into(),
            },
            response_time,
        )
    }

    fn with_status(name: impl Into<String>, status: HealthStatus, response_time: Duration) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: SystemTime::now(),
            response_time,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        let healthy = HealthStatus::Healthy;
        assert!(healthy.is_healthy());
        assert_eq!(healthy.as_http_status(), 200);
        assert_eq!(healthy.as_str(), "healthy");

        let unhealthy = HealthStatus::Unhealthy {
            reason: "redis down".to_string(),
        };
        assert!(!unhealthy.is_healthy());
        assert_eq!(unhealthy.as_http_status(), 503);
    }

    #[test]
    fn test_every_status_maps_to_http() {
        let statuses = [
            HealthStatus::Healthy,
            HealthStatus::Unhealthy {
                reason: "redis down".to_string(),
            },
        ];
        for status in statuses {
            let expected = match &status {
                HealthStatus::Healthy => (200, "healthy"),
                HealthStatus::Unhealthy { .. } => (503, "unhealthy"),
            };
            assert_eq!((status.as_http_status(), status.as_str()), expected);
        }
    }

    #[test]
    fn test_component_health_creation() {
        let component = ComponentHealth::unhealthy("stream", "PING failed", Duration::from_millis(3))
            .with_metadata("url", "redis://localhost:6379");

        assert_eq!(component.name, "stream");
        assert!(!component.is_healthy());
        assert_eq!(component.metadata["url"], "redis://localhost:6379");
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(HealthStatus::Unhealthy {
            reason: "x".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["reason"], "x");
    }
}
