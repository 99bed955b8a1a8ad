//! Gateway configuration.
//!
//! Fully enumerated configuration for every resilience component, loadable
//! from TOML. Absent values fall back to component defaults (safety margin
//! 0.8, failure threshold 5, recovery timeout 60s, cache TTL 5 minutes).

use std::collections::HashMap;
use std::path::Path;

use clob_batch::BatchConfig;
use clob_resilience::{BreakerConfig, CacheConfig, QuotaConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, GatewayResult};

/// Top-level gateway configuration.
///
/// ```toml
/// [quotas.order-submit]
/// capacity = 500
/// window_ms = 10000
/// safety_margin = 0.8
/// per_identity = true
///
/// [breaker]
/// failure_threshold = 5
/// recovery_timeout_ms = 60000
///
/// [retry]
/// max_attempts = 4
/// base_delay_ms = 1000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-endpoint-class quotas. Classes not listed here are admitted
    /// unchecked.
    #[serde(default)]
    pub quotas: HashMap<String, QuotaConfig>,

    /// Circuit breaker settings, applied per endpoint class.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Metadata cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retry policy for all calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Batch fan-out settings.
    #[serde(default)]
    pub batch: BatchConfig,
}

impl GatewayConfig {
    /// Validate every section.
    pub fn validate(&self) -> GatewayResult<()> {
        for (class, quota) in &self.quotas {
            quota
                .validate()
                .map_err(|e| GatewayError::Config(format!("quota [{class}]: {e}")))?;
        }
        self.breaker
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        self.cache
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        self.retry
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        self.batch
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(())
    }

    /// Load configuration from the path in `CLOB_GATEWAY_CONFIG`, falling
    /// back to `config/default.toml`, falling back to defaults when no file
    /// exists.
    pub fn load() -> GatewayResult<Self> {
        let config_path = std::env::var("CLOB_GATEWAY_CONFIG")
            .unwrap_or_else(|_| "config/default.toml".to_string());

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            info!(path = %config_path, "no config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &str) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_ms, 60_000);
        assert_eq!(config.cache.capacity, 10_000);
        assert_eq!(config.batch.max_concurrency, 8);
    }

    #[test]
    fn test_parse_partial_toml_fills_defaults() {
        let toml_str = r#"
            [quotas.order-submit]
            capacity = 500
            window_ms = 10000
            per_identity = true

            [retry]
            max_attempts = 2
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        let quota = &config.quotas["order-submit"];
        assert_eq!(quota.capacity, 500);
        assert!(quota.per_identity);
        // Omitted safety margin falls back to 0.8.
        assert!((quota.safety_margin - 0.8).abs() < f64::EPSILON);

        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_section_rejected_at_load() {
        let toml_str = r#"
            [quotas.order-submit]
            capacity = 0
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("breaker"));
        assert!(toml_str.contains("failure_threshold"));
    }
}
