use crate::error::{PacerError, PacerResult};
use crate::priority::Priority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Tuning for a single endpoint's limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LimiterConfig {
    /// Baseline refill rate, also the starting rate when no history exists
    #[validate(range(min = 0.0))]
    pub tokens_per_second: f64,
    #[validate(range(min = 1))]
    pub bucket_capacity: u32,
    /// Informational only; the bucket never holds more than `bucket_capacity`
    pub burst_capacity: u32,
    #[serde(with = "humantime_serde")]
    pub target_response_time: Duration,
    /// Fractional step applied on each adjustment
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub adjustment_factor: f64,
    #[validate(range(min = 0.0))]
    pub min_rate: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_rate: f64,
    #[validate(nested)]
    pub priority_weights: PriorityWeights,
    #[validate(range(min = 1))]
    pub response_window_size: usize,
    #[serde(with = "humantime_serde")]
    pub adjustment_interval: Duration,
    /// Ceiling for `queue_wait * priority_weight` before a queued request is dropped
    #[serde(with = "humantime_serde")]
    pub max_weighted_wait: Duration,
}

/// Per-priority multipliers used by the weighted-timeout rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PriorityWeights {
    #[validate(range(exclusive_min = 0.0))]
    pub critical: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub high: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub normal: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub low: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub background: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 10.0,
            bucket_capacity: 20,
            burst_capacity: 40,
            target_response_time: Duration::from_secs(1),
            adjustment_factor: 0.1,
            min_rate: 1.0,
            max_rate: 100.0,
            priority_weights: PriorityWeights::default(),
            response_window_size: 100,
            adjustment_interval: Duration::from_secs(30),
            max_weighted_wait: Duration::from_secs(30),
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 0.8,
            normal: 0.6,
            low: 0.4,
            background: 0.2,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
            Priority::Background => self.background,
        }
    }
}

impl LimiterConfig {
    /// Validate field ranges and the constraints between fields
    pub fn check(&self) -> PacerResult<()> {
        self.validate()?;

        if self.min_rate > self.max_rate {
            return Err(PacerError::ValidationError(format!(
                "min_rate ({}) must not exceed max_rate ({})",
                self.min_rate, self.max_rate
            )));
        }
        if self.target_response_time.is_zero() {
            return Err(PacerError::ValidationError(
                "target_response_time must be greater than 0".to_string(),
            ));
        }
        if self.adjustment_interval.is_zero() {
            return Err(PacerError::ValidationError(
                "adjustment_interval must be greater than 0".to_string(),
            ));
        }
        if self.max_weighted_wait.is_zero() {
            return Err(PacerError::ValidationError(
                "max_weighted_wait must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Starting rate, pulled into `[min_rate, max_rate]`
    pub fn initial_rate(&self) -> f64 {
        self.tokens_per_second.clamp(self.min_rate, self.max_rate)
    }

    /// Whether a request that has waited `waited` should be dropped
    pub fn exceeds_weighted_wait(&self, priority: Priority, waited: Duration) -> bool {
        waited.as_secs_f64() * self.priority_weights.weight(priority)
            > self.max_weighted_wait.as_secs_f64()
    }
}

/// Limiter rules keyed by endpoint name, with a fallback rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfigs {
    #[serde(default)]
    pub endpoints: HashMap<String, LimiterConfig>,
    #[serde(default)]
    pub default_rule: LimiterConfig,
}

impl EndpointConfigs {
    /// Load and validate rules from a JSON document on disk
    pub fn from_json_file(path: impl AsRef<Path>) -> PacerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PacerError::ConfigurationError(format!(
                "Failed to read endpoint rules from {}: {}",
                path.display(),
                e
            ))
        })?;
        let configs: EndpointConfigs = serde_json::from_str(&raw)?;
        configs.check()?;
        Ok(configs)
    }

    /// Get the rule for an endpoint, falling back to the default
    pub fn get_rule(&self, endpoint: &str) -> &LimiterConfig {
        self.endpoints.get(endpoint).unwrap_or(&self.default_rule)
    }

    pub fn set_rule(&mut self, endpoint: impl Into<String>, rule: LimiterConfig) {
        self.endpoints.insert(endpoint.into(), rule);
    }

    pub fn remove_rule(&mut self, endpoint: &str) -> Option<LimiterConfig> {
        self.endpoints.remove(endpoint)
    }

    pub fn check(&self) -> PacerResult<()> {
        self.default_rule.check()?;
        for (name, rule) in &self.endpoints {
            rule.check().map_err(|e| {
                PacerError::ValidationError(format!("endpoint '{}': {}", name, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        tokio_test::assert_ok!(LimiterConfig::default().check());
    }

    #[test]
    fn test_rejects_inverted_rate_bounds() {
        let config = LimiterConfig {
            min_rate: 50.0,
            max_rate: 10.0,
            ..Default::default()
        };
        assert!(matches!(config.check(), Err(PacerError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_non_positive_weight() {
        let mut config = LimiterConfig::default();
        config.priority_weights.low = 0.0;
        assert!(config.check().is_err());

        config.priority_weights.low = -1.0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_factor() {
        let config = LimiterConfig {
            adjustment_factor: 1.5,
            ..Default::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_initial_rate_is_clamped() {
        let config = LimiterConfig {
            tokens_per_second: 500.0,
            max_rate: 50.0,
            ..Default::default()
        };
        assert_eq!(config.initial_rate(), 50.0);
    }

    #[test]
    fn test_weighted_wait_grants_low_weights_longer_grace() {
        let config = LimiterConfig {
            max_weighted_wait: Duration::from_secs(10),
            ..Default::default()
        };
        let waited = Duration::from_secs(12);
        assert!(config.exceeds_weighted_wait(Priority::Critical, waited));
        assert!(!config.exceeds_weighted_wait(Priority::Background, waited));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LimiterConfig = serde_json::from_str(
            r#"{"tokens_per_second": 4.0, "target_response_time": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(config.tokens_per_second, 4.0);
        assert_eq!(config.target_response_time, Duration::from_millis(250));
        assert_eq!(config.bucket_capacity, 20);
        assert_eq!(config.priority_weights, PriorityWeights::default());
    }

    #[test]
    fn test_endpoint_rules_fall_back_to_default() {
        let mut configs = EndpointConfigs::default();
        configs.set_rule(
            "search",
            LimiterConfig {
                tokens_per_second: 2.0,
                ..Default::default()
            },
        );
        assert_eq!(configs.get_rule("search").tokens_per_second, 2.0);
        assert_eq!(configs.get_rule("other").tokens_per_second, 10.0);
        assert!(configs.remove_rule("search").is_some());
        assert_eq!(configs.get_rule("search").tokens_per_second, 10.0);
    }

    #[test]
    fn test_load_endpoint_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoints": {{"lookup": {{"min_rate": 2.0, "max_rate": 8.0}}}}}}"#
        )
        .unwrap();

        let configs = EndpointConfigs::from_json_file(file.path()).unwrap();
        assert_eq!(configs.get_rule("lookup").max_rate, 8.0);
    }

    #[test]
    fn test_load_rejects_invalid_rule() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoints": {{"lookup": {{"min_rate": 9.0, "max_rate": 8.0}}}}}}"#
        )
        .unwrap();

        let err = EndpointConfigs::from_json_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("lookup"));
    }
}
