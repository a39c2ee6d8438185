//! Configuration for a windowed counter.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatelimitError, Result};

/// Fewer buckets than this degrade the sliding count into a fixed window.
pub const MIN_BUCKET_COUNT: u64 = 3;

/// Immutable configuration for a windowed counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prepended to every counter key
    pub key_prefix: String,

    /// Total window the counter can represent, in seconds
    #[serde(default = "default_bucket_span")]
    pub bucket_span: u64,

    /// Width of a single bucket, in seconds
    #[serde(default = "default_bucket_interval")]
    pub bucket_interval: u64,

    /// Seconds a counter may sit idle before the store reclaims it.
    /// Defaults to `bucket_span`.
    #[serde(default)]
    pub bucket_expiry: Option<u64>,

    /// Probability that an `add` also sweeps aged-out buckets
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
}

fn default_bucket_span() -> u64 {
    600
}

fn default_bucket_interval() -> u64 {
    5
}

fn default_sweep_probability() -> f64 {
    0.01
}

impl LimiterConfig {
    /// Create a configuration with default timings for the given key prefix.
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            bucket_span: default_bucket_span(),
            bucket_interval: default_bucket_interval(),
            bucket_expiry: None,
            sweep_probability: default_sweep_probability(),
        }
    }

    /// Set the span and interval of the bucket ring.
    pub fn with_buckets(mut self, bucket_span: u64, bucket_interval: u64) -> Self {
        self.bucket_span = bucket_span;
        self.bucket_interval = bucket_interval;
        self
    }

    /// Set the idle expiry of counter keys.
    pub fn with_expiry(mut self, bucket_expiry: u64) -> Self {
        self.bucket_expiry = Some(bucket_expiry);
        self
    }

    /// Set the probability of sweeping on each `add`.
    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability;
        self
    }

    /// Effective idle expiry, falling back to the span.
    pub fn bucket_expiry(&self) -> u64 {
        self.bucket_expiry.unwrap_or(self.bucket_span)
    }

    /// Number of buckets in the ring.
    pub fn bucket_count(&self) -> u64 {
        if self.bucket_interval == 0 {
            return 0;
        }
        self.bucket_span / self.bucket_interval
    }

    /// Check the invariants every counter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(RatelimitError::Config("key_prefix must not be empty".into()));
        }
        if self.bucket_span == 0 || self.bucket_interval == 0 {
            return Err(RatelimitError::Config(
                "bucket_span and bucket_interval must be positive".into(),
            ));
        }
        if self.bucket_count() < MIN_BUCKET_COUNT {
            return Err(RatelimitError::Config(format!(
                "bucket count {} is below the minimum of {} (span {}s / interval {}s)",
                self.bucket_count(),
                MIN_BUCKET_COUNT,
                self.bucket_span,
                self.bucket_interval
            )));
        }
        let expiry = self.bucket_expiry();
        if expiry == 0 {
            return Err(RatelimitError::Config("bucket_expiry must be positive".into()));
        }
        if expiry > self.bucket_span {
            return Err(RatelimitError::Config(format!(
                "bucket_expiry {}s exceeds bucket_span {}s",
                expiry, self.bucket_span
            )));
        }
        if !(0.0..=1.0).contains(&self.sweep_probability) {
            return Err(RatelimitError::Config(format!(
                "sweep_probability {} is outside [0, 1]",
                self.sweep_probability
            )));
        }
        Ok(())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatelimitError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `RATELIMIT_*` environment
    /// variables overriding individual fields.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading limiter configuration");

        let config: LimiterConfig = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("RATELIMIT"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RatelimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::new("key");
        assert_eq!(config.bucket_span, 600);
        assert_eq!(config.bucket_interval, 5);
        assert_eq!(config.bucket_count(), 120);
        assert_eq!(config.bucket_expiry(), config.bucket_span);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bucket_count_below_three() {
        let config = LimiterConfig::new("key").with_buckets(1, 1);
        assert!(matches!(config.validate(), Err(RatelimitError::Config(_))));

        let config = LimiterConfig::new("key").with_buckets(10, 5);
        assert!(config.validate().is_err());

        let config = LimiterConfig::new("key").with_buckets(3, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_expiry_beyond_span() {
        let config = LimiterConfig::new("key").with_expiry(1200);
        assert!(matches!(config.validate(), Err(RatelimitError::Config(_))));

        let config = LimiterConfig::new("key").with_expiry(600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(LimiterConfig::new("key").with_buckets(600, 0).validate().is_err());
        assert!(LimiterConfig::new("key").with_buckets(0, 5).validate().is_err());
        assert!(LimiterConfig::new("key").with_expiry(0).validate().is_err());
        assert!(LimiterConfig::new("").validate().is_err());
    }

    #[test]
    fn test_rejects_bad_sweep_probability() {
        assert!(LimiterConfig::new("key").with_sweep_probability(1.5).validate().is_err());
        assert!(LimiterConfig::new("key").with_sweep_probability(-0.1).validate().is_err());
        assert!(LimiterConfig::new("key").with_sweep_probability(1.0).validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
key_prefix: login
bucket_span: 60
bucket_interval: 1
bucket_expiry: 30
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.key_prefix, "login");
        assert_eq!(config.bucket_count(), 60);
        assert_eq!(config.bucket_expiry(), 30);
        assert_eq!(config.sweep_probability, 0.01);
    }

    #[test]
    fn test_parse_yaml_applies_defaults() {
        let config = LimiterConfig::from_yaml("key_prefix: api").unwrap();
        assert_eq!(config, LimiterConfig::new("api"));
    }

    #[test]
    fn test_parse_yaml_malformed() {
        assert!(matches!(
            LimiterConfig::from_yaml("bucket_span: [1, 2]"),
            Err(RatelimitError::Config(_))
        ));
        assert!(LimiterConfig::from_yaml("key_prefix: api\nbucket_expiry: 9000").is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("limiter-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "key_prefix: upload\nbucket_span: 120\nbucket_interval: 10\n").unwrap();

        let config = LimiterConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.key_prefix, "upload");
        assert_eq!(config.bucket_count(), 12);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let result = LimiterConfig::from_file("/nonexistent/limiter.yaml");
        assert!(matches!(result, Err(RatelimitError::Config(_))));
    }
}
