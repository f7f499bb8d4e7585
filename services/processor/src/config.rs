use prism_messaging::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Kafka(#[from] prism_messaging::ConfigError),
}

/// Main configuration for the processor service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub s3: S3Config,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Working bucket uploads land in and renditions are written to
    pub upload_bucket: String,
    /// Permanent archive bucket; must differ from the upload bucket
    pub archive_bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for presigned uploads
    #[serde(default = "default_upload_prefix")]
    pub upload_prefix: String,
    #[serde(default = "default_upload_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Stage execution, concurrency and rendition settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Attempts per stage, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Wall-clock budget for one run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Runs executing at once in this process
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Per-image run lease; must outlive the run budget
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_resize_max_width")]
    pub resize_max_width: u32,
    #[serde(default = "default_resize_max_height")]
    pub resize_max_height: u32,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_width: u32,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// How often to look for stalled runs; 0 disables recovery
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    /// A `PROCESSING` record untouched this long is considered stalled
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: i64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "prism-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_prefix() -> String {
    "uploads/".to_string()
}

fn default_upload_url_expiry_secs() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_runs() -> usize {
    8
}

fn default_lease_ttl_secs() -> u64 {
    360
}

fn default_resize_max_width() -> u32 {
    1024
}

fn default_resize_max_height() -> u32 {
    768
}

fn default_thumbnail_size() -> u32 {
    200
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_recovery_interval_secs() -> u64 {
    60
}

fn default_stalled_after_secs() -> u64 {
    600
}

fn default_recovery_batch_size() -> i64 {
    50
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            run_timeout_secs: default_run_timeout_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            resize_max_width: default_resize_max_width(),
            resize_max_height: default_resize_max_height(),
            thumbnail_width: default_thumbnail_size(),
            thumbnail_height: default_thumbnail_size(),
            jpeg_quality: default_jpeg_quality(),
            recovery_interval_secs: default_recovery_interval_secs(),
            stalled_after_secs: default_stalled_after_secs(),
            recovery_batch_size: default_recovery_batch_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "prism-processor")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(config::File::with_name("/etc/prism/processor").required(false))
            // PROCESSOR__S3__UPLOAD_BUCKET -> s3.upload_bucket
            .add_source(
                config::Environment::with_prefix("PROCESSOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.s3.upload_bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.upload_bucket".to_string()));
        }
        if self.s3.archive_bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.archive_bucket".to_string()));
        }
        if self.s3.archive_bucket == self.s3.upload_bucket {
            return Err(ConfigError::InvalidValue {
                key: "s3.archive_bucket".to_string(),
                message: "must differ from the upload bucket".to_string(),
            });
        }

        let pipeline = &self.pipeline;
        if pipeline.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if pipeline.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.backoff_multiplier".to_string(),
                message: "must be >= 1.0".to_string(),
            });
        }
        if pipeline.initial_backoff_ms > pipeline.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.initial_backoff_ms".to_string(),
                message: "must not exceed pipeline.max_backoff_ms".to_string(),
            });
        }
        let dimensions = [
            ("pipeline.resize_max_width", pipeline.resize_max_width),
            ("pipeline.resize_max_height", pipeline.resize_max_height),
            ("pipeline.thumbnail_width", pipeline.thumbnail_width),
            ("pipeline.thumbnail_height", pipeline.thumbnail_height),
        ];
        if let Some((key, _)) = dimensions.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(1..=100).contains(&pipeline.jpeg_quality) {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.jpeg_quality".to_string(),
                message: "must be within 1..=100".to_string(),
            });
        }
        if pipeline.max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.max_concurrent_runs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if pipeline.lease_ttl_secs <= pipeline.run_timeout_secs {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.lease_ttl_secs".to_string(),
                message: "must exceed pipeline.run_timeout_secs".to_string(),
            });
        }

        Ok(())
    }

    pub fn upload_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.upload_url_expiry_secs)
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn recovery_interval(&self) -> Option<Duration> {
        (self.recovery_interval_secs > 0).then(|| Duration::from_secs(self.recovery_interval_secs))
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            service: ServiceConfig::default(),
            kafka: KafkaConfig::default(),
            s3: S3Config {
                upload_bucket: "prism-uploads".to_string(),
                archive_bucket: "prism-archive".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                upload_prefix: default_upload_prefix(),
                upload_url_expiry_secs: default_upload_url_expiry_secs(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/prism".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: true,
            },
            pipeline: PipelineConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.max_attempts, 3);
        assert_eq!(pipeline.initial_backoff_ms, 2000);
        assert_eq!(pipeline.backoff_multiplier, 2.0);
        assert_eq!(pipeline.run_timeout(), Duration::from_secs(300));
        assert_eq!((pipeline.resize_max_width, pipeline.resize_max_height), (1024, 768));
        assert_eq!((pipeline.thumbnail_width, pipeline.thumbnail_height), (200, 200));
        assert_eq!(default_upload_url_expiry_secs(), 300);
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_archive_bucket_must_differ() {
        let mut config = config();
        config.s3.archive_bucket = config.s3.upload_bucket.clone();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_lease_must_outlive_run_budget() {
        let mut config = config();
        config.pipeline.lease_ttl_secs = config.pipeline.run_timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_rendition_settings() {
        let mut config = config();
        config.pipeline.thumbnail_height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "pipeline.thumbnail_height"
        ));

        let mut other = self::config();
        other.pipeline.jpeg_quality = 0;
        assert!(other.validate().is_err());
    }

    #[test]
    fn test_initial_backoff_above_cap_is_rejected() {
        let mut config = config();
        config.pipeline.initial_backoff_ms = config.pipeline.max_backoff_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recovery_can_be_disabled() {
        let mut pipeline = PipelineConfig::default();
        assert_eq!(pipeline.recovery_interval(), Some(Duration::from_secs(60)));
        pipeline.recovery_interval_secs = 0;
        assert_eq!(pipeline.recovery_interval(), None);
    }

    #[test]
    fn test_pipeline_section_deserializes_partially() {
        let pipeline: PipelineConfig =
            serde_json::from_value(serde_json::json!({ "max_attempts": 5 })).unwrap();
        assert_eq!(pipeline.max_attempts, 5);
        assert_eq!(pipeline.max_backoff_ms, 30000);
    }
}
