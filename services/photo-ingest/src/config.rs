use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Main configuration for the photo ingest service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Ingestion rules
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Duplicate handling
    #[serde(default)]
    pub duplicates: DuplicateConfig,
    /// Storage retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Kafka notification consumer
    #[cfg(feature = "kafka")]
    pub kafka: Option<KafkaConfig>,
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
    /// Verbose logging, forces the debug level
    #[serde(default)]
    pub verbose: bool,
    /// Emit JSON formatted logs
    #[serde(default = "default_true")]
    pub json_logs: bool,
    /// HTTP invoke listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP invoke listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Maximum jobs running at once in serve mode
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Routing, limits and timeouts for a single ingestion job
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Source buckets accepted for processing (absent = any)
    #[serde(default)]
    pub allowed_source_buckets: Option<Vec<String>>,
    /// Source bucket -> destination bucket routing (unmapped = same bucket)
    #[serde(default)]
    pub bucket_mappings: HashMap<String, String>,
    /// Key prefix under which processed folders are written
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Largest accepted source object
    #[serde(default = "default_max_object_size")]
    pub max_object_size_bytes: u64,
    /// Timeout for rendition generation
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Timeout for capture metadata parsing
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
}

/// What to do with the source object of a detected duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    Delete,
    #[default]
    Move,
    Keep,
    Replace,
}

impl DuplicateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateAction::Delete => "delete",
            DuplicateAction::Move => "move",
            DuplicateAction::Keep => "keep",
            DuplicateAction::Replace => "replace",
        }
    }
}

impl fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duplicate detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateConfig {
    /// Run duplicate detection
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Disposition for detected duplicates
    #[serde(default)]
    pub action: DuplicateAction,
    /// Prefix (in the source bucket) for quarantined duplicates
    #[serde(default = "default_quarantine_prefix")]
    pub quarantine_prefix: String,
    /// Upper bound on listed candidates per check
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Size difference below which two files may be the same photo
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance_bytes: u64,
}

/// Retry policy for storage operations
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Kafka consumer configuration for bucket notifications
#[cfg(feature = "kafka")]
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying bucket notification documents
    #[serde(default = "default_notifications_topic")]
    pub notifications_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

// Default value functions
fn default_service_name() -> String {
    "photo-ingest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_output_prefix() -> String {
    "processed/".to_string()
}

fn default_max_object_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_metadata_timeout_ms() -> u64 {
    5000
}

fn default_quarantine_prefix() -> String {
    "duplicates/".to_string()
}

fn default_max_candidates() -> usize {
    100
}

fn default_size_tolerance() -> u64 {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

#[cfg(feature = "kafka")]
fn default_consumer_group() -> String {
    "photo-ingest".to_string()
}

#[cfg(feature = "kafka")]
fn default_notifications_topic() -> String {
    "photo-ingest.bucket-notifications".to_string()
}

#[cfg(feature = "kafka")]
fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

#[cfg(feature = "kafka")]
fn default_session_timeout_ms() -> u32 {
    30000
}

#[cfg(feature = "kafka")]
fn default_max_poll_interval_ms() -> u32 {
    300000
}

impl Config {
    /// Load configuration from config files and environment, then validate it
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/photo-ingest").required(false))
            .add_source(config::File::with_name("/etc/photo-ingest/config").required(false))
            // Override with environment variables
            // PHOTO_INGEST__DUPLICATES__ACTION -> duplicates.action
            .add_source(
                config::Environment::with_prefix("PHOTO_INGEST")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ingest.allowed_source_buckets"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;
        let duplicates = &self.duplicates;

        if ingest.output_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "ingest.output_prefix",
                "must not be empty, every key would look already processed",
            ));
        }
        if duplicates.quarantine_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "duplicates.quarantine_prefix",
                "must not be empty, every key would look already processed",
            ));
        }
        if ingest.output_prefix.starts_with(&duplicates.quarantine_prefix)
            || duplicates.quarantine_prefix.starts_with(&ingest.output_prefix)
        {
            return Err(ConfigError::invalid(
                "duplicates.quarantine_prefix",
                "must not overlap with ingest.output_prefix",
            ));
        }
        if ingest.operation_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "ingest.operation_timeout_secs",
                "must be greater than zero",
            ));
        }
        if ingest.metadata_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "ingest.metadata_timeout_ms",
                "must be greater than zero",
            ));
        }
        if let Some((source, _)) = ingest.bucket_mappings.iter().find(|(_, d)| d.is_empty()) {
            return Err(ConfigError::invalid(
                "ingest.bucket_mappings",
                format!("destination for {source} is empty"),
            ));
        }
        if duplicates.max_candidates == 0 {
            return Err(ConfigError::invalid(
                "duplicates.max_candidates",
                "must be greater than zero",
            ));
        }
        if duplicates.size_tolerance_bytes == 0 {
            return Err(ConfigError::invalid(
                "duplicates.size_tolerance_bytes",
                "must be greater than zero",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Effective log level, taking the verbose flag into account
    pub fn log_level(&self) -> &str {
        if self.service.verbose {
            "debug"
        } else {
            &self.service.log_level
        }
    }
}

impl IngestConfig {
    /// Get the rendition timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Get the metadata parse timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    /// Destination bucket for a source bucket
    pub fn destination_for<'a>(&'a self, source_bucket: &'a str) -> &'a str {
        self.bucket_mappings
            .get(source_bucket)
            .map(String::as_str)
            .unwrap_or(source_bucket)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            verbose: false,
            json_logs: true,
            host: default_host(),
            port: default_port(),
            metrics_port: default_metrics_port(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            allowed_source_buckets: None,
            bucket_mappings: HashMap::new(),
            output_prefix: default_output_prefix(),
            max_object_size_bytes: default_max_object_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
        }
    }
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            action: DuplicateAction::default(),
            quarantine_prefix: default_quarantine_prefix(),
            max_candidates: default_max_candidates(),
            size_tolerance_bytes: default_size_tolerance(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
