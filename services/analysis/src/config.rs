use crate::poller::PollBudget;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the analysis service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Shared AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// S3 upload bucket configuration
    pub s3: S3Config,
    /// Rekognition Custom Labels configuration
    pub rekognition: RekognitionConfig,
    /// Label vocabulary of the trained model
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// DynamoDB results table configuration
    #[serde(default)]
    pub dynamodb: DynamoDbConfig,
    /// Result store backend selection
    #[serde(default)]
    pub store: StoreConfig,
    /// SQS notification queue configuration
    pub sqs: SqsConfig,
    /// Result polling budget
    #[serde(default)]
    pub poller: PollerConfig,
    /// API configuration
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
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Settings shared by every AWS client
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region, also used to build public object URLs
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack and friends)
    pub endpoint_url: Option<String>,
}

/// S3 upload bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket that receives uploaded images
    pub bucket: String,
    /// Key prefix for uploads; object identity is the file stem below it
    #[serde(default = "default_upload_prefix")]
    pub upload_prefix: String,
    /// Upload grant expiration in seconds
    #[serde(default = "default_upload_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
    /// Maximum accepted upload size in bytes (10 MiB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Force path-style access (required for LocalStack/MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Rekognition Custom Labels configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RekognitionConfig {
    /// Project version ARN of the trained model
    pub model_arn: String,
}

/// Label names the classifier recognizes
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Label meaning "no disease"
    #[serde(default = "default_healthy_label")]
    pub healthy_label: String,
    /// Labels that name a disease
    #[serde(default = "default_disease_labels")]
    pub disease_labels: Vec<String>,
}

/// DynamoDB configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DynamoDbConfig {
    /// Table holding one result item per object identity
    #[serde(default)]
    pub table_name: String,
}

/// Result store backend
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Dynamodb,
    /// Process-local map, for local runs without AWS
    Memory,
}

/// Result store selection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

/// SQS queue receiving S3 event notifications
#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    /// Queue URL
    pub queue_url: String,
    /// Long-poll wait time in seconds (max 20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Messages fetched per receive call (max 10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Visibility timeout in seconds; failed batches reappear after it
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
}

/// Result polling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Delay before the first lookup in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay between lookups in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Number of lookups before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "analysis-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_upload_prefix() -> String {
    "uploads".to_string()
}

fn default_upload_url_expiry_secs() -> u64 {
    3600
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024 // 10MiB
}

fn default_healthy_label() -> String {
    "healthy".to_string()
}

fn default_disease_labels() -> Vec<String> {
    vec![
        "bacterial-leaf-blight".to_string(),
        "brown-spot".to_string(),
        "leaf-smut".to_string(),
    ]
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_max_messages() -> i32 {
    10
}

fn default_visibility_timeout_secs() -> i32 {
    120
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    20
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "analysis-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/analysis").required(false))
            .add_source(config::File::with_name("/etc/agrovision/analysis").required(false))
            // ANALYSIS__DYNAMODB__TABLE_NAME -> dynamodb.table_name
            .add_source(
                config::Environment::with_prefix("ANALYSIS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("classifier.disease_labels")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.rekognition.model_arn.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "rekognition.model_arn".to_string(),
            ));
        }

        let prefix = &self.s3.upload_prefix;
        if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.upload_prefix".to_string(),
                message: "must be non-empty without leading or trailing '/'".to_string(),
            });
        }

        if self.store.backend == StoreBackend::Dynamodb && self.dynamodb.table_name.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dynamodb.table_name".to_string(),
            ));
        }

        if self.sqs.queue_url.is_empty() {
            return Err(ConfigValidationError::MissingField("sqs.queue_url".to_string()));
        }

        if !(0..=20).contains(&self.sqs.wait_time_secs) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sqs.wait_time_secs".to_string(),
                message: "SQS long polling waits 0 to 20 seconds".to_string(),
            });
        }

        if !(1..=10).contains(&self.sqs.max_messages) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sqs.max_messages".to_string(),
                message: "SQS accepts 1 to 10 messages per receive".to_string(),
            });
        }

        if self.poller.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.max_attempts".to_string(),
                message: "at least one lookup is required".to_string(),
            });
        }

        if self.poller.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.interval_ms".to_string(),
                message: "interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the result polling budget
    pub fn poll_budget(&self) -> PollBudget {
        PollBudget {
            initial_delay: Duration::from_millis(self.poller.initial_delay_ms),
            interval: Duration::from_millis(self.poller.interval_ms),
            max_attempts: self.poller.max_attempts,
        }
    }
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

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            healthy_label: default_healthy_label(),
            disease_labels: default_disease_labels(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
