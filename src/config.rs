use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use validator::Validate;

use crate::retry::RetryConfig;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_QUEUE_BACKEND: &str = "in-memory";
const DEFAULT_QUEUE_NAMESPACE: &str = "order-edit:capture";
const DEFAULT_STALENESS_MINUTES: i64 = 65;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL (capture queue backend)
    pub redis_url: String,

    /// Secret for verifying modification tokens (minimum 32 characters)
    #[validate(length(min = 32))]
    pub token_secret: String,

    /// Payment gateway API base URL
    pub gateway_base_url: String,

    /// Payment gateway secret key
    #[validate(length(min = 1))]
    pub gateway_secret_key: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Capture queue backend: "redis" or "in-memory"
    #[serde(default = "default_queue_backend")]
    pub queue_backend: String,

    /// Key namespace for the capture queue
    #[serde(default = "default_queue_namespace")]
    pub queue_namespace: String,

    /// Gateway retries after the initial attempt
    #[serde(default = "default_gateway_max_retries")]
    pub gateway_max_retries: u32,

    /// Initial backoff delay for gateway retries (milliseconds)
    #[serde(default = "default_gateway_initial_delay_ms")]
    pub gateway_initial_delay_ms: u64,

    /// Backoff multiplier for gateway retries
    #[serde(default = "default_gateway_backoff_factor")]
    pub gateway_backoff_factor: u32,

    /// Orders younger than this are left to the normal capture path
    #[serde(default = "default_staleness_minutes")]
    pub reconciliation_staleness_minutes: i64,

    /// Whether the reconciliation scheduler runs in this process
    #[serde(default = "default_true_bool")]
    pub reconciliation_enabled: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_queue_backend() -> String {
    DEFAULT_QUEUE_BACKEND.to_string()
}
fn default_queue_namespace() -> String {
    DEFAULT_QUEUE_NAMESPACE.to_string()
}
fn default_gateway_max_retries() -> u32 {
    3
}
fn default_gateway_initial_delay_ms() -> u64 {
    200
}
fn default_gateway_backoff_factor() -> u32 {
    2
}
fn default_staleness_minutes() -> i64 {
    DEFAULT_STALENESS_MINUTES
}
fn default_true_bool() -> bool {
    true
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Retry settings for the gateway client.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.gateway_max_retries,
            initial_delay: Duration::from_millis(self.gateway_initial_delay_ms),
            backoff_factor: self.gateway_backoff_factor,
        }
    }

    /// Parsed gateway base URL.
    pub fn gateway_url(&self) -> Result<Url, AppConfigError> {
        Url::parse(&self.gateway_base_url).map_err(AppConfigError::InvalidGatewayUrl)
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation failed: {0}")]
    Validation(validator::ValidationErrors),
    #[error("invalid gateway base URL: {0}")]
    InvalidGatewayUrl(url::ParseError),
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("order_edit_api={level},tower_http=debug");
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(filter_directive)
            .json()
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // NOTE: token_secret and gateway_secret_key have no defaults - they
    // MUST be provided via environment variable or config file.
    let builder = Config::builder()
        .set_default("database_url", "sqlite://order_edit.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("gateway_base_url", "https://gateway.localhost")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false));

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("token_secret").is_err() {
        error!("Token secret is not configured. Set APP__TOKEN_SECRET with a secure random string (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "token_secret is required but not configured".into(),
        )));
    }
    if config.get_string("gateway_secret_key").is_err() {
        error!("Gateway secret key is not configured. Set APP__GATEWAY_SECRET_KEY.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "gateway_secret_key is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.gateway_url()?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
