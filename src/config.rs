use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::rate_limiter::BucketConfig;
use crate::retry::RetryPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_PAYMENT_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_RATE_LIMIT_NAMESPACE: &str = "storefront:rl";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Public storefront URL, used for checkout redirects
    #[serde(default = "default_app_url")]
    pub app_url: String,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB idle timeout (seconds)
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// DB acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Payment provider REST base URL
    #[serde(default = "default_payment_api_base")]
    pub payment_api_base: String,

    /// Payment provider secret API key
    #[serde(default)]
    pub payment_secret_key: String,

    /// Shared secret used to sign provider webhooks
    #[serde(default)]
    pub payment_webhook_secret: String,

    /// Accepted clock skew for webhook signatures (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: i64,

    /// Internal credential for server-to-server admin calls
    #[serde(default)]
    pub internal_admin_key: Option<String>,

    /// Next internal credential, accepted alongside the current one during rotation
    #[serde(default)]
    pub internal_admin_key_next: Option<String>,

    /// Refund endpoint bucket capacity
    #[serde(default = "default_refund_capacity")]
    #[validate(range(min = 1))]
    pub rate_limit_refund_capacity: u32,

    /// Tokens restored to the refund bucket every interval
    #[serde(default = "default_refund_capacity")]
    pub rate_limit_refund_refill_tokens: u32,

    /// Refund bucket refill interval (seconds)
    #[serde(default = "default_rate_limit_interval_secs")]
    #[validate(range(min = 1))]
    pub rate_limit_refund_interval_secs: u64,

    /// Webhook endpoint bucket capacity
    #[serde(default = "default_webhook_capacity")]
    #[validate(range(min = 1))]
    pub rate_limit_webhook_capacity: u32,

    /// Tokens restored to the webhook bucket every interval
    #[serde(default = "default_webhook_capacity")]
    pub rate_limit_webhook_refill_tokens: u32,

    /// Webhook bucket refill interval (seconds)
    #[serde(default = "default_rate_limit_interval_secs")]
    #[validate(range(min = 1))]
    pub rate_limit_webhook_interval_secs: u64,

    /// Use Redis for admission control instead of process-local buckets
    #[serde(default)]
    pub rate_limit_use_redis: bool,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis key namespace for admission control counters
    #[serde(default = "default_rate_limit_namespace")]
    pub rate_limit_namespace: String,

    /// Currency used when a cart carries none
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Flat shipping charge applied at materialization (minor units)
    #[serde(default)]
    #[validate(range(min = 0))]
    pub default_shipping_cents: i64,

    /// Maximum stored length of a refund reason
    #[serde(default = "default_refund_reason_max_len")]
    pub refund_reason_max_len: usize,

    /// Outbound mail relay endpoint; notifications are only logged when unset
    #[serde(default)]
    pub notification_relay_url: Option<String>,

    /// Sender address for outbound notifications
    #[serde(default = "default_notification_from")]
    pub notification_from: String,

    /// Operator mailbox for failure alerts
    #[serde(default)]
    pub internal_alert_email: Option<String>,

    /// How many times the dispatcher re-reads an order before deferring the confirmation
    #[serde(default = "default_notification_poll_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub notification_poll_attempts: u32,

    /// Delay between readiness polls (milliseconds)
    #[serde(default = "default_notification_poll_delay_ms")]
    pub notification_poll_delay_ms: u64,
}

impl AppConfig {
    /// Creates a new configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            app_url: default_app_url(),
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            payment_api_base: default_payment_api_base(),
            payment_secret_key: String::new(),
            payment_webhook_secret: String::new(),
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            internal_admin_key: None,
            internal_admin_key_next: None,
            rate_limit_refund_capacity: default_refund_capacity(),
            rate_limit_refund_refill_tokens: default_refund_capacity(),
            rate_limit_refund_interval_secs: default_rate_limit_interval_secs(),
            rate_limit_webhook_capacity: default_webhook_capacity(),
            rate_limit_webhook_refill_tokens: default_webhook_capacity(),
            rate_limit_webhook_interval_secs: default_rate_limit_interval_secs(),
            rate_limit_use_redis: false,
            redis_url: default_redis_url(),
            rate_limit_namespace: default_rate_limit_namespace(),
            default_currency: default_currency(),
            default_shipping_cents: 0,
            refund_reason_max_len: default_refund_reason_max_len(),
            notification_relay_url: None,
            notification_from: default_notification_from(),
            internal_alert_email: None,
            notification_poll_attempts: default_notification_poll_attempts(),
            notification_poll_delay_ms: default_notification_poll_delay_ms(),
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(
            self.environment.to_lowercase().as_str(),
            "development" | "dev" | "test"
        )
    }

    /// Refund endpoint admission settings
    pub fn refund_bucket(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.rate_limit_refund_capacity,
            refill_tokens: self.rate_limit_refund_refill_tokens,
            refill_interval: Duration::from_secs(self.rate_limit_refund_interval_secs),
        }
    }

    /// Webhook endpoint admission settings
    pub fn webhook_bucket(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.rate_limit_webhook_capacity,
            refill_tokens: self.rate_limit_webhook_refill_tokens,
            refill_interval: Duration::from_secs(self.rate_limit_webhook_interval_secs),
        }
    }

    pub fn notification_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.notification_poll_attempts,
            Duration::from_millis(self.notification_poll_delay_ms),
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.payment_webhook_secret.trim().is_empty() {
            let mut err = ValidationError::new("payment_webhook_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_WEBHOOK_SECRET for non-development environments".into(),
            );
            errors.add("payment_webhook_secret", err);
        }

        let has_admin_key = [&self.internal_admin_key, &self.internal_admin_key_next]
            .iter()
            .any(|key| key.as_deref().is_some_and(|k| !k.trim().is_empty()));
        if !self.is_development() && !has_admin_key {
            let mut err = ValidationError::new("internal_admin_key_required");
            err.message = Some(
                "Set APP__INTERNAL_ADMIN_KEY (and optionally APP__INTERNAL_ADMIN_KEY_NEXT) outside development"
                    .into(),
            );
            errors.add("internal_admin_key", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_app_url() -> String {
    "http://localhost:3000".to_string()
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
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_payment_api_base() -> String {
    DEFAULT_PAYMENT_API_BASE.to_string()
}

fn default_webhook_tolerance_secs() -> i64 {
    300
}

fn default_refund_capacity() -> u32 {
    10
}

fn default_webhook_capacity() -> u32 {
    120
}

fn default_rate_limit_interval_secs() -> u64 {
    60
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_rate_limit_namespace() -> String {
    DEFAULT_RATE_LIMIT_NAMESPACE.to_string()
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_refund_reason_max_len() -> usize {
    100
}

fn default_notification_from() -> String {
    "orders@localhost".to_string()
}

fn default_notification_poll_attempts() -> u32 {
    5
}

fn default_notification_poll_delay_ms() -> u64 {
    300
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
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

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn production_requires_webhook_secret_and_admin_key() {
        let cfg = production_config();
        let errors = cfg.validate_additional_constraints().unwrap_err();
        let fields = errors.errors();
        assert!(fields.contains_key("payment_webhook_secret"));
        assert!(fields.contains_key("internal_admin_key"));
    }

    #[test]
    fn production_accepts_rotated_key_only() {
        let mut cfg = production_config();
        cfg.payment_webhook_secret = "whsec_test".into();
        cfg.internal_admin_key_next = Some("next-key".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_is_permissive() {
        let mut cfg = production_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn defaults_match_refund_admission_policy() {
        let cfg = production_config();
        let bucket = cfg.refund_bucket();
        assert_eq!(bucket.capacity, 10);
        assert_eq!(bucket.refill_tokens, 10);
        assert_eq!(bucket.refill_interval, Duration::from_secs(60));
    }

    #[test]
    fn poll_attempts_are_bounded() {
        let mut cfg = production_config();
        cfg.notification_poll_attempts = 50;
        assert!(cfg.validate().is_err());
        cfg.notification_poll_attempts = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = production_config();
        cfg.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }
}
