use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_CURRENCY: &str = "BDT";
const DEFAULT_ORDER_NUMBER_PREFIX: &str = "ORD";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAYMENT_WINDOW_MINUTES: i64 = 30;
const DEFAULT_EVENT_BUFFER: usize = 256;
const CONFIG_DIR: &str = "config";

/// Payment gateway client settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upper bound on any single gateway call; a timeout surfaces as a
    /// retryable gateway error and never mutates order state.
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,

    /// Minutes after checkout that the payment window stays open. Tracked on
    /// the order for a future expiry job; nothing cancels automatically.
    #[serde(default = "default_payment_window_minutes")]
    pub payment_window_minutes: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_gateway_timeout_secs(),
            payment_window_minutes: default_payment_window_minutes(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Application configuration structure
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// ISO 4217 currency code used for every order
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Prefix for human-readable order numbers
    #[serde(default = "default_order_number_prefix")]
    pub order_number_prefix: String,

    /// Event channel capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_order_number_prefix() -> String {
    DEFAULT_ORDER_NUMBER_PREFIX.to_string()
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_payment_window_minutes() -> i64 {
    DEFAULT_PAYMENT_WINDOW_MINUTES
}

impl AppConfig {
    /// Minimal configuration for embedding the engine, e.g. from tests.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            currency: default_currency(),
            order_number_prefix: default_order_number_prefix(),
            event_buffer: default_event_buffer(),
            gateway: GatewayConfig::default(),
        }
    }

    /// Loads configuration from layered sources: `config/default`, an
    /// environment-specific file, then `APP_`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder()
            .set_default("environment", environment.clone())?
            .add_source(File::from(Path::new(CONFIG_DIR).join("default")).required(false))
            .add_source(File::from(Path::new(CONFIG_DIR).join(&environment)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database_url", url)?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        info!(environment = %config.environment, "Configuration loaded");
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Installs the global tracing subscriber according to the configuration.
/// Safe to call once per process; tests use their own subscriber.
pub fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
