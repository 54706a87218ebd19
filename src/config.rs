use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use validator::Validate;

const CONFIG_DIR: &str = "config";
const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PORT: u16 = 8080;

/// Shipping tariff configuration. Monetary values are whole currency units.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ShippingConfig {
    /// Flat rate covering the first kilogram of a standard-carrier shipment
    #[serde(default = "default_standard_base")]
    pub standard_base: i64,

    /// Rate per additional kilogram (standard carrier)
    #[serde(default = "default_standard_extra_per_kg")]
    pub standard_extra_per_kg: i64,

    /// Flat rate covering the first kilogram of a same-city courier shipment
    #[serde(default = "default_courier_base")]
    pub courier_base: i64,

    /// Rate per additional kilogram (courier)
    #[serde(default = "default_courier_extra_per_kg")]
    pub courier_extra_per_kg: i64,

    /// The only city the courier option is offered for
    #[serde(default = "default_courier_city")]
    pub courier_city: String,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            standard_base: default_standard_base(),
            standard_extra_per_kg: default_standard_extra_per_kg(),
            courier_base: default_courier_base(),
            courier_extra_per_kg: default_courier_extra_per_kg(),
            courier_city: default_courier_city(),
        }
    }
}

/// Payment gateway client configuration.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL of the gateway's REST API
    #[serde(default = "default_gateway_base_url")]
    #[validate(url)]
    pub base_url: String,

    /// Merchant identifier issued by the gateway
    #[serde(default = "default_gateway_merchant_id")]
    pub merchant_id: String,

    /// Public URL the gateway redirects the shopper back to after payment
    #[serde(default = "default_gateway_callback_url")]
    #[validate(url)]
    pub callback_url: String,

    /// HTTP timeout for gateway calls, in seconds
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            merchant_id: default_gateway_merchant_id(),
            callback_url: default_gateway_callback_url(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1024))]
    pub port: u16,

    /// Deployment environment name ("development", "production", ...)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log filter directive (RUST_LOG overrides)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Run embedded migrations at startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,

    /// Display currency code recorded on orders
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Hours after which an unresolved pending settlement is eligible for
    /// the expiry sweep
    #[serde(default = "default_settlement_pending_ttl_hours")]
    #[validate(range(min = 1))]
    pub settlement_pending_ttl_hours: i64,

    #[serde(default)]
    #[validate]
    pub shipping: ShippingConfig,

    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_database_url() -> String {
    "sqlite://terracotta.db?mode=rwc".to_string()
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
fn default_true() -> bool {
    true
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_settlement_pending_ttl_hours() -> i64 {
    24
}
fn default_standard_base() -> i64 {
    45_000
}
fn default_standard_extra_per_kg() -> i64 {
    20_000
}
fn default_courier_base() -> i64 {
    60_000
}
fn default_courier_extra_per_kg() -> i64 {
    25_000
}
fn default_courier_city() -> String {
    "Portland".to_string()
}
fn default_gateway_base_url() -> String {
    "https://gateway.example.com/api/v1".to_string()
}
fn default_gateway_merchant_id() -> String {
    "terracotta-dev".to_string()
}
fn default_gateway_callback_url() -> String {
    "http://localhost:8080/api/v1/payments/callback".to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    10
}

/// Loads configuration from `config/default.toml`, an environment-specific
/// overlay, and `APP_`-prefixed environment variables (highest precedence).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let run_env = std::env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder();
    let default_path = Path::new(CONFIG_DIR).join("default");
    let env_path = Path::new(CONFIG_DIR).join(&run_env);

    builder = builder
        .add_source(File::from(default_path).required(false))
        .add_source(File::from(env_path).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;

    cfg.validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;

    info!(environment = %cfg.environment, "configuration loaded");
    Ok(cfg)
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}
