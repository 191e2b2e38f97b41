//! Configuration and settings management
//!
//! Loads settings from environment variables and defines tuning constants
//! for the health monitor and message pipeline.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Platform API identifier
    pub api_id: i32,
    /// Platform API hash
    pub api_hash: String,

    /// Phone number used as the default login identity
    pub phone_number: Option<String>,
    /// Second-factor password for accounts with cloud password protection
    pub second_factor_password: Option<String>,

    /// Chat identifier of the monitored source channel
    pub source_chat_id: i64,
    /// Username or nickname of the forwarding target
    pub target_recipient: String,

    /// Minimum order amount a message must strictly exceed to be forwarded
    #[serde(default = "default_order_amount_threshold")]
    pub order_amount_threshold: u64,

    /// Seconds between detailed authorization health checks
    #[serde(default = "default_connection_check_interval")]
    pub connection_check_interval_secs: u64,
    /// Consecutive authorization probe failures tolerated before the
    /// session is declared lost
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    /// Delay between authorization probe attempts inside one health check
    #[serde(default = "default_auth_retry_delay")]
    pub auth_retry_delay_secs: u64,

    /// Directory where serialized session tokens are persisted
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
}

const fn default_order_amount_threshold() -> u64 {
    10_000
}

const fn default_connection_check_interval() -> u64 {
    300
}

const fn default_max_auth_failures() -> u32 {
    3
}

const fn default_auth_retry_delay() -> u64 {
    5
}

fn default_session_dir() -> String {
    "sessions".to_string()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Settings from environment variables directly.
            // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case;
            // ignore_empty treats empty env vars as unset.
            .add_source(Environment::default().ignore_empty(true).try_parsing(true))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            phone_number: None,
            second_factor_password: None,
            source_chat_id: 0,
            target_recipient: String::new(),
            order_amount_threshold: default_order_amount_threshold(),
            connection_check_interval_secs: default_connection_check_interval(),
            max_auth_failures: default_max_auth_failures(),
            auth_retry_delay_secs: default_auth_retry_delay(),
            session_dir: default_session_dir(),
        }
    }
}

/// Interval of the health monitor reconnect tick, in seconds
pub const RECONNECT_TICK_SECS: u64 = 1;

/// Time-to-live of a processed-message record (24 hours)
pub const PROCESSED_MESSAGE_TTL_SECS: u64 = 24 * 60 * 60;
/// Upper bound on tracked processed-message identifiers
pub const PROCESSED_CACHE_MAX_CAPACITY: u64 = 100_000;

/// Label of the interactive claim control on order messages
pub const CLAIM_BUTTON_LABEL: &str = "Забрать заказ";
/// Pause after a successful claim click so the platform registers it
/// before the forward is attempted
pub const CLAIM_SETTLE_DELAY_SECS: u64 = 1;

/// Initial backoff for retried transport operations, in milliseconds
pub const TRANSPORT_INITIAL_BACKOFF_MS: u64 = 250;
/// Backoff ceiling for retried transport operations, in milliseconds
pub const TRANSPORT_MAX_BACKOFF_MS: u64 = 4_000;
/// Maximum retry attempts for a transient transport failure
pub const TRANSPORT_MAX_RETRIES: usize = 3;
