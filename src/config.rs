//! Configuration management for the task runtime.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required by the daemon. API key for the language model.
//! - `DEFAULT_MODEL` - Optional. Model identifier. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `SANDBOX_API_URL` - Optional. Base URL of the remote sandbox service.
//! - `SANDBOX_API_KEYS` - Optional. Comma-separated sandbox credentials (`token` or `id=token`).
//! - `MAX_ITERATIONS` - Optional. Maximum session iterations. Defaults to `10`.
//! - `MAX_CONCURRENT_TASKS` - Optional. Concurrency ceiling. Defaults to `3`.
//! - `POLL_INTERVAL_SECS` - Optional. Scheduler poll interval. Defaults to `5`.
//! - `POLL_BATCH_SIZE` - Optional. Pending tasks fetched per poll. Defaults to `10`.
//! - `SESSION_TIMEOUT_SECS` - Optional. Wall-clock limit per session. Defaults to `1800`.
//! - `MAX_TASK_RETRIES` - Optional. Requeues after rate limiting. Defaults to `3`.
//! - `CONTEXT_WINDOW` - Optional. Memory entries kept verbatim in context. Defaults to `8`.
//! - `REPLAN_ON_ERROR` - Optional. Request a fresh plan after a failed tool call. Defaults to `true`.
//! - `SANDBOX_CAPACITY` - Optional. Maximum concurrent sandbox leases. Defaults to `20`.
//! - `SANDBOX_HARD_TIMEOUT_SECS` - Optional. Provider-side sandbox lifetime. Defaults to `3600`.
//! - `SANDBOX_SAFETY_MARGIN_SECS` - Optional. Margin kept below the hard timeout. Defaults to `300`.
//! - `SANDBOX_IDLE_TIMEOUT_SECS` - Optional. Idle time before reclamation. Defaults to `600`.
//! - `SANDBOX_SWEEP_INTERVAL_SECS` - Optional. Reclamation sweep period. Defaults to `300`.
//! - `CREDENTIAL_COOLDOWN_SECS` - Optional. Cooldown after a quota failure. Defaults to `300`.
//! - `TASK_STORE` - Optional. `memory` or `sqlite`. Defaults to `sqlite`.
//! - `DATA_DIR` - Optional. Directory for the SQLite database. Defaults to `./data`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::store::TaskStoreType;
use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the poll loop looks for pending tasks
    pub poll_interval: Duration,

    /// Maximum number of pending tasks fetched per poll
    pub batch_size: usize,

    /// Maximum number of sessions running at once
    pub max_concurrent: usize,

    /// How many times a rate-limited task is requeued before it fails
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_concurrent: 3,
            max_retries: 3,
        }
    }
}

/// Agent session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on think/act/observe iterations
    pub max_iterations: usize,

    /// Overall wall-clock limit for one session run
    pub timeout: Duration,

    /// Number of most recent memory entries kept verbatim in the model context
    pub context_window: usize,

    /// Ask the model for a plan when a task arrives without steps
    pub plan_before_execute: bool,

    /// Ask the model for a fresh plan after a failed tool call
    pub replan_on_error: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeout: Duration::from_secs(30 * 60),
            context_window: 8,
            plan_before_execute: true,
            replan_on_error: true,
        }
    }
}

/// Sandbox pool and credential configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base URL of the remote sandbox service
    pub api_url: String,

    /// Raw credential entries (`token` or `id=token`)
    pub api_keys: Vec<String>,

    /// Maximum concurrent leases
    pub capacity: usize,

    /// Provider-side hard lifetime of one sandbox
    pub hard_timeout: Duration,

    /// Leases are retired this long before the provider would expire them
    pub safety_margin: Duration,

    /// Idle time after which a lease is reclaimed
    pub idle_timeout: Duration,

    /// Period of the background reclamation sweep
    pub sweep_interval: Duration,

    /// How long a quota-exhausted credential stays disabled
    pub credential_cooldown: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8787".to_string(),
            api_keys: Vec::new(),
            capacity: 20,
            hard_timeout: Duration::from_secs(60 * 60),
            safety_margin: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            credential_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

impl SandboxConfig {
    /// Oldest a lease may get before it is retired.
    pub fn max_lease_age(&self) -> Duration {
        self.hard_timeout.saturating_sub(self.safety_margin)
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Language model API key
    pub api_key: String,

    /// Default model identifier (OpenRouter format)
    pub default_model: String,

    /// Which task store backend to use
    pub store_type: TaskStoreType,

    /// Directory for persistent state
    pub data_dir: PathBuf,

    pub scheduler: SchedulerConfig,

    pub session: SessionConfig,

    pub sandbox: SandboxConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// and `ConfigError::InvalidValue` for unparseable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let store_type = std::env::var("TASK_STORE")
            .map(|v| TaskStoreType::from_str(&v))
            .unwrap_or_default();

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 5)?),
            batch_size: env_or("POLL_BATCH_SIZE", 10)?,
            max_concurrent: env_or("MAX_CONCURRENT_TASKS", 3)?,
            max_retries: env_or("MAX_TASK_RETRIES", 3)?,
        };

        let session = SessionConfig {
            max_iterations: env_or("MAX_ITERATIONS", 10)?,
            timeout: Duration::from_secs(env_or("SESSION_TIMEOUT_SECS", 30 * 60)?),
            context_window: env_or("CONTEXT_WINDOW", 8)?,
            plan_before_execute: true,
            replan_on_error: env_var_bool("REPLAN_ON_ERROR", true),
        };

        let api_keys = std::env::var("SANDBOX_API_KEYS")
            .map(|raw| parse_key_list(&raw))
            .unwrap_or_default();

        let sandbox = SandboxConfig {
            api_url: std::env::var("SANDBOX_API_URL")
                .unwrap_or_else(|_| SandboxConfig::default().api_url),
            api_keys,
            capacity: env_or("SANDBOX_CAPACITY", 20)?,
            hard_timeout: Duration::from_secs(env_or("SANDBOX_HARD_TIMEOUT_SECS", 60 * 60)?),
            safety_margin: Duration::from_secs(env_or("SANDBOX_SAFETY_MARGIN_SECS", 5 * 60)?),
            idle_timeout: Duration::from_secs(env_or("SANDBOX_IDLE_TIMEOUT_SECS", 10 * 60)?),
            sweep_interval: Duration::from_secs(env_or("SANDBOX_SWEEP_INTERVAL_SECS", 5 * 60)?),
            credential_cooldown: Duration::from_secs(env_or("CREDENTIAL_COOLDOWN_SECS", 5 * 60)?),
        };

        if sandbox.safety_margin >= sandbox.hard_timeout {
            return Err(ConfigError::InvalidValue(
                "SANDBOX_SAFETY_MARGIN_SECS".to_string(),
                "must be smaller than SANDBOX_HARD_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            default_model,
            store_type,
            data_dir,
            scheduler,
            session,
            sandbox,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, data_dir: PathBuf) -> Self {
        Self {
            api_key,
            default_model,
            store_type: TaskStoreType::Memory,
            data_dir,
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Read and parse an optional environment variable.
fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
