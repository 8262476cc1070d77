//! Contains configuration options for the service that control its network topology
//! and internal behaviors

use anyhow::Context;
use config_backoff::Backoff;
use serde::Deserialize;
use sloggers::terminal::TerminalLoggerConfig;
use std::time::Duration;

/// Configuration object loaded upon startup
#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    /// Collection of secret values used to connect to services
    pub secrets: Secrets,
    /// Collection of external services that this service connects to
    pub services: Services,
    /// Parameters for the backoff used to connect to external services during initialization
    #[serde(default)]
    pub initialization_backoff: Backoff,
    /// Timeout for a single connection attempt made during initialization
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub initialization_attempt_timeout: Duration,
    /// Prefix shared by every key and channel written to the store
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub capture: Capture,
    #[serde(default)]
    pub gateway: Gateway,

    pub logging: TerminalLoggerConfig,
}

/// Collection of secret values used to connect to services
#[derive(Deserialize, Clone)]
pub struct Secrets {
    /// Token of the primary bot, used for the gateway and as the final dispatch tier
    pub discord_token: String,
    /// Secondary bot tokens that are registered when the service starts
    #[serde(default)]
    pub worker_tokens: Vec<String>,
}

// Tokens never end up in the configuration dump
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("discord_token", &"<redacted>")
            .field("worker_tokens", &self.worker_tokens.len())
            .finish()
    }
}

/// Collection of external services that this service connects to
#[derive(Debug, Deserialize, Clone)]
pub struct Services {
    pub store: StoreBackend,
}

/// Which key-value store backs the ledger, queues and pub/sub channels
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    Redis { url: String },
    /// Process-local store; only meaningful for a single instance
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Http {
    /// Address the dispatch and capture-polling API listens on
    pub api_address: String,
    /// Address the capture client websocket broker listens on
    pub broker_address: String,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            api_address: String::from("0.0.0.0:5858"),
            broker_address: String::from("0.0.0.0:8123"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimit {
    /// Counter value at which a (guild, identity) pair stops being usable
    pub ceiling: i64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            ceiling: 7,
            window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Dispatch {
    /// Number of user modifications applied concurrently per request
    pub max_workers: usize,
    /// How long a capture client has to acknowledge receipt of a task
    #[serde(with = "humantime_serde")]
    pub capture_receipt_timeout: Duration,
    /// How long a capture client has to report the outcome of a received task
    #[serde(with = "humantime_serde")]
    pub capture_completion_timeout: Duration,
    /// How long a connect code is skipped after failing to complete a task
    #[serde(with = "humantime_serde")]
    pub capture_blacklist: Duration,
    /// Upper bound on a single member update made through a platform session
    #[serde(with = "humantime_serde")]
    pub member_update_timeout: Duration,
    /// Number of secondary tokens a guild may use, indexed by premium tier
    pub premium_limits: Vec<usize>,
}

impl Dispatch {
    /// Secondary token budget for the given premium tier; unknown tiers get none
    #[must_use]
    pub fn token_limit(&self, premium_tier: usize) -> usize {
        self.premium_limits.get(premium_tier).copied().unwrap_or(0)
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            max_workers: 8,
            capture_receipt_timeout: Duration::from_secs(1),
            capture_completion_timeout: Duration::from_secs(5),
            capture_blacklist: Duration::from_secs(5 * 60),
            member_update_timeout: Duration::from_secs(5),
            premium_limits: vec![0, 0, 1, 3, 10, 100],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Capture {
    /// Server-side wait of the task polling endpoint
    #[serde(with = "humantime_serde")]
    pub task_pop_timeout: Duration,
    /// Server-side wait of the event polling endpoint
    #[serde(with = "humantime_serde")]
    pub event_pop_timeout: Duration,
    /// Length of each blocking pop made by a websocket task forwarding loop
    #[serde(with = "humantime_serde")]
    pub forward_pop_timeout: Duration,
    /// TTL refreshed on a task or event queue whenever something is pushed to it
    #[serde(with = "humantime_serde")]
    pub queue_expiry: Duration,
    /// Inactivity after which a connect code stops counting as an active game
    #[serde(with = "humantime_serde")]
    pub active_game_window: Duration,
    #[serde(with = "humantime_serde")]
    pub room_code_expiry: Duration,
    /// How long a forwarded task is remembered for failing it on disconnect;
    /// past this its dispatcher has stopped waiting anyway
    #[serde(with = "humantime_serde")]
    pub outstanding_task_expiry: Duration,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            task_pop_timeout: Duration::from_secs(10),
            event_pop_timeout: Duration::from_secs(10),
            forward_pop_timeout: Duration::from_secs(1),
            queue_expiry: Duration::from_secs(15 * 60),
            active_game_window: Duration::from_secs(15 * 60),
            room_code_expiry: Duration::from_secs(15 * 60),
            outstanding_task_expiry: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Gateway {
    /// Whether to connect the primary bot to the gateway and ingest its events
    pub enabled: bool,
    /// Prefix a message must start with (besides a mention) to be treated as a command
    pub command_prefix: String,
    #[serde(with = "humantime_serde")]
    pub lock_duration: Duration,
    /// Extra attempts made when claiming a lock fails because of the store
    pub lock_retries: u32,
    #[serde(with = "humantime_serde")]
    pub lock_retry_delay: Duration,
    /// Server-side wait of the job polling endpoint
    #[serde(with = "humantime_serde")]
    pub job_pop_timeout: Duration,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            enabled: true,
            command_prefix: String::from(".au"),
            lock_duration: Duration::from_secs(3),
            lock_retries: 2,
            lock_retry_delay: Duration::from_millis(50),
            job_pop_timeout: Duration::from_secs(10),
        }
    }
}

const fn default_attempt_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_namespace() -> String {
    String::from("automuteus")
}

impl Configuration {
    /// Attempts to load the config from the file, called once at startup
    pub fn try_load(path: impl AsRef<str>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        // Use config to load the values and merge with the environment
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(path))
            .context(format!("Could not read in config file from {}", path))?
            // Add in settings from the environment (with a prefix of MUTE_BROKER)
            // Eg.. `MUTE_BROKER_SECRETS__DISCORD_TOKEN=X ./target/mute-broker`
            // would set the `secrets.discord_token` key
            .merge(config::Environment::with_prefix("MUTE_BROKER").separator("__"))
            .context("could not merge in values from the environment")?;
        let config = settings
            .try_into()
            .context("loading the Configuration struct from the merged config failed")?;
        Ok(config)
    }
}
