use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use serde::Deserialize;
use std::time::Duration;

/// Controls an exponential backoff that can be loaded from a config file.
/// Every field is optional in the file and falls back to the values
/// used when connecting to the store and the chat platform at startup.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Total time spent retrying before giving up
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            duration: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn build(&self) -> ExponentialBackoff {
        self.into()
    }
}

impl From<&Backoff> for ExponentialBackoff {
    fn from(config: &Backoff) -> Self {
        let mut eb = Self {
            current_interval: config.initial_interval,
            initial_interval: config.initial_interval,
            multiplier: config.multiplier,
            max_interval: config.max_interval,
            max_elapsed_time: Some(config.duration),
            ..Self::default()
        };
        eb.reset();
        eb
    }
}
