//! Distributed lock keyed by a gateway event's identity,
//! so that an event delivered to several shard workers is only handled once

use crate::config;
use crate::keys::Keys;
use crate::store::Store;
use rand::distributions::Alphanumeric;
use rand::Rng;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

pub struct SnowflakeLock {
    store: Arc<dyn Store>,
    keys: Keys,
    ttl: Duration,
    retries: u32,
    retry_delay: Duration,
    logger: Logger,
}

/// Claim on one event. Dropping the guard without releasing it leaves the claim to lapse.
#[must_use]
pub struct SnowflakeGuard {
    store: Arc<dyn Store>,
    key: String,
    owner: String,
    logger: Logger,
}

impl SnowflakeLock {
    pub fn new(store: Arc<dyn Store>, keys: Keys, config: &config::Gateway, logger: Logger) -> Self {
        Self {
            store,
            keys,
            ttl: config.lock_duration,
            retries: config.lock_retries,
            retry_delay: config.lock_retry_delay,
            logger,
        }
    }

    /// Claims the event for this worker.
    /// Returns `None` when another worker holds it or the store stays unreachable.
    pub async fn try_claim(&self, event_key: &str) -> Option<SnowflakeGuard> {
        let key = self.keys.snowflake_lock(event_key);
        let owner: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let mut attempt = 0;
        loop {
            match self.store.set_if_absent(&key, &owner, self.ttl).await {
                Ok(true) => {
                    return Some(SnowflakeGuard {
                        store: Arc::clone(&self.store),
                        key,
                        owner,
                        logger: self.logger.clone(),
                    })
                }
                Ok(false) => return None,
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    slog::debug!(
                        self.logger,
                        "failed to claim snowflake lock; retrying";
                        "event_key" => event_key,
                        "attempt" => attempt,
                        "error" => ?err,
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    slog::warn!(
                        self.logger,
                        "failed to claim snowflake lock; dropping event";
                        "event_key" => event_key,
                        "error" => ?err,
                    );
                    return None;
                }
            }
        }
    }
}

impl SnowflakeGuard {
    /// Gives the claim up early so the key can be reused
    pub async fn release(self) {
        match self.store.delete_if_equals(&self.key, &self.owner).await {
            Ok(true) => {}
            Ok(false) => slog::debug!(
                self.logger,
                "snowflake lock lapsed before release";
                "key" => &self.key,
            ),
            Err(err) => slog::warn!(
                self.logger,
                "failed to release snowflake lock";
                "key" => &self.key,
                "error" => ?err,
            ),
        }
    }

    /// Keeps the claim until its TTL lapses
    pub fn hold(self) {}
}
