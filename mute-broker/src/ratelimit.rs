//! Per-(guild, identity) usage windows kept in the shared store,
//! so that every instance of the service draws from the same budget

use crate::config;
use crate::keys::Keys;
use crate::store::Store;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// Identity whose use in a guild is being counted:
/// either a credential hash or a capture client's connect code
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub guild_id: u64,
    pub subject: String,
}

impl RateLimitKey {
    pub fn new(guild_id: u64, subject: impl Into<String>) -> Self {
        Self {
            guild_id,
            subject: subject.into(),
        }
    }
}

pub struct RateLimitLedger {
    store: Arc<dyn Store>,
    keys: Keys,
    ceiling: i64,
    window: Duration,
    logger: Logger,
}

impl RateLimitLedger {
    pub fn new(store: Arc<dyn Store>, keys: Keys, config: &config::RateLimit, logger: Logger) -> Self {
        Self {
            store,
            keys,
            ceiling: config.ceiling,
            window: config.window,
            logger,
        }
    }

    /// Counts one attempted use and reports whether it is within budget.
    /// The window is only extended by uses that are allowed,
    /// so a throttled or blacklisted key lapses on its own.
    /// Any store failure denies the use.
    pub async fn allow(&self, key: &RateLimitKey) -> bool {
        let store_key = self.keys.rate_limit(key.guild_id, &key.subject);
        let count = match self.store.incr(&store_key).await {
            Ok(count) => count,
            Err(err) => {
                slog::error!(
                    self.logger,
                    "failed to increment rate limit counter; denying use";
                    "guild_id" => key.guild_id,
                    "subject" => &key.subject,
                    "error" => ?err,
                );
                return false;
            }
        };

        let allowed = count < self.ceiling;
        // A fresh counter always gets a window, even when the ceiling denies it
        if allowed || count == 1 {
            if let Err(err) = self.store.expire(&store_key, self.window).await {
                slog::error!(
                    self.logger,
                    "failed to set rate limit window; denying use";
                    "guild_id" => key.guild_id,
                    "subject" => &key.subject,
                    "error" => ?err,
                );
                return false;
            }
        }

        if !allowed {
            slog::debug!(
                self.logger,
                "rate limit reached";
                "guild_id" => key.guild_id,
                "subject" => &key.subject,
                "count" => count,
            );
        }
        allowed
    }

    /// Exhausts the key's budget for `duration`
    pub async fn blacklist(&self, key: &RateLimitKey, duration: Duration) {
        let store_key = self.keys.rate_limit(key.guild_id, &key.subject);
        match self
            .store
            .set_with_expiry(&store_key, &self.ceiling.to_string(), duration)
            .await
        {
            Ok(_) => slog::info!(
                self.logger,
                "blacklisted identity in guild";
                "guild_id" => key.guild_id,
                "subject" => &key.subject,
                "duration" => ?duration,
            ),
            Err(err) => slog::error!(
                self.logger,
                "failed to blacklist identity in guild";
                "guild_id" => key.guild_id,
                "subject" => &key.subject,
                "error" => ?err,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutils::{logger, FailingStore};

    fn ledger(store: Arc<dyn Store>, test_name: &'static str) -> RateLimitLedger {
        RateLimitLedger::new(
            store,
            Keys::new("test"),
            &config::RateLimit {
                ceiling: 7,
                window: Duration::from_secs(5),
            },
            logger(test_name),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_is_exclusive() {
        let ledger = ledger(Arc::new(MemoryStore::new()), "test_ceiling_is_exclusive");
        let key = RateLimitKey::new(100, "hash");
        for call in 1..7 {
            assert!(ledger.allow(&key).await, "call {} should be allowed", call);
        }
        assert!(!ledger.allow(&key).await);
        assert!(!ledger.allow(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_lapses() {
        let ledger = ledger(Arc::new(MemoryStore::new()), "test_window_lapses");
        let key = RateLimitKey::new(100, "hash");
        for _ in 0..10 {
            ledger.allow(&key).await;
        }
        assert!(!ledger.allow(&key).await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ledger.allow(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let ledger = ledger(Arc::new(MemoryStore::new()), "test_keys_are_independent");
        let busy = RateLimitKey::new(100, "hash");
        for _ in 0..7 {
            ledger.allow(&busy).await;
        }
        assert!(!ledger.allow(&busy).await);
        assert!(ledger.allow(&RateLimitKey::new(101, "hash")).await);
        assert!(ledger.allow(&RateLimitKey::new(100, "other")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_expires() {
        let ledger = ledger(Arc::new(MemoryStore::new()), "test_blacklist_expires");
        let key = RateLimitKey::new(100, "ABCD1234");
        ledger.blacklist(&key, Duration::from_secs(300)).await;
        assert!(!ledger.allow(&key).await);
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!ledger.allow(&key).await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ledger.allow(&key).await);
    }

    #[tokio::test]
    async fn test_store_failure_denies() {
        let ledger = ledger(Arc::new(FailingStore), "test_store_failure_denies");
        assert!(!ledger.allow(&RateLimitKey::new(100, "hash")).await);
    }
}
