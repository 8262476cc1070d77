//! Counters and activity tracking kept in the store, and the status document built from them

use crate::dispatch::TierCounts;
use crate::keys::Keys;
use crate::store::Store;
use crate::validate::ConnectCode;
use serde::Serialize;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MUTE_DEAFEN_WORKER: &str = "mute_deafen_worker";
pub const MUTE_DEAFEN_CAPTURE: &str = "mute_deafen_capture";
pub const MUTE_DEAFEN_OFFICIAL: &str = "mute_deafen_official";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusIndex {
    pub version: String,
    pub commit: String,
    pub total_guilds: u64,
    pub active_games: u64,
    pub total_users: u64,
    pub total_games: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<usize>,
    pub requests_by_type: BTreeMap<&'static str, u64>,
}

pub struct Stats {
    store: Arc<dyn Store>,
    keys: Keys,
    active_game_window: Duration,
    logger: Logger,
}

pub fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |since| since.as_secs_f64())
}

impl Stats {
    pub fn new(store: Arc<dyn Store>, keys: Keys, active_game_window: Duration, logger: Logger) -> Self {
        Self {
            store,
            keys,
            active_game_window,
            logger,
        }
    }

    /// Adds the platform requests made by one dispatch to the running totals
    pub async fn record_dispatch(&self, counts: &TierCounts) {
        let tallies = [
            (MUTE_DEAFEN_WORKER, counts.worker),
            (MUTE_DEAFEN_CAPTURE, counts.capture),
            (MUTE_DEAFEN_OFFICIAL, counts.official),
        ];
        for (kind, count) in tallies {
            if count == 0 {
                continue;
            }
            let key = self.keys.requests_by_type(kind);
            let delta = i64::try_from(count).unwrap_or(i64::MAX);
            if let Err(err) = self.store.incr_by(&key, delta).await {
                slog::warn!(self.logger, "failed to record request"; "type" => kind, "error" => ?err);
            }
        }
    }

    /// Marks a connect code as having an active game right now
    pub async fn mark_active(&self, code: &ConnectCode) {
        if let Err(err) = self
            .store
            .sorted_set_add(&self.keys.active_games(), code.as_str(), unix_seconds())
            .await
        {
            slog::warn!(
                self.logger,
                "failed to mark game as active";
                "connect_code" => code.to_string(),
                "error" => ?err,
            );
        }
    }

    /// Connect codes with activity inside the window
    pub async fn active_games(&self) -> u64 {
        let now = unix_seconds();
        let since = now - self.active_game_window.as_secs_f64();
        match self
            .store
            .sorted_set_count(&self.keys.active_games(), since, now)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                slog::warn!(self.logger, "failed to count active games"; "error" => ?err);
                0
            }
        }
    }

    async fn read_text(&self, key: &str) -> String {
        match self.store.get(key).await {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                slog::warn!(self.logger, "failed to read status value"; "key" => key, "error" => ?err);
                String::new()
            }
        }
    }

    async fn read_count(&self, key: &str) -> u64 {
        self.read_text(key).await.parse().unwrap_or(0)
    }

    pub async fn index(&self, active_connections: Option<usize>) -> StatusIndex {
        let total_guilds = match self.store.set_len(&self.keys.total_guilds()).await {
            Ok(count) => count,
            Err(err) => {
                slog::warn!(self.logger, "failed to count guilds"; "error" => ?err);
                0
            }
        };

        let mut requests_by_type = BTreeMap::new();
        for kind in [MUTE_DEAFEN_WORKER, MUTE_DEAFEN_CAPTURE, MUTE_DEAFEN_OFFICIAL] {
            requests_by_type.insert(kind, self.read_count(&self.keys.requests_by_type(kind)).await);
        }

        StatusIndex {
            version: self.read_text(&self.keys.version()).await,
            commit: self.read_text(&self.keys.commit()).await,
            total_guilds,
            active_games: self.active_games().await,
            total_users: self.read_count(&self.keys.total_users()).await,
            total_games: self.read_count(&self.keys.total_games()).await,
            active_connections,
            requests_by_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutils::logger;

    #[tokio::test]
    async fn test_index_reflects_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = Keys::new("test");
        let stats = Stats::new(
            Arc::clone(&store),
            keys.clone(),
            Duration::from_secs(900),
            logger("test_index_reflects_store"),
        );
        store.set_add(&keys.total_guilds(), "1").await.unwrap();
        store.set_add(&keys.total_guilds(), "2").await.unwrap();
        store
            .set_with_expiry(&keys.version(), "7.0.0", Duration::from_secs(60))
            .await
            .unwrap();
        stats.mark_active(&ConnectCode::parse("ABCD1234").unwrap()).await;
        stats
            .record_dispatch(&TierCounts {
                worker: 2,
                capture: 1,
                official: 0,
                ..TierCounts::default()
            })
            .await;

        let index = stats.index(Some(3)).await;
        assert_eq!(index.version, "7.0.0");
        assert_eq!(index.total_guilds, 2);
        assert_eq!(index.active_games, 1);
        assert_eq!(index.active_connections, Some(3));
        assert_eq!(index.requests_by_type[MUTE_DEAFEN_WORKER], 2);
        assert_eq!(index.requests_by_type[MUTE_DEAFEN_CAPTURE], 1);
        assert_eq!(index.requests_by_type[MUTE_DEAFEN_OFFICIAL], 0);
    }

    #[tokio::test]
    async fn test_large_dispatch_is_recorded_in_full() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = Keys::new("test");
        let stats = Stats::new(
            Arc::clone(&store),
            keys.clone(),
            Duration::from_secs(900),
            logger("test_large_dispatch_is_recorded_in_full"),
        );
        let counts = TierCounts {
            worker: 5000,
            official: 3,
            ..TierCounts::default()
        };
        stats.record_dispatch(&counts).await;
        stats.record_dispatch(&counts).await;

        let index = stats.index(None).await;
        assert_eq!(index.requests_by_type[MUTE_DEAFEN_WORKER], 10000);
        assert_eq!(index.requests_by_type[MUTE_DEAFEN_OFFICIAL], 6);
        // Tiers that made no requests are not touched
        assert!(!store
            .exists(&keys.requests_by_type(MUTE_DEAFEN_CAPTURE))
            .await
            .unwrap());
    }
}
