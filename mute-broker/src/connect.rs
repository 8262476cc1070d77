//! Contains utility functions that connect to external services,
//! used during service initialization

use crate::config::{Configuration, StoreBackend};
use crate::store::{MemoryStore, RedisStore, Store, StoreError};
use crate::timeout::TimeoutOr;
use anyhow::Context;
use slog::Logger;
use std::sync::Arc;

/// Connects to the configured store
/// and pings it to ensure that the connection is live.
pub async fn to_store(config: &Configuration, logger: &Logger) -> anyhow::Result<Arc<dyn Store>> {
    let url = match &config.services.store {
        StoreBackend::Memory => {
            slog::warn!(logger, "using the in-memory store; state is not shared between instances");
            return Ok(Arc::new(MemoryStore::new()));
        }
        StoreBackend::Redis { url } => url,
    };

    let initialization_backoff = config.initialization_backoff.build();
    let timeout = config.initialization_attempt_timeout;
    let connect_and_ping = || async {
        let attempt = async {
            let store = RedisStore::connect(url).await?;
            store.ping().await?;
            Ok::<_, StoreError>(store)
        };
        match crate::timeout::timeout(timeout, attempt).await {
            Ok(store) => Ok(store),
            Err(err) => {
                let err: TimeoutOr<anyhow::Error> = match err {
                    TimeoutOr::Timeout(timeout) => {
                        slog::warn!(
                            logger,
                            "connecting to store timed out";
                            "timeout" => ?timeout,
                        );
                        TimeoutOr::Timeout(timeout)
                    }
                    TimeoutOr::Other(inner_err) => {
                        slog::warn!(
                            logger,
                            "connecting to store failed";
                            "error" => ?inner_err,
                        );
                        TimeoutOr::Other(anyhow::anyhow!(
                            "connecting to store failed: {:?}",
                            inner_err
                        ))
                    }
                };
                Err(backoff::Error::Transient(err))
            }
        }
    };

    let store = backoff::future::retry(initialization_backoff, connect_and_ping)
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))
        .context("could not ping store to verify reachability after retrying")?;

    slog::info!(logger, "connected to store");
    Ok(Arc::new(store))
}
