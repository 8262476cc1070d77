//! FIFO queues kept in the shared store:
//! tasks and capture events per connect code, and gateway messages for the whole fleet

use crate::capture::CaptureEvent;
use crate::ingest::GatewayMessage;
use crate::keys::Keys;
use crate::store::{Store, StoreError};
use crate::task::ModifyTask;
use crate::validate::ConnectCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode queue item: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of a blocking pop; an empty queue is not an error
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    TimedOut,
}

impl<T> Popped<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::TimedOut => None,
        }
    }
}

async fn pop_raw(
    store: &dyn Store,
    key: &str,
    timeout: Duration,
) -> Result<Popped<String>, StoreError> {
    Ok(match store.list_pop_blocking(key, timeout).await? {
        Some(item) => Popped::Item(item),
        None => Popped::TimedOut,
    })
}

/// Appends and refreshes the TTL of the whole queue
async fn push_expiring(
    store: &dyn Store,
    key: &str,
    item: &str,
    expiry: Duration,
) -> Result<(), StoreError> {
    store.list_push(key, item).await?;
    store.expire(key, expiry).await
}

/// Tasks waiting for the capture client behind a connect code
pub struct TaskQueue {
    store: Arc<dyn Store>,
    keys: Keys,
    expiry: Duration,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, keys: Keys, expiry: Duration) -> Self {
        Self {
            store,
            keys,
            expiry,
        }
    }

    /// Queues the task and returns the exact payload that was queued
    pub async fn push(&self, code: &ConnectCode, task: &ModifyTask) -> Result<String, QueueError> {
        let payload = task.to_json()?;
        push_expiring(&*self.store, &self.keys.task_queue(code), &payload, self.expiry).await?;
        Ok(payload)
    }

    /// Pops the raw payload of the oldest task; parsing is left to the consumer
    pub async fn pop_blocking(
        &self,
        code: &ConnectCode,
        timeout: Duration,
    ) -> Result<Popped<String>, StoreError> {
        pop_raw(&*self.store, &self.keys.task_queue(code), timeout).await
    }

    /// Withdraws a task nobody picked up; returns whether it was still queued
    pub async fn retract(&self, code: &ConnectCode, payload: &str) -> Result<bool, StoreError> {
        self.store
            .list_remove(&self.keys.task_queue(code), payload)
            .await
    }
}

/// Capture telemetry waiting for downstream consumers
pub struct EventQueue {
    store: Arc<dyn Store>,
    keys: Keys,
    expiry: Duration,
}

impl EventQueue {
    pub fn new(store: Arc<dyn Store>, keys: Keys, expiry: Duration) -> Self {
        Self {
            store,
            keys,
            expiry,
        }
    }

    pub async fn push(&self, code: &ConnectCode, event: &CaptureEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event)?;
        push_expiring(&*self.store, &self.keys.capture_events(code), &payload, self.expiry).await?;
        Ok(())
    }

    pub async fn pop_blocking(
        &self,
        code: &ConnectCode,
        timeout: Duration,
    ) -> Result<Popped<String>, StoreError> {
        pop_raw(&*self.store, &self.keys.capture_events(code), timeout).await
    }
}

/// Gateway events waiting for the bot's workers
pub struct GatewayQueue {
    store: Arc<dyn Store>,
    keys: Keys,
}

impl GatewayQueue {
    pub fn new(store: Arc<dyn Store>, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub async fn push(&self, message: &GatewayMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        self.store
            .list_push(&self.keys.gateway_messages(), &payload)
            .await?;
        Ok(())
    }

    pub async fn pop_blocking(&self, timeout: Duration) -> Result<Popped<String>, StoreError> {
        pop_raw(&*self.store, &self.keys.gateway_messages(), timeout).await
    }

    pub async fn len(&self) -> Result<u64, StoreError> {
        self.store.list_len(&self.keys.gateway_messages()).await
    }
}
