//! Abstraction over the shared key-value store:
//! counters with TTLs, sets, FIFO lists with blocking pops,
//! sorted sets, and publish/subscribe channels.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store command failed: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("key {0:?} holds a value of another type")]
    WrongType(String),
    #[error("store connection closed")]
    Closed,
}

/// Operations the service needs from the shared store.
/// Every method is a single round trip; none of them hold local locks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Adds `delta` to an integer counter, creating it at zero.
    /// An existing TTL is preserved.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.incr_by(key, 1).await
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;
    /// Sets the key only when it does not exist; returns whether it was set
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;
    /// Deletes the key only when it still holds `value`; returns whether it was deleted
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Appends to the tail of a list
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Removes from the head of a list, waiting up to `timeout` for an element
    async fn list_pop_blocking(&self, key: &str, timeout: Duration)
        -> Result<Option<String>, StoreError>;
    /// Removes the first occurrence of `value`; returns whether one was removed
    async fn list_remove(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    /// Counts members with `min <= score <= max`
    async fn sorted_set_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;
    /// Removes members scored below `min`; returns how many were removed
    async fn sorted_set_remove_below(&self, key: &str, min: f64) -> Result<u64, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// Subscribes to a channel. Only messages published after this returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Live subscription to one channel; dropping it unsubscribes
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message; `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Subscription: Send);
static_assertions::assert_impl_all!(MemoryStore: Store);
static_assertions::assert_impl_all!(RedisStore: Store);
