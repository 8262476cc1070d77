//! Store implementation backed by a Redis server

use super::{Store, StoreError, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{Connection, MultiplexedConnection};
use redis::{Client, Script};
use std::sync::Mutex;
use std::time::Duration;

/// Compare-and-delete, so a lock is only released by the owner that claimed it
const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    client: Client,
    /// Shared connection for every non-blocking command
    connection: MultiplexedConnection,
    /// Dedicated connections for BLPOP, reused across the pops of each polling loop
    blocking: Parked<Connection>,
    delete_if_equals: Script,
}

/// Idle connections waiting to be handed to the next caller
struct Parked<C> {
    idle: Mutex<Vec<C>>,
}

impl<C> Parked<C> {
    const fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().expect("parked connections poisoned").pop()
    }

    fn put_back(&self, connection: C) {
        self.idle
            .lock()
            .expect("parked connections poisoned")
            .push(connection);
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            connection,
            blocking: Parked::new(),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    /// Sends a PING over the shared connection
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await?;
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut connection)
            .await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut connection).await?)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(count > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut connection)
            .await?)
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut connection)
            .await?)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        // BLPOP parks the whole connection, so it never shares the multiplexed one.
        // A pop that is cancelled or fails drops its connection instead of parking it,
        // since a late reply could still arrive on it.
        let mut connection = match self.blocking.take() {
            Some(connection) => connection,
            None => self.client.get_async_connection().await?,
        };
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut connection)
            .await?;
        self.blocking.put_back(connection);
        Ok(reply.map(|(_, value)| value))
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async(&mut connection)
            .await?;
        Ok(removed > 0)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut connection)
            .await?)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn sorted_set_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut connection)
            .await?)
    }

    async fn sorted_set_remove_below(&self, key: &str, min: f64) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", min))
            .query_async(&mut connection)
            .await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        // The connection lives inside the stream and closes when it is dropped
        let messages = pubsub
            .into_on_message()
            .filter_map(|message| async move { message.get_payload::<String>().ok() })
            .boxed();
        Ok(Subscription::new(channel, messages))
    }
}
