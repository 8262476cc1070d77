use crate::session::{hash_token, PatchParams, Session, SessionConnector};
use crate::store::{Store, StoreError, Subscription};
use async_trait::async_trait;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::{Format, Severity};
use sloggers::Build;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

lazy_static::lazy_static! {
    static ref LOGGER: slog::Logger = {
        let mut builder = TerminalLoggerBuilder::new();
        builder.level(Severity::Info);
        builder.destination(Destination::Stderr);
        builder.format(Format::Full);
        builder.build().unwrap()
    };
}

pub fn logger(test_name: &'static str) -> slog::Logger {
    LOGGER.new(slog::o!("test_name" => test_name))
}

/// Session that records every member update instead of calling the platform
pub struct FakeSession {
    guilds: Vec<u64>,
    updates: Mutex<Vec<(u64, u64, PatchParams)>>,
    failing: AtomicBool,
    closed: Arc<AtomicUsize>,
    discovery: Mutex<Option<mpsc::UnboundedSender<u64>>>,
}

impl FakeSession {
    pub fn new(guilds: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            guilds,
            updates: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: Arc::new(AtomicUsize::new(0)),
            discovery: Mutex::new(None),
        })
    }

    pub fn failing(guilds: Vec<u64>) -> Arc<Self> {
        let session = Self::new(guilds);
        session.failing.store(true, Ordering::SeqCst);
        session
    }

    pub fn updates(&self) -> Vec<(u64, u64, PatchParams)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn update_member(
        &self,
        guild_id: u64,
        user_id: u64,
        params: PatchParams,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("member update rejected");
        }
        self.updates.lock().unwrap().push((guild_id, user_id, params));
        Ok(())
    }

    async fn guild(&self, guild_id: u64) -> anyhow::Result<serde_json::Value> {
        if !self.guilds.contains(&guild_id) {
            anyhow::bail!("unknown guild {}", guild_id);
        }
        Ok(serde_json::json!({
            "id": guild_id.to_string(),
            "name": format!("guild {}", guild_id),
        }))
    }

    async fn guild_channels(&self, guild_id: u64) -> anyhow::Result<serde_json::Value> {
        self.guild(guild_id).await?;
        Ok(serde_json::json!([
            {"id": "1", "type": 0, "name": "general", "guild_id": guild_id.to_string()},
            {"id": "2", "type": 2, "name": "Among Us", "guild_id": guild_id.to_string()},
        ]))
    }

    async fn guild_member(&self, guild_id: u64, user_id: u64) -> anyhow::Result<serde_json::Value> {
        self.guild(guild_id).await?;
        Ok(serde_json::json!({
            "user": {"id": user_id.to_string()},
            "mute": false,
            "deaf": false,
        }))
    }

    fn guilds(&self) -> Vec<u64> {
        self.guilds.clone()
    }

    async fn close(&self) {
        self.discovery.lock().unwrap().take();
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out `FakeSession`s that all report the same guilds
pub struct FakeConnector {
    guilds: Vec<u64>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail_next: AtomicBool,
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn with_guilds(guilds: Vec<u64>) -> Self {
        Self {
            guilds,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_next: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session(&self, hash: &str) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().get(hash).cloned()
    }

    /// Simulates the platform telling an open session about another guild
    pub fn discover(&self, hash: &str, guild_id: u64) {
        let session = self.session(hash).expect("no session opened for hash");
        let discovery = session.discovery.lock().unwrap();
        discovery
            .as_ref()
            .expect("session closed")
            .send(guild_id)
            .unwrap();
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(
        &self,
        token: &str,
        guild_discovery: mpsc::UnboundedSender<u64>,
    ) -> anyhow::Result<Arc<dyn Session>> {
        tokio::task::yield_now().await;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("invalid token");
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(FakeSession {
            guilds: self.guilds.clone(),
            updates: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: Arc::clone(&self.closed),
            discovery: Mutex::new(Some(guild_discovery)),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(hash_token(token), Arc::clone(&session));
        Ok(session)
    }
}

/// Store whose every command fails, as if the server were unreachable
pub struct FailingStore;

#[async_trait]
impl Store for FailingStore {
    async fn incr_by(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
        Err(StoreError::Closed)
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_with_expiry(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Closed)
    }
    async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Closed)
    }
    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_add(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_members(&self, _key: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Closed)
    }
    async fn set_len(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Closed)
    }
    async fn list_push(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn list_pop_blocking(&self, _: &str, _: Duration) -> Result<Option<String>, StoreError> {
        Err(StoreError::Closed)
    }
    async fn list_remove(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Closed)
    }
    async fn list_len(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Closed)
    }
    async fn sorted_set_add(&self, _: &str, _: &str, _: f64) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn sorted_set_count(&self, _: &str, _: f64, _: f64) -> Result<u64, StoreError> {
        Err(StoreError::Closed)
    }
    async fn sorted_set_remove_below(&self, _: &str, _: f64) -> Result<u64, StoreError> {
        Err(StoreError::Closed)
    }
    async fn publish(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    async fn subscribe(&self, _channel: &str) -> Result<Subscription, StoreError> {
        Err(StoreError::Closed)
    }
}
