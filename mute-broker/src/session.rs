//! Pool of live platform sessions, one per registered bot credential,
//! and the lookup of which credentials can act in which guild

use crate::keys::Keys;
use crate::ratelimit::{RateLimitKey, RateLimitLedger};
use crate::store::Store;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use slog::Logger;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Mute/deafen state applied to a guild member
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PatchParams {
    pub mute: bool,
    pub deaf: bool,
}

/// A live connection to the chat platform under one credential
#[async_trait]
pub trait Session: Send + Sync {
    /// Applies a mute/deafen change to a member of a guild
    async fn update_member(&self, guild_id: u64, user_id: u64, params: PatchParams)
        -> anyhow::Result<()>;
    /// Looks a guild up through the platform, returning it in the platform's JSON form
    async fn guild(&self, guild_id: u64) -> anyhow::Result<serde_json::Value>;
    async fn guild_channels(&self, guild_id: u64) -> anyhow::Result<serde_json::Value>;
    async fn guild_member(&self, guild_id: u64, user_id: u64) -> anyhow::Result<serde_json::Value>;
    /// Guilds the credential is currently known to be a member of
    fn guilds(&self) -> Vec<u64>;
    async fn close(&self);
}

/// Opens sessions for raw tokens.
/// Guilds the session joins or discovers after opening are sent on `guild_discovery`.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(
        &self,
        token: &str,
        guild_discovery: mpsc::UnboundedSender<u64>,
    ) -> anyhow::Result<Arc<dyn Session>>;
}

/// Hex SHA-256 of a token; the only form in which credentials are stored or logged
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered { hash: String, guilds: usize },
    AlreadyRegistered { hash: String },
}

pub struct SessionPool {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    /// Hashes whose session is currently being opened
    pending: Mutex<HashSet<String>>,
    connector: Arc<dyn SessionConnector>,
    store: Arc<dyn Store>,
    ledger: Arc<RateLimitLedger>,
    keys: Keys,
    logger: Logger,
}

impl SessionPool {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        store: Arc<dyn Store>,
        ledger: Arc<RateLimitLedger>,
        keys: Keys,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            connector,
            store,
            ledger,
            keys,
            logger,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_session(&self, hash: &str) -> Option<Arc<dyn Session>> {
        self.sessions
            .read()
            .expect("session pool poisoned")
            .get(hash)
            .cloned()
    }

    /// Credential hashes associated with a guild, in a stable order.
    /// A store failure yields no candidates.
    pub async fn sessions_for_guild(&self, guild_id: u64) -> Vec<String> {
        match self.store.set_members(&self.keys.guild_tokens(guild_id)).await {
            Ok(mut hashes) => {
                hashes.sort();
                hashes
            }
            Err(err) => {
                slog::error!(
                    self.logger,
                    "failed to fetch credentials for guild";
                    "guild_id" => guild_id,
                    "error" => ?err,
                );
                Vec::new()
            }
        }
    }

    /// Picks the first of at most `limit` candidates that is within its rate budget
    /// and still has a live session. Candidates without a session are pruned from the guild.
    pub async fn pick(
        &self,
        guild_id: u64,
        candidates: &[String],
        limit: usize,
    ) -> Option<(Arc<dyn Session>, String)> {
        for hash in candidates.iter().take(limit) {
            if !self
                .ledger
                .allow(&RateLimitKey::new(guild_id, hash.as_str()))
                .await
            {
                slog::debug!(
                    self.logger,
                    "secondary credential is rate limited in guild";
                    "guild_id" => guild_id,
                    "hashed_token" => hash,
                );
                continue;
            }

            if let Some(session) = self.live_session(hash) {
                return Some((session, hash.clone()));
            }

            slog::warn!(
                self.logger,
                "credential associated with guild has no live session; removing";
                "guild_id" => guild_id,
                "hashed_token" => hash,
            );
            if let Err(err) = self
                .store
                .set_remove(&self.keys.guild_tokens(guild_id), hash)
                .await
            {
                slog::error!(
                    self.logger,
                    "failed to remove stale credential from guild";
                    "guild_id" => guild_id,
                    "hashed_token" => hash,
                    "error" => ?err,
                );
            }
        }
        None
    }

    /// Opens a session for the token and associates it with its guilds.
    /// Registering a token that is live or currently being registered does nothing.
    pub async fn register(self: &Arc<Self>, token: &str) -> anyhow::Result<Registration> {
        let hash = hash_token(token);
        {
            let sessions = self.sessions.read().expect("session pool poisoned");
            let mut pending = self.pending.lock().expect("pending registrations poisoned");
            if sessions.contains_key(&hash) || !pending.insert(hash.clone()) {
                return Ok(Registration::AlreadyRegistered { hash });
            }
        }

        let logger = self.logger.new(slog::o!("hashed_token" => hash.clone()));
        let (guilds_tx, guilds_rx) = mpsc::unbounded_channel();
        let opened = self.connector.open(token, guilds_tx).await;
        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                self.pending
                    .lock()
                    .expect("pending registrations poisoned")
                    .remove(&hash);
                slog::warn!(logger, "failed to open session for credential"; "error" => ?err);
                return Err(err);
            }
        };

        let guilds = session.guilds();
        for guild_id in &guilds {
            self.associate(&hash, *guild_id, &logger).await;
        }

        {
            let mut sessions = self.sessions.write().expect("session pool poisoned");
            sessions.insert(hash.clone(), session);
            self.pending
                .lock()
                .expect("pending registrations poisoned")
                .remove(&hash);
        }
        tokio::spawn(Arc::clone(self).watch_guilds(hash.clone(), guilds_rx, logger.clone()));

        slog::info!(logger, "registered credential"; "guild_count" => guilds.len());
        Ok(Registration::Registered {
            hash,
            guilds: guilds.len(),
        })
    }

    /// Records guilds reported after the session opened, until the session goes away
    async fn watch_guilds(
        self: Arc<Self>,
        hash: String,
        mut guilds_rx: mpsc::UnboundedReceiver<u64>,
        logger: Logger,
    ) {
        while let Some(guild_id) = guilds_rx.recv().await {
            if self.live_session(&hash).is_none() {
                break;
            }
            self.associate(&hash, guild_id, &logger).await;
        }
        slog::debug!(logger, "stopped watching credential for new guilds");
    }

    async fn associate(&self, hash: &str, guild_id: u64, logger: &Logger) {
        if let Err(err) = self
            .store
            .set_add(&self.keys.guild_tokens(guild_id), hash)
            .await
        {
            slog::error!(
                logger,
                "failed to associate credential with guild";
                "guild_id" => guild_id,
                "error" => ?err,
            );
        }
    }

    /// Closes every live session and empties the pool
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<dyn Session>)> = self
            .sessions
            .write()
            .expect("session pool poisoned")
            .drain()
            .collect();
        for (hash, session) in drained {
            session.close().await;
            slog::info!(self.logger, "closed session"; "hashed_token" => hash);
        }
    }
}
