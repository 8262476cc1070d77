//! Filters events from the primary bot's gateway, deduplicates them across shard workers,
//! and queues them for the bot's command and voice handlers

use crate::keys::Keys;
use crate::lock::SnowflakeLock;
use crate::queue::GatewayQueue;
use crate::stats::unix_seconds;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayMessageKind {
    GuildCreate,
    GuildDelete,
    VoiceStateUpdate,
    MessageCreate,
    MessageReactionAdd,
}

impl GatewayMessageKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::GuildCreate => "GuildCreate",
            Self::GuildDelete => "GuildDelete",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::MessageCreate => "MessageCreate",
            Self::MessageReactionAdd => "MessageReactionAdd",
        }
    }

    /// Whether the dedup claim is given back once the event is queued.
    /// Deletions and reactions keep it until it lapses.
    pub const fn releases_claim(self) -> bool {
        !matches!(self, Self::GuildDelete | Self::MessageReactionAdd)
    }
}

/// Message placed on the gateway queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    #[serde(rename = "type")]
    pub kind: GatewayMessageKind,
    pub data: serde_json::Value,
    /// Text of a command message with its prefix or mention removed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command: Option<String>,
}

/// Gateway event reduced to what filtering and deduplication need,
/// along with its full serialized form
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayEvent {
    pub kind: GatewayMessageKind,
    /// Unique identity of the event, shared by every shard worker that sees it
    pub event_key: String,
    pub guild_id: Option<u64>,
    /// User that caused the event, when it has one
    pub user_id: Option<u64>,
    /// Message text, for message events
    pub content: Option<String>,
    pub data: serde_json::Value,
}

pub struct Ingestor {
    lock: SnowflakeLock,
    queue: Arc<GatewayQueue>,
    store: Arc<dyn Store>,
    keys: Keys,
    command_prefix: String,
    /// Games without activity for this long no longer let voice events through
    active_game_window: Duration,
    /// Zero until the gateway reports who the bot is
    bot_user_id: AtomicU64,
    logger: Logger,
}

impl Ingestor {
    pub fn new(
        lock: SnowflakeLock,
        queue: Arc<GatewayQueue>,
        store: Arc<dyn Store>,
        keys: Keys,
        command_prefix: String,
        active_game_window: Duration,
        logger: Logger,
    ) -> Self {
        Self {
            lock,
            queue,
            store,
            keys,
            command_prefix,
            active_game_window,
            bot_user_id: AtomicU64::new(0),
            logger,
        }
    }

    pub fn set_bot_user(&self, user_id: u64) {
        self.bot_user_id.store(user_id, Ordering::Relaxed);
    }

    /// Returns the message text after the command prefix or a mention of the bot
    fn strip_command<'a>(&self, content: &'a str) -> Option<&'a str> {
        let content = content.trim_start();
        if !self.command_prefix.is_empty() {
            if let Some(rest) = content.strip_prefix(&self.command_prefix) {
                return Some(rest.trim());
            }
        }
        match self.bot_user_id.load(Ordering::Relaxed) {
            0 => None,
            bot => [format!("<@{}>", bot), format!("<@!{}>", bot)]
                .iter()
                .find_map(|mention| content.strip_prefix(mention.as_str()))
                .map(str::trim),
        }
    }

    async fn is_softbanned(&self, user_id: u64) -> bool {
        match self.store.exists(&self.keys.softban(user_id)).await {
            Ok(banned) => banned,
            Err(err) => {
                slog::warn!(
                    self.logger,
                    "failed to check softban; treating user as not banned";
                    "user_id" => user_id,
                    "error" => ?err,
                );
                false
            }
        }
    }

    /// Whether any game in the guild has been active inside the window.
    /// Stale games are dropped from the guild's set along the way.
    async fn has_active_game(&self, guild_id: u64, logger: &Logger) -> bool {
        let key = self.keys.guild_active_games(guild_id);
        let since = unix_seconds() - self.active_game_window.as_secs_f64();
        if let Err(err) = self.store.sorted_set_remove_below(&key, since).await {
            slog::warn!(logger, "failed to purge stale guild games"; "error" => ?err);
        }
        match self.store.sorted_set_count(&key, since, f64::MAX).await {
            Ok(count) => count > 0,
            Err(err) => {
                slog::warn!(logger, "failed to check for active games; dropping voice event"; "error" => ?err);
                false
            }
        }
    }

    /// Queues the event if it passes the filters and no other worker has claimed it.
    /// Returns whether it was queued.
    pub async fn handle(&self, event: GatewayEvent) -> bool {
        let logger = self.logger.new(slog::o!(
            "kind" => event.kind.name(),
            "event_key" => event.event_key.clone(),
        ));

        let bot = self.bot_user_id.load(Ordering::Relaxed);
        if bot != 0 && event.user_id == Some(bot) {
            return false;
        }

        let mut command = None;
        if event.kind == GatewayMessageKind::MessageCreate {
            match event.content.as_deref().and_then(|c| self.strip_command(c)) {
                Some(stripped) => command = Some(stripped.to_owned()),
                None => return false,
            }
        }

        if event.kind == GatewayMessageKind::VoiceStateUpdate {
            let active = match event.guild_id {
                Some(guild_id) => self.has_active_game(guild_id, &logger).await,
                None => false,
            };
            if !active {
                return false;
            }
        }

        if matches!(
            event.kind,
            GatewayMessageKind::MessageCreate | GatewayMessageKind::MessageReactionAdd
        ) {
            if let Some(user_id) = event.user_id {
                if self.is_softbanned(user_id).await {
                    slog::debug!(logger, "ignoring event from softbanned user"; "user_id" => user_id);
                    return false;
                }
            }
        }

        let guard = match self.lock.try_claim(&event.event_key).await {
            Some(guard) => guard,
            None => {
                slog::debug!(logger, "event already claimed by another worker");
                return false;
            }
        };

        self.track_guild(&event, &logger).await;

        let message = GatewayMessage {
            kind: event.kind,
            data: event.data,
            command,
        };
        let queued = match self.queue.push(&message).await {
            Ok(_) => true,
            Err(err) => {
                slog::error!(logger, "failed to queue gateway message"; "error" => ?err);
                false
            }
        };

        if event.kind.releases_claim() {
            guard.release().await;
        } else {
            guard.hold();
        }
        queued
    }

    /// Keeps the set behind the guild total in step with joins and leaves
    async fn track_guild(&self, event: &GatewayEvent, logger: &Logger) {
        let guild_id = match event.guild_id {
            Some(guild_id) => guild_id.to_string(),
            None => return,
        };
        let key = self.keys.total_guilds();
        let result = match event.kind {
            GatewayMessageKind::GuildCreate => self.store.set_add(&key, &guild_id).await,
            GatewayMessageKind::GuildDelete => self.store.set_remove(&key, &guild_id).await,
            _ => return,
        };
        if let Err(err) = result {
            slog::warn!(logger, "failed to update guild total"; "error" => ?err);
        }
    }
}
