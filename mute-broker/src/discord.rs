//! Chat platform adaptors: sessions for bot credentials and the primary bot's gateway

use crate::ingest::{GatewayEvent, GatewayMessageKind, Ingestor};
use crate::session::{PatchParams, Session, SessionConnector};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use slog::Logger;
use std::collections::HashSet;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};
use twilight_gateway::cluster::{Cluster, Events as ClusterEvents};
use twilight_gateway::{Event, Intents, Shard};
use twilight_http::response::Response;
use twilight_http::Client;
use twilight_model::channel::ReactionType;
use twilight_model::id::{GuildId, UserId};

/// Session driven through the platform's HTTP API.
/// Secondary credentials also keep a shard open to learn about guilds they join.
pub struct TwilightSession {
    http: Client,
    shard: Option<Shard>,
    guilds: Arc<Mutex<HashSet<u64>>>,
}

fn to_guild_id(id: u64) -> anyhow::Result<GuildId> {
    Ok(GuildId(NonZeroU64::new(id).context("guild id cannot be zero")?))
}

fn to_user_id(id: u64) -> anyhow::Result<UserId> {
    Ok(UserId(NonZeroU64::new(id).context("user id cannot be zero")?))
}

/// Passes a lookup's body through untouched instead of round-tripping it through the model
async fn json_body<T>(response: Response<T>) -> anyhow::Result<serde_json::Value> {
    let bytes = response
        .bytes()
        .await
        .context("could not read response body")?;
    serde_json::from_slice(&bytes).context("could not decode response body")
}

impl TwilightSession {
    /// Session for the primary bot, whose gateway connection is handled by the cluster
    pub fn primary(token: &str) -> Self {
        Self {
            http: Client::new(token.to_owned()),
            shard: None,
            guilds: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Checks that the token is accepted and returns the id of the user it belongs to
    pub async fn verify(&self) -> anyhow::Result<u64> {
        let user = self
            .http
            .current_user()
            .exec()
            .await
            .context("could not fetch current user")?
            .model()
            .await
            .context("could not decode current user")?;
        Ok(user.id.0.get())
    }
}

#[async_trait]
impl Session for TwilightSession {
    async fn update_member(
        &self,
        guild_id: u64,
        user_id: u64,
        params: PatchParams,
    ) -> anyhow::Result<()> {
        self.http
            .update_guild_member(to_guild_id(guild_id)?, to_user_id(user_id)?)
            .mute(params.mute)
            .deaf(params.deaf)
            .exec()
            .await
            .context("member update request failed")?;
        Ok(())
    }

    async fn guild(&self, id: u64) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .guild(to_guild_id(id)?)
            .exec()
            .await
            .context("guild request failed")?;
        json_body(response).await
    }

    async fn guild_channels(&self, id: u64) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .guild_channels(to_guild_id(id)?)
            .exec()
            .await
            .context("guild channels request failed")?;
        json_body(response).await
    }

    async fn guild_member(&self, guild: u64, user: u64) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .guild_member(to_guild_id(guild)?, to_user_id(user)?)
            .exec()
            .await
            .context("guild member request failed")?;
        json_body(response).await
    }

    fn guilds(&self) -> Vec<u64> {
        self.guilds
            .lock()
            .expect("session guilds poisoned")
            .iter()
            .copied()
            .collect()
    }

    async fn close(&self) {
        if let Some(shard) = &self.shard {
            shard.shutdown();
        }
    }
}

pub struct TwilightConnector {
    logger: Logger,
}

impl TwilightConnector {
    pub const fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl SessionConnector for TwilightConnector {
    async fn open(
        &self,
        token: &str,
        guild_discovery: tokio::sync::mpsc::UnboundedSender<u64>,
    ) -> anyhow::Result<Arc<dyn Session>> {
        let http = Client::new(token.to_owned());
        // Listing guilds doubles as a check that the token is valid
        let current = http
            .current_user_guilds()
            .exec()
            .await
            .context("could not list guilds of credential")?
            .models()
            .await
            .context("could not decode guilds of credential")?;
        let guilds: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(
            current.iter().map(|guild| guild.id.0.get()).collect(),
        ));

        let (shard, mut events) = Shard::new(token.to_owned(), Intents::GUILDS);
        shard.start().await.context("could not start shard for credential")?;

        let known = Arc::clone(&guilds);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Event::GuildCreate(guild) = event {
                    let guild_id = guild.id.0.get();
                    let is_new = known
                        .lock()
                        .expect("session guilds poisoned")
                        .insert(guild_id);
                    if is_new && guild_discovery.send(guild_id).is_err() {
                        break;
                    }
                }
            }
            slog::debug!(logger, "secondary shard event stream ended");
        });

        Ok(Arc::new(TwilightSession {
            http,
            shard: Some(shard),
            guilds,
        }))
    }
}

/// Connects the primary bot's shards
pub async fn connect_cluster(token: &str) -> anyhow::Result<(Arc<Cluster>, ClusterEvents)> {
    let intents = Intents::GUILDS
        | Intents::GUILD_VOICE_STATES
        | Intents::GUILD_MESSAGES
        | Intents::GUILD_MESSAGE_REACTIONS;
    let (cluster, events) = Cluster::new(token.to_owned(), intents)
        .await
        .context("could not create gateway cluster")?;
    let cluster = Arc::new(cluster);
    let starting = Arc::clone(&cluster);
    tokio::spawn(async move { starting.up().await });
    Ok((cluster, events))
}

/// Feeds every gateway event through the ingestor until the cluster shuts down
pub async fn ingest_events(mut events: ClusterEvents, ingestor: Arc<Ingestor>, logger: Logger) {
    while let Some((shard_id, event)) = events.next().await {
        if let Event::Ready(ready) = &event {
            ingestor.set_bot_user(ready.user.id.0.get());
            slog::info!(logger, "shard ready"; "shard_id" => shard_id);
            continue;
        }
        if let Some(event) = to_gateway_event(&event) {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move {
                ingestor.handle(event).await;
            });
        }
    }
    slog::info!(logger, "gateway event stream ended");
}

/// Reduces the events the bot cares about to their identity and serialized form
fn to_gateway_event(event: &Event) -> Option<GatewayEvent> {
    let gateway_event = match event {
        Event::GuildCreate(guild) => GatewayEvent {
            kind: GatewayMessageKind::GuildCreate,
            event_key: format!("{}_create", guild.id.0),
            guild_id: Some(guild.id.0.get()),
            user_id: None,
            content: None,
            data: serde_json::to_value(guild).ok()?,
        },
        Event::GuildDelete(guild) => GatewayEvent {
            kind: GatewayMessageKind::GuildDelete,
            event_key: format!("{}_delete", guild.id.0),
            guild_id: Some(guild.id.0.get()),
            user_id: None,
            content: None,
            data: serde_json::to_value(guild).ok()?,
        },
        Event::VoiceStateUpdate(update) => {
            let state = &update.0;
            let guild_id = state.guild_id.map_or(0, |id| id.0.get());
            let channel_id = state.channel_id.map_or(0, |id| id.0.get());
            GatewayEvent {
                kind: GatewayMessageKind::VoiceStateUpdate,
                event_key: format!(
                    "{}{}{}{}",
                    guild_id,
                    channel_id,
                    state.user_id.0,
                    state.session_id
                ),
                guild_id: state.guild_id.map(|id| id.0.get()),
                user_id: Some(state.user_id.0.get()),
                content: None,
                data: serde_json::to_value(update).ok()?,
            }
        }
        Event::MessageCreate(message) => GatewayEvent {
            kind: GatewayMessageKind::MessageCreate,
            event_key: message.id.0.to_string(),
            guild_id: message.guild_id.map(|id| id.0.get()),
            user_id: Some(message.author.id.0.get()),
            content: Some(message.content.clone()),
            data: serde_json::to_value(message).ok()?,
        },
        Event::ReactionAdd(reaction) => {
            let emoji = match &reaction.emoji {
                ReactionType::Custom { id, .. } => id.0.to_string(),
                ReactionType::Unicode { name } => name.clone(),
            };
            GatewayEvent {
                kind: GatewayMessageKind::MessageReactionAdd,
                event_key: format!("{}{}{}", reaction.message_id.0, emoji, reaction.user_id.0),
                guild_id: reaction.guild_id.map(|id| id.0.get()),
                user_id: Some(reaction.user_id.0.get()),
                content: None,
                data: serde_json::to_value(reaction).ok()?,
            }
        }
        _ => return None,
    };
    Some(gateway_event)
}
