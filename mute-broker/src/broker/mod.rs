//! Registry of capture client connections.
//!
//! A connection registers a connect code, then joins the code's room once the client
//! reports which bot it is paired with. Joining starts a loop that moves tasks from the
//! code's queue to every connection in the room. Registration starts a second loop that
//! re-announces the client whenever a downstream consumer asks for it.
//! Both loops stop when the connection goes away.

pub mod ws;

use crate::ack::{FAILURE_MARKER, SUCCESS_MARKER};
use crate::capture::{CaptureEvent, CaptureEventKind, GameLobby};
use crate::config;
use crate::keys::Keys;
use crate::queue::{EventQueue, Popped, TaskQueue};
use crate::stats::Stats;
use crate::store::{Store, StoreError};
use crate::task::ModifyTask;
use crate::validate::{validate_task_id, ConnectCode, ValidationError};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub type ConnectionId = u64;

/// Events a capture client sends, framed as `{"event": <name>, "data": <value>}`
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "connectCode")]
    ConnectCode(serde_json::Value),
    #[serde(rename = "botID")]
    BotId(serde_json::Value),
    #[serde(rename = "lobby")]
    Lobby(serde_json::Value),
    #[serde(rename = "state")]
    State(serde_json::Value),
    #[serde(rename = "player")]
    Player(serde_json::Value),
    #[serde(rename = "gameover")]
    GameOver(serde_json::Value),
    #[serde(rename = "taskFailed")]
    TaskFailed(serde_json::Value),
    #[serde(rename = "taskComplete")]
    TaskComplete(serde_json::Value),
}

impl ClientEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectCode(_) => "connectCode",
            Self::BotId(_) => "botID",
            Self::Lobby(_) => "lobby",
            Self::State(_) => "state",
            Self::Player(_) => "player",
            Self::GameOver(_) => "gameover",
            Self::TaskFailed(_) => "taskFailed",
            Self::TaskComplete(_) => "taskComplete",
        }
    }
}

/// Events sent to a capture client
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "modify")]
    Modify(ModifyTask),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid connect code: {0}")]
    InvalidConnectCode(ValidationError),
    #[error("invalid task id: {0}")]
    InvalidTaskId(ValidationError),
    #[error("{0} received before a connect code")]
    NotRegistered(&'static str),
    #[error("connection already registered with code {0}")]
    AlreadyRegistered(ConnectCode),
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: &'static str, reason: String },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

impl BrokerError {
    /// Whether the transport should be closed after this error
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConnectCode(_))
    }
}

/// Text form of a payload; clients send some values as strings and some as JSON
fn payload_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    code: Option<ConnectCode>,
    /// Stops the loops started for this connection; sending never blocks
    kill: Option<watch::Sender<bool>>,
    joined: bool,
}

#[derive(Default)]
struct Room {
    members: HashSet<ConnectionId>,
    /// Tasks forwarded to the room that no member has answered yet, with when they were sent
    outstanding: HashMap<String, Instant>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<ConnectCode, Room>,
}

pub struct ConnectionBroker {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    store: Arc<dyn Store>,
    tasks: Arc<TaskQueue>,
    events: Arc<EventQueue>,
    stats: Arc<Stats>,
    keys: Keys,
    config: config::Capture,
    logger: Logger,
}

impl ConnectionBroker {
    pub fn new(
        store: Arc<dyn Store>,
        tasks: Arc<TaskQueue>,
        events: Arc<EventQueue>,
        stats: Arc<Stats>,
        keys: Keys,
        config: config::Capture,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_id: AtomicU64::new(1),
            store,
            tasks,
            events,
            stats,
            keys,
            config,
            logger,
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self.state.lock().expect("broker state poisoned");
        f(&mut state)
    }

    pub fn active_connections(&self) -> usize {
        self.with_state(|state| state.connections.len())
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Accepts a new transport connection; events for it arrive on the returned receiver
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            state.connections.insert(
                id,
                Connection {
                    outbound,
                    code: None,
                    kill: None,
                    joined: false,
                },
            );
        });
        slog::debug!(self.logger, "capture client connected"; "connection_id" => id);
        (id, outbound_rx)
    }

    fn registered_code(
        &self,
        id: ConnectionId,
        event: &'static str,
    ) -> Result<ConnectCode, BrokerError> {
        self.with_state(|state| match state.connections.get(&id) {
            None => Err(BrokerError::UnknownConnection(id)),
            Some(Connection { code: None, .. }) => Err(BrokerError::NotRegistered(event)),
            Some(Connection {
                code: Some(code), ..
            }) => Ok(code.clone()),
        })
    }

    pub async fn handle(
        self: &Arc<Self>,
        id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), BrokerError> {
        let name = event.name();
        match event {
            ClientEvent::ConnectCode(raw) => self.register(id, &payload_text(&raw)).await,
            ClientEvent::BotId(raw) => self.join_room(id, &payload_text(&raw)),
            ClientEvent::TaskComplete(raw) => self.finish_task(id, &payload_text(&raw), true).await,
            ClientEvent::TaskFailed(raw) => self.finish_task(id, &payload_text(&raw), false).await,
            ClientEvent::Lobby(raw) => {
                let code = self.registered_code(id, name)?;
                let lobby: GameLobby = match &raw {
                    serde_json::Value::String(text) => serde_json::from_str(text),
                    other => serde_json::from_value(other.clone()),
                }
                .map_err(|err| BrokerError::Malformed {
                    event: name,
                    reason: err.to_string(),
                })?;
                self.push_event(&code, CaptureEventKind::Lobby, payload_text(&raw))
                    .await?;
                self.store
                    .set_with_expiry(
                        &self.keys.room_code(&code),
                        &lobby.lobby_code,
                        self.config.room_code_expiry,
                    )
                    .await?;
                Ok(())
            }
            ClientEvent::State(raw) => {
                let code = self.registered_code(id, name)?;
                let text = payload_text(&raw);
                if let Err(err) = text.trim().parse::<i64>() {
                    return Err(BrokerError::Malformed {
                        event: name,
                        reason: err.to_string(),
                    });
                }
                self.push_event(&code, CaptureEventKind::State, text).await?;
                self.refresh_room_code(&code).await
            }
            ClientEvent::Player(raw) => {
                let code = self.registered_code(id, name)?;
                self.push_event(&code, CaptureEventKind::Player, payload_text(&raw))
                    .await?;
                self.refresh_room_code(&code).await
            }
            ClientEvent::GameOver(raw) => {
                let code = self.registered_code(id, name)?;
                self.push_event(&code, CaptureEventKind::GameOver, payload_text(&raw))
                    .await
            }
        }
    }

    /// Queues telemetry for downstream consumers and marks the game as active
    async fn push_event(
        &self,
        code: &ConnectCode,
        kind: CaptureEventKind,
        payload: String,
    ) -> Result<(), BrokerError> {
        self.events
            .push(code, &CaptureEvent::new(kind, payload))
            .await?;
        self.stats.mark_active(code).await;
        Ok(())
    }

    async fn refresh_room_code(&self, code: &ConnectCode) -> Result<(), BrokerError> {
        self.store
            .expire(&self.keys.room_code(code), self.config.room_code_expiry)
            .await?;
        Ok(())
    }

    async fn register(self: &Arc<Self>, id: ConnectionId, raw: &str) -> Result<(), BrokerError> {
        let code = ConnectCode::parse(raw).map_err(BrokerError::InvalidConnectCode)?;
        let (kill_tx, kill_rx) = watch::channel(false);
        self.with_state(|state| {
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(BrokerError::UnknownConnection(id))?;
            if let Some(existing) = &connection.code {
                return Err(BrokerError::AlreadyRegistered(existing.clone()));
            }
            connection.code = Some(code.clone());
            connection.kill = Some(kill_tx);
            Ok(())
        })?;

        let logger = self.logger.new(slog::o!(
            "connection_id" => id,
            "connect_code" => code.to_string(),
        ));
        slog::info!(logger, "capture client registered connect code");

        self.push_event(&code, CaptureEventKind::Connection, String::from("true"))
            .await?;
        tokio::spawn(Arc::clone(self).ack_worker(code, kill_rx, logger));
        Ok(())
    }

    fn join_room(self: &Arc<Self>, id: ConnectionId, bot_id: &str) -> Result<(), BrokerError> {
        let joined = self.with_state(|state| {
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(BrokerError::UnknownConnection(id))?;
            let (code, kill) = match (&connection.code, &connection.kill) {
                (Some(code), Some(kill)) => (code.clone(), kill.subscribe()),
                _ => return Err(BrokerError::NotRegistered("botID")),
            };
            if connection.joined {
                return Ok(None);
            }
            connection.joined = true;
            state
                .rooms
                .entry(code.clone())
                .or_default()
                .members
                .insert(id);
            Ok(Some((code, kill)))
        })?;

        if let Some((code, kill)) = joined {
            let logger = self.logger.new(slog::o!(
                "connection_id" => id,
                "connect_code" => code.to_string(),
                "bot_id" => bot_id.to_owned(),
            ));
            slog::info!(logger, "capture client joined room");
            tokio::spawn(Arc::clone(self).forward_tasks(code, kill, logger));
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        id: ConnectionId,
        raw: &str,
        succeeded: bool,
    ) -> Result<(), BrokerError> {
        let task_id = validate_task_id(raw).map_err(BrokerError::InvalidTaskId)?;
        self.with_state(|state| {
            let code = state.connections.get(&id).and_then(|c| c.code.clone());
            if let Some(room) = code.and_then(|code| state.rooms.get_mut(&code)) {
                room.outstanding.remove(task_id);
            }
        });
        let marker = if succeeded {
            SUCCESS_MARKER
        } else {
            FAILURE_MARKER
        };
        self.store
            .publish(&self.keys.completion_ack(task_id), marker)
            .await?;
        slog::debug!(
            self.logger,
            "capture client finished task";
            "connection_id" => id,
            "task_id" => task_id,
            "succeeded" => succeeded,
        );
        Ok(())
    }

    /// Tears a connection down. Calling it again for the same connection does nothing.
    pub async fn disconnect(&self, id: ConnectionId) {
        let removed = self.with_state(|state| {
            let connection = state.connections.remove(&id)?;
            let mut abandoned = Vec::new();
            if let Some(code) = &connection.code {
                let now_empty = match state.rooms.get_mut(code) {
                    Some(room) => {
                        room.members.remove(&id);
                        room.members.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    if let Some(room) = state.rooms.remove(code) {
                        abandoned.extend(room.outstanding.into_keys());
                    }
                }
            }
            Some((connection, abandoned))
        });
        let (connection, abandoned) = match removed {
            Some(removed) => removed,
            None => return,
        };

        if let Some(kill) = &connection.kill {
            // Fails only when both loops have already stopped
            let _ = kill.send(true);
        }
        let code = match connection.code {
            Some(code) => code,
            None => {
                slog::debug!(self.logger, "unregistered capture client disconnected"; "connection_id" => id);
                return;
            }
        };
        let logger = self.logger.new(slog::o!(
            "connection_id" => id,
            "connect_code" => code.to_string(),
        ));

        if let Err(err) = self.events.push(&code, &CaptureEvent::connection(false)).await {
            slog::warn!(logger, "failed to report capture client disconnect"; "error" => ?err);
        }
        for task_id in &abandoned {
            if let Err(err) = self
                .store
                .publish(&self.keys.completion_ack(task_id), FAILURE_MARKER)
                .await
            {
                slog::warn!(logger, "failed to fail abandoned task"; "task_id" => task_id, "error" => ?err);
            }
        }
        slog::info!(logger, "capture client disconnected"; "abandoned_tasks" => abandoned.len());
    }

    /// Re-announces the client whenever something publishes on the code's ack channel
    async fn ack_worker(
        self: Arc<Self>,
        code: ConnectCode,
        mut kill: watch::Receiver<bool>,
        logger: Logger,
    ) {
        let mut subscription = match self.store.subscribe(&self.keys.capture_ack(&code)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                slog::warn!(logger, "ack worker could not subscribe"; "error" => ?err);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = kill.changed() => break,
                message = subscription.next() => {
                    if message.is_none() {
                        slog::warn!(logger, "ack subscription closed");
                        break;
                    }
                    if let Err(err) = self
                        .push_event(&code, CaptureEventKind::Connection, String::from("true"))
                        .await
                    {
                        slog::warn!(logger, "failed to re-announce capture client"; "error" => ?err);
                    }
                }
            }
        }
        slog::debug!(logger, "ack worker stopped");
    }

    /// Moves tasks from the code's queue to the room until the connection goes away
    async fn forward_tasks(
        self: Arc<Self>,
        code: ConnectCode,
        mut kill: watch::Receiver<bool>,
        logger: Logger,
    ) {
        loop {
            let popped = tokio::select! {
                _ = kill.changed() => break,
                popped = self.tasks.pop_blocking(&code, self.config.forward_pop_timeout) => popped,
            };
            match popped {
                Ok(Popped::Item(raw)) => self.forward(&code, &raw, &logger).await,
                Ok(Popped::TimedOut) => {}
                Err(err) => {
                    slog::warn!(logger, "failed to pop task"; "error" => ?err);
                    tokio::select! {
                        _ = kill.changed() => break,
                        _ = tokio::time::sleep(self.config.forward_pop_timeout) => {}
                    }
                }
            }
        }
        slog::debug!(logger, "task forwarding loop stopped");
    }

    async fn forward(&self, code: &ConnectCode, raw: &str, logger: &Logger) {
        let task = match ModifyTask::from_json(raw) {
            Ok(task) => task,
            Err(err) => {
                slog::warn!(logger, "dropping malformed task"; "error" => ?err);
                return;
            }
        };

        let members: Vec<mpsc::UnboundedSender<ServerEvent>> = self.with_state(|state| {
            let room = match state.rooms.get_mut(code) {
                Some(room) => room,
                None => return Vec::new(),
            };
            let expiry = self.config.outstanding_task_expiry;
            room.outstanding.retain(|_, sent| sent.elapsed() < expiry);
            room.outstanding.insert(task.task_id.clone(), Instant::now());
            let members = room.members.clone();
            members
                .iter()
                .filter_map(|member| state.connections.get(member))
                .map(|connection| connection.outbound.clone())
                .collect()
        });

        let event = ServerEvent::Modify(task.clone());
        let delivered = members
            .iter()
            .filter(|outbound| outbound.send(event.clone()).is_ok())
            .count();
        if delivered == 0 {
            slog::warn!(logger, "no connection left to receive task"; "task_id" => &task.task_id);
            return;
        }

        if let Err(err) = self
            .store
            .publish(&self.keys.receipt_ack(&task.task_id), SUCCESS_MARKER)
            .await
        {
            slog::warn!(logger, "failed to publish task receipt"; "task_id" => &task.task_id, "error" => ?err);
        }
        slog::debug!(
            logger,
            "forwarded task to room";
            "task_id" => &task.task_id,
            "delivered" => delivered,
        );
    }

    /// Lobby code last reported for the connect code
    pub async fn room_code(&self, code: &ConnectCode) -> Result<Option<String>, StoreError> {
        self.store.get(&self.keys.room_code(code)).await
    }
}

#[cfg(test)]
mod tests;
