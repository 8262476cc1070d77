//! Websocket transport for capture clients, and the broker's HTTP routes

use super::{ClientEvent, ConnectionBroker};
use crate::stats::Stats;
use crate::validate::ConnectCode;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

#[derive(Clone)]
pub struct BrokerApi {
    pub broker: Arc<ConnectionBroker>,
    pub stats: Arc<Stats>,
}

pub fn router(api: BrokerApi) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(websocket))
        .route("/lobbycode/:connect_code", get(lobby_code))
        .with_state(api)
}

async fn index(State(api): State<BrokerApi>) -> Response {
    let index = api
        .stats
        .index(Some(api.broker.active_connections()))
        .await;
    Json(index).into_response()
}

async fn lobby_code(State(api): State<BrokerApi>, Path(raw): Path<String>) -> Response {
    let code = match ConnectCode::parse(&raw) {
        Ok(code) => code,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    match api.broker.room_code(&code).await {
        Ok(Some(room_code)) => Json(serde_json::json!({ "result": room_code })).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            slog::error!(
                api.broker.logger(),
                "failed to read room code";
                "connect_code" => code.to_string(),
                "error" => ?err,
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn websocket(State(api): State<BrokerApi>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| serve_connection(api.broker, socket))
}

/// Pumps one connection until either side closes it, then tears it down
async fn serve_connection(broker: Arc<ConnectionBroker>, socket: WebSocket) {
    let (id, mut outbound) = broker.connect();
    let logger = broker.logger().new(slog::o!("connection_id" => id));
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            Some(event) = outbound.recv() => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        slog::error!(logger, "failed to encode outbound event"; "error" => ?err);
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    slog::debug!(logger, "failed to send to capture client"; "error" => ?err);
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => event,
                        Err(err) => {
                            slog::warn!(logger, "ignoring malformed frame"; "error" => ?err);
                            continue;
                        }
                    };
                    let name = event.name();
                    if let Err(err) = broker.handle(id, event).await {
                        slog::warn!(logger, "could not handle capture client event"; "event" => name, "error" => %err);
                        if err.is_fatal() {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    slog::debug!(logger, "websocket error"; "error" => ?err);
                    break;
                }
            },
        }
    }

    broker.disconnect(id).await;
}
