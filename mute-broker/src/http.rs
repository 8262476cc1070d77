//! HTTP API used by the bot fleet and by capture clients that poll instead of holding a socket

use crate::ack::{FAILURE_MARKER, SUCCESS_MARKER};
use crate::capture::{CaptureEvent, CaptureEventKind};
use crate::config;
use crate::dispatch::{DispatchPipeline, ModifyRequest};
use crate::keys::Keys;
use crate::queue::{EventQueue, GatewayQueue, Popped, TaskQueue};
use crate::session::{Registration, Session, SessionPool};
use crate::stats::Stats;
use crate::store::Store;
use crate::task::ModifyTask;
use crate::validate::{parse_snowflake, validate_task_id, ConnectCode};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use slog::Logger;
use std::fmt::Display;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<DispatchPipeline>,
    pub pool: Arc<SessionPool>,
    /// Session used for read-only platform lookups
    pub primary: Arc<dyn Session>,
    pub tasks: Arc<TaskQueue>,
    pub events: Arc<EventQueue>,
    pub gateway: Arc<GatewayQueue>,
    pub stats: Arc<Stats>,
    pub store: Arc<dyn Store>,
    pub keys: Keys,
    pub capture: config::Capture,
    pub gateway_pop_timeout: std::time::Duration,
    pub logger: Logger,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/modify/:guild_id/:connect_code", post(modify))
        .route("/addtoken", post(add_token))
        .route("/guild/get/:guild_id", post(get_guild))
        .route("/guild/channels/get/:guild_id", post(get_guild_channels))
        .route("/guild/member/get/:guild_id/:user_id", post(get_guild_member))
        .route("/capture/task/:connect_code", post(pop_task))
        .route("/capture/task/status/:task_id", post(task_status))
        .route("/capture/event/:connect_code", post(pop_event))
        .route("/capture/event/:connect_code/:event_type", post(push_event))
        .route("/request/job", post(pop_job))
        .route("/jobcount", get(job_count))
        .with_state(state)
}

fn bad_request(err: impl Display) -> Response {
    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
}

fn nothing_available(status: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": status })),
    )
        .into_response()
}

fn internal_error(logger: &Logger, message: &str, err: impl std::fmt::Debug) -> Response {
    slog::error!(logger, "{}", message; "error" => ?err);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

async fn index(State(state): State<ApiState>) -> Response {
    Json(state.stats.index(None).await).into_response()
}

async fn modify(
    State(state): State<ApiState>,
    Path((guild_id, connect_code)): Path<(String, String)>,
    body: String,
) -> Response {
    let guild_id = match parse_snowflake(&guild_id) {
        Ok(guild_id) => guild_id,
        Err(err) => return bad_request(err),
    };
    let code = match ConnectCode::parse(&connect_code) {
        Ok(code) => code,
        Err(err) => return bad_request(err),
    };
    let request: ModifyRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(format!("malformed modify request: {}", err)),
    };

    let counts = state.pipeline.dispatch(guild_id, &code, &request).await;
    Json(counts).into_response()
}

async fn add_token(State(state): State<ApiState>, body: String) -> Response {
    let token = body.trim();
    if token.is_empty() {
        return bad_request("empty token");
    }
    match state.pool.register(token).await {
        Ok(Registration::Registered { .. }) => StatusCode::OK.into_response(),
        Ok(Registration::AlreadyRegistered { .. }) => StatusCode::ALREADY_REPORTED.into_response(),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Relays the outcome of a platform lookup made on behalf of the bot fleet
fn lookup_response(
    logger: &Logger,
    what: &str,
    result: anyhow::Result<serde_json::Value>,
) -> Response {
    match result {
        Ok(found) => Json(found).into_response(),
        Err(err) => {
            slog::error!(logger, "platform lookup failed"; "lookup" => what, "error" => ?err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to fetch {}: {}", what, err),
            )
                .into_response()
        }
    }
}

async fn get_guild(State(state): State<ApiState>, Path(guild_id): Path<String>) -> Response {
    let guild_id = match parse_snowflake(&guild_id) {
        Ok(guild_id) => guild_id,
        Err(err) => return bad_request(err),
    };
    let logger = state.logger.new(slog::o!("guild_id" => guild_id));
    lookup_response(&logger, "guild", state.primary.guild(guild_id).await)
}

async fn get_guild_channels(
    State(state): State<ApiState>,
    Path(guild_id): Path<String>,
) -> Response {
    let guild_id = match parse_snowflake(&guild_id) {
        Ok(guild_id) => guild_id,
        Err(err) => return bad_request(err),
    };
    let logger = state.logger.new(slog::o!("guild_id" => guild_id));
    lookup_response(
        &logger,
        "guild channels",
        state.primary.guild_channels(guild_id).await,
    )
}

async fn get_guild_member(
    State(state): State<ApiState>,
    Path((guild_id, user_id)): Path<(String, String)>,
) -> Response {
    let (guild_id, user_id) = match (parse_snowflake(&guild_id), parse_snowflake(&user_id)) {
        (Ok(guild_id), Ok(user_id)) => (guild_id, user_id),
        (Err(err), _) | (_, Err(err)) => return bad_request(err),
    };
    let logger = state
        .logger
        .new(slog::o!("guild_id" => guild_id, "user_id" => user_id));
    lookup_response(
        &logger,
        "guild member",
        state.primary.guild_member(guild_id, user_id).await,
    )
}

async fn pop_task(State(state): State<ApiState>, Path(connect_code): Path<String>) -> Response {
    let code = match ConnectCode::parse(&connect_code) {
        Ok(code) => code,
        Err(err) => return bad_request(err),
    };
    let logger = state
        .logger
        .new(slog::o!("connect_code" => code.to_string()));

    let raw = match state
        .tasks
        .pop_blocking(&code, state.capture.task_pop_timeout)
        .await
    {
        Ok(Popped::Item(raw)) => raw,
        Ok(Popped::TimedOut) => return nothing_available("No capture client tasks available"),
        Err(err) => return internal_error(&logger, "failed to pop capture task", err),
    };

    match ModifyTask::from_json(&raw) {
        Ok(task) => {
            if let Err(err) = state
                .store
                .publish(&state.keys.receipt_ack(&task.task_id), SUCCESS_MARKER)
                .await
            {
                slog::warn!(logger, "failed to publish task receipt"; "task_id" => &task.task_id, "error" => ?err);
            }
        }
        Err(err) => slog::warn!(logger, "handing out unparseable task"; "error" => ?err),
    }
    state.stats.mark_active(&code).await;
    raw.into_response()
}

async fn task_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    body: String,
) -> Response {
    let task_id = match validate_task_id(&task_id) {
        Ok(task_id) => task_id,
        Err(err) => return bad_request(err),
    };
    let marker = match body.trim() {
        "true" | "t" => SUCCESS_MARKER,
        _ => FAILURE_MARKER,
    };
    match state
        .store
        .publish(&state.keys.completion_ack(task_id), marker)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(
            &state.logger.new(slog::o!("task_id" => task_id.to_owned())),
            "failed to publish task completion",
            err,
        ),
    }
}

async fn push_event(
    State(state): State<ApiState>,
    Path((connect_code, event_type)): Path<(String, String)>,
    body: String,
) -> Response {
    let code = match ConnectCode::parse(&connect_code) {
        Ok(code) => code,
        Err(err) => return bad_request(err),
    };
    let kind: CaptureEventKind = match event_type.parse() {
        Ok(kind) => kind,
        Err(err) => return bad_request(err),
    };

    state.stats.mark_active(&code).await;
    match state.events.push(&code, &CaptureEvent::new(kind, body)).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(
            &state.logger.new(slog::o!("connect_code" => code.to_string())),
            "failed to queue capture event",
            err,
        ),
    }
}

async fn pop_event(State(state): State<ApiState>, Path(connect_code): Path<String>) -> Response {
    let code = match ConnectCode::parse(&connect_code) {
        Ok(code) => code,
        Err(err) => return bad_request(err),
    };
    match state
        .events
        .pop_blocking(&code, state.capture.event_pop_timeout)
        .await
    {
        Ok(Popped::Item(raw)) => raw.into_response(),
        Ok(Popped::TimedOut) => nothing_available("No capture events available"),
        Err(err) => internal_error(
            &state.logger.new(slog::o!("connect_code" => code.to_string())),
            "failed to pop capture event",
            err,
        ),
    }
}

async fn pop_job(State(state): State<ApiState>) -> Response {
    match state.gateway.pop_blocking(state.gateway_pop_timeout).await {
        Ok(Popped::Item(raw)) => raw.into_response(),
        Ok(Popped::TimedOut) => nothing_available("No jobs available"),
        Err(err) => internal_error(&state.logger, "failed to pop gateway job", err),
    }
}

async fn job_count(State(state): State<ApiState>) -> Response {
    match state.gateway.len().await {
        Ok(jobs) => Json(serde_json::json!({ "jobs": jobs })).into_response(),
        Err(err) => internal_error(&state.logger, "failed to count gateway jobs", err),
    }
}
