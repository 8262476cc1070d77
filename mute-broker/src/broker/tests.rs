use super::*;
use crate::ack::{AckCoordinator, AckTimeouts};
use crate::dispatch::{DispatchPipeline, ModifyRequest, TierCounts, UserModify};
use crate::queue::Popped;
use crate::ratelimit::RateLimitLedger;
use crate::session::{PatchParams, Session, SessionConnector, SessionPool};
use crate::store::MemoryStore;
use crate::testutils::{logger, FakeConnector, FakeSession};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    store: Arc<dyn Store>,
    keys: Keys,
    tasks: Arc<TaskQueue>,
    events: Arc<EventQueue>,
    stats: Arc<Stats>,
    broker: Arc<ConnectionBroker>,
}

fn harness(test_name: &'static str) -> Harness {
    harness_with(
        test_name,
        config::Capture {
            forward_pop_timeout: Duration::from_millis(50),
            ..config::Capture::default()
        },
    )
}

fn harness_with(test_name: &'static str, capture: config::Capture) -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let keys = Keys::new("test");
    let tasks = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        keys.clone(),
        Duration::from_secs(60),
    ));
    let events = Arc::new(EventQueue::new(
        Arc::clone(&store),
        keys.clone(),
        Duration::from_secs(60),
    ));
    let stats = Arc::new(Stats::new(
        Arc::clone(&store),
        keys.clone(),
        Duration::from_secs(900),
        logger(test_name),
    ));
    let broker = ConnectionBroker::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        Arc::clone(&events),
        Arc::clone(&stats),
        keys.clone(),
        capture,
        logger(test_name),
    );
    Harness {
        store,
        keys,
        tasks,
        events,
        stats,
        broker,
    }
}

fn code() -> ConnectCode {
    ConnectCode::parse("ABCD1234").unwrap()
}

fn text(value: &str) -> serde_json::Value {
    serde_json::Value::String(value.to_owned())
}

async fn next_event(harness: &Harness) -> Option<CaptureEvent> {
    match harness
        .events
        .pop_blocking(&code(), Duration::from_millis(100))
        .await
        .unwrap()
    {
        Popped::Item(raw) => Some(serde_json::from_str(&raw).unwrap()),
        Popped::TimedOut => None,
    }
}

/// Registers and joins a connection, draining the connection announcement
async fn joined(harness: &Harness) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
    let (id, outbound) = harness.broker.connect();
    harness
        .broker
        .handle(id, ClientEvent::ConnectCode(text("ABCD1234")))
        .await
        .unwrap();
    harness
        .broker
        .handle(id, ClientEvent::BotId(serde_json::json!(42)))
        .await
        .unwrap();
    assert_eq!(next_event(harness).await, Some(CaptureEvent::connection(true)));
    (id, outbound)
}

#[test]
fn test_client_event_framing() {
    let event: ClientEvent =
        serde_json::from_str(r#"{"event": "connectCode", "data": "ABCD1234"}"#).unwrap();
    assert_eq!(event, ClientEvent::ConnectCode(text("ABCD1234")));
    let event: ClientEvent = serde_json::from_str(r#"{"event": "botID", "data": 42}"#).unwrap();
    assert_eq!(event.name(), "botID");
    assert!(serde_json::from_str::<ClientEvent>(r#"{"event": "dance", "data": 1}"#).is_err());

    let task = ModifyTask {
        guild_id: 100,
        user_id: 200,
        parameters: PatchParams {
            mute: true,
            deaf: false,
        },
        task_id: String::from("0123456789"),
    };
    assert_eq!(
        serde_json::to_value(ServerEvent::Modify(task)).unwrap(),
        serde_json::json!({
            "event": "modify",
            "data": {
                "guildID": 100,
                "userID": 200,
                "parameters": {"mute": true, "deaf": false},
                "taskID": "0123456789",
            },
        })
    );
}

#[tokio::test]
async fn test_wrong_length_code_is_fatal() {
    let harness = harness("test_wrong_length_code_is_fatal");
    let (id, _outbound) = harness.broker.connect();
    let err = harness
        .broker
        .handle(id, ClientEvent::ConnectCode(text("SHORT")))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(next_event(&harness).await, None);
}

#[tokio::test]
async fn test_bot_id_before_code_is_not_fatal() {
    let harness = harness("test_bot_id_before_code_is_not_fatal");
    let (id, _outbound) = harness.broker.connect();
    let err = harness
        .broker
        .handle(id, ClientEvent::BotId(serde_json::json!(42)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotRegistered("botID")));
    assert!(!err.is_fatal());
    // The connection is still usable afterwards
    harness
        .broker
        .handle(id, ClientEvent::ConnectCode(text("ABCD1234")))
        .await
        .unwrap();
    assert_eq!(next_event(&harness).await, Some(CaptureEvent::connection(true)));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let harness = harness("test_disconnect_is_idempotent");
    let (id, _outbound) = joined(&harness).await;
    assert_eq!(harness.broker.active_connections(), 1);

    harness.broker.disconnect(id).await;
    harness.broker.disconnect(id).await;
    assert_eq!(harness.broker.active_connections(), 0);
    assert_eq!(next_event(&harness).await, Some(CaptureEvent::connection(false)));
    assert_eq!(next_event(&harness).await, None);
}

#[tokio::test]
async fn test_disconnect_before_registration() {
    let harness = harness("test_disconnect_before_registration");
    let (id, _outbound) = harness.broker.connect();
    harness.broker.disconnect(id).await;
    assert_eq!(harness.broker.active_connections(), 0);
    assert_eq!(next_event(&harness).await, None);
}

#[tokio::test]
async fn test_tasks_are_forwarded_with_receipt() {
    let harness = harness("test_tasks_are_forwarded_with_receipt");
    let (_id, mut outbound) = joined(&harness).await;

    let task = ModifyTask::new(
        100,
        200,
        PatchParams {
            mute: true,
            deaf: false,
        },
    );
    let mut receipt = harness
        .store
        .subscribe(&harness.keys.receipt_ack(&task.task_id))
        .await
        .unwrap();
    harness.tasks.push(&code(), &task).await.unwrap();

    let forwarded = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap();
    assert_eq!(forwarded, Some(ServerEvent::Modify(task)));
    let marker = tokio::time::timeout(WAIT, receipt.next()).await.unwrap();
    assert_eq!(marker.as_deref(), Some(SUCCESS_MARKER));
}

#[tokio::test]
async fn test_task_outcomes_are_published() {
    let harness = harness("test_task_outcomes_are_published");
    let (id, _outbound) = joined(&harness).await;

    let mut completion = harness
        .store
        .subscribe(&harness.keys.completion_ack("0123456789"))
        .await
        .unwrap();
    harness
        .broker
        .handle(id, ClientEvent::TaskComplete(text("0123456789")))
        .await
        .unwrap();
    harness
        .broker
        .handle(id, ClientEvent::TaskFailed(text("0123456789")))
        .await
        .unwrap();
    assert_eq!(completion.next().await.as_deref(), Some(SUCCESS_MARKER));
    assert_eq!(completion.next().await.as_deref(), Some(FAILURE_MARKER));

    let err = harness
        .broker
        .handle(id, ClientEvent::TaskComplete(text("short")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTaskId(_)));
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_tasks() {
    let harness = harness("test_disconnect_fails_outstanding_tasks");
    let (id, mut outbound) = joined(&harness).await;

    let task = ModifyTask::new(
        100,
        200,
        PatchParams {
            mute: false,
            deaf: false,
        },
    );
    let mut completion = harness
        .store
        .subscribe(&harness.keys.completion_ack(&task.task_id))
        .await
        .unwrap();
    harness.tasks.push(&code(), &task).await.unwrap();
    tokio::time::timeout(WAIT, outbound.recv()).await.unwrap();

    harness.broker.disconnect(id).await;
    let marker = tokio::time::timeout(WAIT, completion.next()).await.unwrap();
    assert_eq!(marker.as_deref(), Some(FAILURE_MARKER));
}

#[tokio::test]
async fn test_unanswered_tasks_expire_from_room() {
    let harness = harness_with(
        "test_unanswered_tasks_expire_from_room",
        config::Capture {
            forward_pop_timeout: Duration::from_millis(50),
            outstanding_task_expiry: Duration::from_millis(200),
            ..config::Capture::default()
        },
    );
    let (_id, mut outbound) = joined(&harness).await;
    let params = PatchParams {
        mute: true,
        deaf: true,
    };

    // The client receives every task but never reports an outcome
    for user_id in 0..20 {
        let task = ModifyTask::new(100, 200 + user_id, params);
        harness.tasks.push(&code(), &task).await.unwrap();
        let forwarded = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap();
        assert_eq!(forwarded, Some(ServerEvent::Modify(task)));
    }
    let outstanding = |harness: &Harness| {
        harness
            .broker
            .state
            .lock()
            .unwrap()
            .rooms
            .get(&code())
            .map_or(0, |room| room.outstanding.len())
    };
    assert_eq!(outstanding(&harness), 20);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = ModifyTask::new(100, 999, params);
    harness.tasks.push(&code(), &task).await.unwrap();
    let forwarded = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap();
    assert_eq!(forwarded, Some(ServerEvent::Modify(task.clone())));
    assert_eq!(outstanding(&harness), 1);
    assert!(harness.broker.state.lock().unwrap().rooms[&code()]
        .outstanding
        .contains_key(&task.task_id));
}

#[tokio::test]
async fn test_forwarding_stops_after_disconnect() {
    let harness = harness("test_forwarding_stops_after_disconnect");
    let (id, _outbound) = joined(&harness).await;
    harness.broker.disconnect(id).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let task = ModifyTask::new(
        100,
        200,
        PatchParams {
            mute: true,
            deaf: true,
        },
    );
    let queued = harness.tasks.push(&code(), &task).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let popped = harness
        .tasks
        .pop_blocking(&code(), Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(popped, Popped::Item(queued));
}

#[tokio::test]
async fn test_game_events_are_queued() {
    let harness = harness("test_game_events_are_queued");
    let (id, _outbound) = joined(&harness).await;

    harness
        .broker
        .handle(
            id,
            ClientEvent::Lobby(text(r#"{"LobbyCode": "QWERTY", "Region": 0, "Map": 1}"#)),
        )
        .await
        .unwrap();
    assert_eq!(
        harness.broker.room_code(&code()).await.unwrap().as_deref(),
        Some("QWERTY")
    );
    assert_eq!(next_event(&harness).await.unwrap().kind, CaptureEventKind::Lobby);

    let err = harness
        .broker
        .handle(id, ClientEvent::State(text("lobby")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Malformed { event: "state", .. }));
    harness
        .broker
        .handle(id, ClientEvent::State(serde_json::json!(1)))
        .await
        .unwrap();
    assert_eq!(
        next_event(&harness).await,
        Some(CaptureEvent::new(CaptureEventKind::State, "1"))
    );

    harness
        .broker
        .handle(id, ClientEvent::Player(text(r#"{"Name": "red"}"#)))
        .await
        .unwrap();
    harness
        .broker
        .handle(id, ClientEvent::GameOver(text("{}")))
        .await
        .unwrap();
    assert_eq!(next_event(&harness).await.unwrap().kind, CaptureEventKind::Player);
    assert_eq!(next_event(&harness).await.unwrap().kind, CaptureEventKind::GameOver);
    assert_eq!(harness.stats.active_games().await, 1);
}

#[tokio::test]
async fn test_ack_channel_reannounces_client() {
    let harness = harness("test_ack_channel_reannounces_client");
    let (_id, _outbound) = joined(&harness).await;

    // The ack worker subscribes in the background, so keep asking until it answers
    let mut announced = None;
    for _ in 0..20 {
        harness
            .store
            .publish(&harness.keys.capture_ack(&code()), "ping")
            .await
            .unwrap();
        announced = next_event(&harness).await;
        if announced.is_some() {
            break;
        }
    }
    assert_eq!(announced, Some(CaptureEvent::connection(true)));
}

#[tokio::test]
async fn test_capture_client_completes_dispatched_mute() {
    let harness = harness("test_capture_client_completes_dispatched_mute");
    let log = logger("test_capture_client_completes_dispatched_mute");
    let ledger = Arc::new(RateLimitLedger::new(
        Arc::clone(&harness.store),
        harness.keys.clone(),
        &config::RateLimit::default(),
        log.clone(),
    ));
    let pool = SessionPool::new(
        Arc::new(FakeConnector::with_guilds(vec![])) as Arc<dyn SessionConnector>,
        Arc::clone(&harness.store),
        Arc::clone(&ledger),
        harness.keys.clone(),
        log.clone(),
    );
    let primary = FakeSession::new(vec![100]);
    let dispatch_config = config::Dispatch::default();
    let acks = Arc::new(AckCoordinator::new(
        Arc::clone(&harness.store),
        Arc::clone(&harness.tasks),
        harness.keys.clone(),
        AckTimeouts {
            receipt: dispatch_config.capture_receipt_timeout,
            completion: dispatch_config.capture_completion_timeout,
        },
        log.clone(),
    ));
    let pipeline = DispatchPipeline::new(
        pool,
        ledger,
        acks,
        Arc::clone(&primary) as Arc<dyn Session>,
        Arc::clone(&harness.stats),
        dispatch_config,
        log,
    );

    let (id, mut outbound) = joined(&harness).await;
    let broker = Arc::clone(&harness.broker);
    let client = tokio::spawn(async move {
        match tokio::time::timeout(WAIT, outbound.recv()).await {
            Ok(Some(ServerEvent::Modify(task))) => {
                assert_eq!(task.guild_id, 100);
                assert_eq!(task.user_id, 200);
                assert_eq!(
                    task.parameters,
                    PatchParams {
                        mute: true,
                        deaf: false
                    }
                );
                broker
                    .handle(id, ClientEvent::TaskComplete(text(&task.task_id)))
                    .await
                    .unwrap();
            }
            other => panic!("expected a modify event, got {:?}", other),
        }
    });

    let request = ModifyRequest {
        premium_tier: 0,
        users: vec![UserModify {
            user_id: 200,
            mute: true,
            deaf: false,
        }],
    };
    let counts = pipeline.dispatch(100, &code(), &request).await;
    client.await.unwrap();

    assert_eq!(
        counts,
        TierCounts {
            worker: 0,
            capture: 1,
            official: 0,
            ratelimit: 0,
            error: 0,
        }
    );
    assert!(primary.updates().is_empty());
}

/// Serves the broker routes on an ephemeral port and returns the websocket URL
async fn serve(harness: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = ws::router(ws::BrokerApi {
        broker: Arc::clone(&harness.broker),
        stats: Arc::clone(&harness.stats),
    });
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("ws://{}/ws", address)
}

async fn wait_for_connections(harness: &Harness, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while harness.broker.active_connections() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_websocket_closes_on_wrong_length_code() {
    let harness = harness("test_websocket_closes_on_wrong_length_code");
    let (mut socket, _) = tokio_tungstenite::connect_async(serve(&harness).await)
        .await
        .unwrap();
    wait_for_connections(&harness, 1).await;

    socket
        .send(Message::Text(String::from(
            r#"{"event": "connectCode", "data": "SHORT"}"#,
        )))
        .await
        .unwrap();
    let frame = tokio::time::timeout(WAIT, socket.next()).await.unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_)))), "{:?}", frame);
    wait_for_connections(&harness, 0).await;
}

#[tokio::test]
async fn test_websocket_forwards_tasks_and_cleans_up_on_close() {
    let harness = harness("test_websocket_forwards_tasks_and_cleans_up_on_close");
    let (mut socket, _) = tokio_tungstenite::connect_async(serve(&harness).await)
        .await
        .unwrap();

    // Frames that fail to parse are skipped without closing the connection
    socket
        .send(Message::Text(String::from("not json")))
        .await
        .unwrap();
    for frame in [
        r#"{"event": "connectCode", "data": "ABCD1234"}"#,
        r#"{"event": "botID", "data": 42}"#,
    ] {
        socket.send(Message::Text(String::from(frame))).await.unwrap();
    }
    let announced = harness.events.pop_blocking(&code(), WAIT).await.unwrap();
    match announced {
        Popped::Item(raw) => assert_eq!(
            serde_json::from_str::<CaptureEvent>(&raw).unwrap(),
            CaptureEvent::connection(true)
        ),
        Popped::TimedOut => panic!("connection was never announced"),
    }

    let task = ModifyTask::new(
        100,
        200,
        PatchParams {
            mute: true,
            deaf: false,
        },
    );
    harness.tasks.push(&code(), &task).await.unwrap();
    let frame = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match frame {
        Message::Text(text) => text,
        other => panic!("expected a text frame, got {:?}", other),
    };
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&text).unwrap(),
        serde_json::json!({
            "event": "modify",
            "data": {
                "guildID": 100,
                "userID": 200,
                "parameters": {"mute": true, "deaf": false},
                "taskID": task.task_id,
            },
        })
    );

    socket.close(None).await.unwrap();
    wait_for_connections(&harness, 0).await;
    let announced = harness.events.pop_blocking(&code(), WAIT).await.unwrap();
    assert!(matches!(
        announced,
        Popped::Item(raw) if serde_json::from_str::<CaptureEvent>(&raw).unwrap() == CaptureEvent::connection(false)
    ));
}
