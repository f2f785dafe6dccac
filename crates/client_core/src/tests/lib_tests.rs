use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde_json::json;
use shared::{
    domain::{MessageId, RoomId, UserId, UserRole},
    protocol::{
        room_read_topic, room_topic, BrokerFrame, ChatMessagePayload, ClientFrame,
        OutgoingMessage, ReadReceiptPayload, RefreshResponse, TokenPairResponse, UserProfile,
    },
};
use tokio::{net::TcpListener, sync::broadcast, sync::Mutex};

use super::*;

#[derive(Clone)]
struct TestState {
    issue_access: Arc<Mutex<String>>,
    valid_token: Arc<Mutex<String>>,
    refresh_calls: Arc<Mutex<u32>>,
    refresh_delay: Arc<Mutex<Duration>>,
    fail_refresh: Arc<Mutex<bool>>,
    protected_hits: Arc<Mutex<u32>>,
    protected_always_401: Arc<Mutex<bool>>,
    history: Arc<Mutex<Vec<ChatMessagePayload>>>,
    next_message_id: Arc<Mutex<i64>>,
    connects: Arc<Mutex<u32>>,
    subscribe_log: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    inject_tx: broadcast::Sender<(String, serde_json::Value)>,
    drop_tx: broadcast::Sender<()>,
}

impl TestState {
    fn new() -> Self {
        Self {
            issue_access: Arc::new(Mutex::new("fresh-token".to_string())),
            valid_token: Arc::new(Mutex::new("fresh-token".to_string())),
            refresh_calls: Arc::new(Mutex::new(0)),
            refresh_delay: Arc::new(Mutex::new(Duration::ZERO)),
            fail_refresh: Arc::new(Mutex::new(false)),
            protected_hits: Arc::new(Mutex::new(0)),
            protected_always_401: Arc::new(Mutex::new(false)),
            history: Arc::new(Mutex::new(Vec::new())),
            next_message_id: Arc::new(Mutex::new(100)),
            connects: Arc::new(Mutex::new(0)),
            subscribe_log: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(Mutex::new(Vec::new())),
            inject_tx: broadcast::channel(64).0,
            drop_tx: broadcast::channel(8).0,
        }
    }

    fn inject(&self, topic: String, body: serde_json::Value) {
        let _ = self.inject_tx.send((topic, body));
    }
}

async fn login_route(State(state): State<TestState>) -> Json<TokenPairResponse> {
    Json(TokenPairResponse {
        access_token: state.issue_access.lock().await.clone(),
        refresh_token: "refresh-1".to_string(),
    })
}

async fn user_route() -> Json<UserProfile> {
    Json(UserProfile {
        user_id: UserId(42),
        name: "Mina".to_string(),
        email: "mina@example.test".to_string(),
        role: UserRole::Customer,
    })
}

async fn refresh_route(
    State(state): State<TestState>,
) -> Result<Json<RefreshResponse>, StatusCode> {
    *state.refresh_calls.lock().await += 1;
    let delay = *state.refresh_delay.lock().await;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if *state.fail_refresh.lock().await {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    *state.valid_token.lock().await = "fresh-token".to_string();
    Ok(Json(RefreshResponse {
        access_token: "fresh-token".to_string(),
        refresh_token: Some("refresh-2".to_string()),
    }))
}

async fn protected_route(
    State(state): State<TestState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    *state.protected_hits.lock().await += 1;
    if *state.protected_always_401.lock().await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let expected = format!("Bearer {}", state.valid_token.lock().await);
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn slow_route() -> Json<serde_json::Value> {
    tokio::time::sleep(Duration::from_millis(150)).await;
    Json(json!({ "ok": true }))
}

async fn messages_route(
    State(state): State<TestState>,
    Path(room_id): Path<i64>,
) -> Json<serde_json::Value> {
    let messages: Vec<ChatMessagePayload> = state
        .history
        .lock()
        .await
        .iter()
        .filter(|message| message.room_id.0 == room_id)
        .cloned()
        .collect();
    Json(json!({ "messages": messages }))
}

async fn send_message_route(
    State(state): State<TestState>,
    Path(room_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Json<ChatMessagePayload> {
    let content = body["content"].as_str().unwrap_or_default().to_string();
    let mut next = state.next_message_id.lock().await;
    let message = ChatMessagePayload {
        message_id: MessageId(*next),
        room_id: RoomId(room_id),
        sender_id: UserId(42),
        content,
        sent_at: Some(Utc::now()),
        read_by_recipient: false,
    };
    *next += 1;
    drop(next);
    state.history.lock().await.push(message.clone());
    // The backend also broadcasts REST-sent messages on the room topic.
    state.inject(
        room_topic(message.room_id),
        serde_json::to_value(&message).expect("encode"),
    );
    Json(message)
}

async fn ws_route(State(state): State<TestState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| broker_session(socket, state))
}

async fn send_broker_frame(socket: &mut WebSocket, frame: &BrokerFrame) {
    let text = serde_json::to_string(frame).expect("encode frame");
    let _ = socket.send(WsMessage::Text(text)).await;
}

async fn broker_session(mut socket: WebSocket, state: TestState) {
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut inject_rx = state.inject_tx.subscribe();
    let mut drop_rx = state.drop_tx.subscribe();
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                        continue;
                    };
                    match frame {
                        ClientFrame::Connect { .. } => {
                            *state.connects.lock().await += 1;
                            send_broker_frame(&mut socket, &BrokerFrame::Connected).await;
                        }
                        ClientFrame::Subscribe { topic } => {
                            state.subscribe_log.lock().await.push(topic.clone());
                            subscribed.insert(topic);
                        }
                        ClientFrame::Unsubscribe { topic } => {
                            subscribed.remove(&topic);
                        }
                        ClientFrame::Publish { topic, body } => {
                            state.published.lock().await.push((topic.clone(), body.clone()));
                            if let Ok(outgoing) = serde_json::from_value::<OutgoingMessage>(body.clone()) {
                                let mut next = state.next_message_id.lock().await;
                                let message = ChatMessagePayload {
                                    message_id: MessageId(*next),
                                    room_id: outgoing.room_id,
                                    sender_id: outgoing.sender_id,
                                    content: outgoing.content,
                                    sent_at: outgoing.sent_at,
                                    read_by_recipient: false,
                                };
                                *next += 1;
                                drop(next);
                                state.history.lock().await.push(message.clone());
                                if subscribed.contains(&topic) {
                                    send_broker_frame(
                                        &mut socket,
                                        &BrokerFrame::Deliver {
                                            topic,
                                            body: serde_json::to_value(&message).expect("encode"),
                                        },
                                    )
                                    .await;
                                }
                            } else if subscribed.contains(&topic) {
                                // Read receipts and other bodies echo verbatim.
                                send_broker_frame(&mut socket, &BrokerFrame::Deliver { topic, body })
                                    .await;
                            }
                        }
                        ClientFrame::Ping => {
                            send_broker_frame(&mut socket, &BrokerFrame::Pong).await;
                        }
                        ClientFrame::Pong => {}
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            injected = inject_rx.recv() => {
                if let Ok((topic, body)) = injected {
                    if subscribed.contains(&topic) {
                        send_broker_frame(&mut socket, &BrokerFrame::Deliver { topic, body }).await;
                    }
                }
            }
            _ = drop_rx.recv() => break,
        }
    }
}

async fn spawn_backend() -> (Settings, TestState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = TestState::new();
    let app = Router::new()
        .route("/auth/login", post(login_route))
        .route("/auth/user", get(user_route))
        .route("/auth/refresh", post(refresh_route))
        .route("/protected", get(protected_route))
        .route("/slow", get(slow_route))
        .route(
            "/chat/rooms/:room_id/messages",
            get(messages_route).post(send_message_route),
        )
        .route("/ws", get(ws_route))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let settings = Settings {
        api_base_url: format!("http://{addr}"),
        broker_url: format!("http://{addr}/ws"),
        reconnect_delay_secs: 1,
        keepalive_interval_secs: 1,
        request_timeout_secs: 5,
    };
    (settings, state)
}

fn seed_message(id: i64, room: i64, sender: i64, minute: u32) -> ChatMessagePayload {
    ChatMessagePayload {
        message_id: MessageId(id),
        room_id: RoomId(room),
        sender_id: UserId(sender),
        content: format!("message {id}"),
        sent_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()),
        read_by_recipient: false,
    }
}

async fn stale_credential(runtime: &ClientRuntime) {
    runtime
        .store
        .replace(Credential {
            access_token: "stale-token".to_string(),
            refresh_token: "refresh-1".to_string(),
        })
        .await;
}

async fn wait_for_state(runtime: &ClientRuntime, want: ConnectionState) {
    let mut rx = runtime.subscribe_connection();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == want {
                break;
            }
            rx.changed().await.expect("state channel");
        }
    })
    .await
    .expect("connection state timeout");
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition timeout");
}

#[tokio::test]
async fn concurrent_refresh_calls_share_one_renewal() {
    let (settings, state) = spawn_backend().await;
    *state.refresh_delay.lock().await = Duration::from_millis(150);

    let store = CredentialStore::new();
    store
        .replace(Credential {
            access_token: "stale-token".to_string(),
            refresh_token: "refresh-1".to_string(),
        })
        .await;
    let coordinator =
        RefreshCoordinator::new(reqwest::Client::new(), &settings.api_base_url, store.clone());

    let outcomes = join_all((0..4).map(|_| coordinator.refresh())).await;
    assert_eq!(*state.refresh_calls.lock().await, 1);
    for outcome in outcomes {
        let credential = outcome.expect("refresh");
        assert_eq!(credential.access_token, "fresh-token");
    }
    assert_eq!(
        store.refresh_token().await.as_deref(),
        Some("refresh-2"),
        "rotated refresh token must be kept"
    );

    // The slot was emptied on settlement, so the next call is a new attempt.
    coordinator.refresh().await.expect("second refresh");
    assert_eq!(*state.refresh_calls.lock().await, 2);
}

#[tokio::test]
async fn missing_refresh_token_fails_without_network() {
    let (settings, state) = spawn_backend().await;
    let coordinator = RefreshCoordinator::new(
        reqwest::Client::new(),
        &settings.api_base_url,
        CredentialStore::new(),
    );

    let err = coordinator.refresh().await.expect_err("must fail");
    assert!(matches!(err, RefreshError::MissingRefreshToken));
    assert_eq!(*state.refresh_calls.lock().await, 0);
}

#[tokio::test]
async fn refresh_race_two_requests_one_renewal() {
    let (settings, state) = spawn_backend().await;
    *state.refresh_delay.lock().await = Duration::from_millis(100);
    let runtime = ClientRuntime::new(settings);
    stale_credential(&runtime).await;

    let (first, second) = tokio::join!(
        runtime.gateway.send(RequestDescriptor::get("/protected")),
        runtime.gateway.send(RequestDescriptor::get("/protected")),
    );
    first.expect("first request succeeds after retry");
    second.expect("second request succeeds after retry");

    assert_eq!(*state.refresh_calls.lock().await, 1);
    assert_eq!(*state.protected_hits.lock().await, 4);
    assert_eq!(
        runtime.store.access_token().await.as_deref(),
        Some("fresh-token")
    );
}

#[tokio::test]
async fn second_unauthorized_is_terminal() {
    let (settings, state) = spawn_backend().await;
    *state.protected_always_401.lock().await = true;
    let runtime = ClientRuntime::new(settings);
    stale_credential(&runtime).await;
    let mut events = runtime.subscribe_events();

    let err = runtime
        .gateway
        .send(RequestDescriptor::get("/protected"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, ClientError::CredentialExpired));
    // One original attempt plus exactly one retry, never a third.
    assert_eq!(*state.protected_hits.lock().await, 2);
    assert_eq!(*state.refresh_calls.lock().await, 1);
    assert!(runtime.store.current().await.is_none());

    let signed_out = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClientEvent::SignedOut { resume_path } = events.recv().await.expect("event") {
                break resume_path;
            }
        }
    })
    .await
    .expect("signed-out event timeout");
    assert_eq!(signed_out.as_deref(), Some("/protected"));
}

#[tokio::test]
async fn refresh_failure_clears_credentials_and_signs_out() {
    let (settings, state) = spawn_backend().await;
    *state.fail_refresh.lock().await = true;
    let runtime = ClientRuntime::new(settings);
    stale_credential(&runtime).await;
    let mut events = runtime.subscribe_events();

    let err = runtime
        .gateway
        .send(RequestDescriptor::get("/protected"))
        .await
        .expect_err("must fail");
    match err {
        ClientError::Refresh(RefreshError::Endpoint { status }) => assert_eq!(status, 500),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(runtime.store.current().await.is_none());

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClientEvent::SignedOut { .. } = events.recv().await.expect("event") {
                break;
            }
        }
    })
    .await
    .expect("signed-out event timeout");
}

struct OfflineProbe;

#[async_trait::async_trait]
impl ConnectivityProbe for OfflineProbe {
    async fn is_online(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn offline_dispatch_rejects_immediately() {
    let (settings, state) = spawn_backend().await;
    let runtime = ClientRuntime::new_with_connectivity(settings, Arc::new(OfflineProbe));
    stale_credential(&runtime).await;

    let err = runtime
        .gateway
        .send(RequestDescriptor::get("/protected"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(*state.protected_hits.lock().await, 0);
}

#[tokio::test]
async fn loading_flag_tracks_in_flight_requests() {
    let (settings, _state) = spawn_backend().await;
    let runtime = ClientRuntime::new(settings);
    let mut loading = runtime.subscribe_loading();
    assert!(!*loading.borrow());

    let gateway = Arc::clone(&runtime.gateway);
    let request = tokio::spawn(async move { gateway.send(RequestDescriptor::get("/slow")).await });

    tokio::time::timeout(Duration::from_secs(1), loading.changed())
        .await
        .expect("loading timeout")
        .expect("loading channel");
    assert!(*loading.borrow());

    tokio::time::timeout(Duration::from_secs(1), loading.changed())
        .await
        .expect("loading timeout")
        .expect("loading channel");
    assert!(!*loading.borrow());

    request.await.expect("join").expect("request");
}

#[tokio::test]
async fn open_room_requires_realtime_session() {
    let (settings, _state) = spawn_backend().await;
    let runtime = ClientRuntime::new(settings);

    let err = runtime
        .open_room(RoomId(1))
        .await
        .expect_err("must fail before connect");
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn history_and_live_merge_deduplicates_by_id() {
    let (settings, state) = spawn_backend().await;
    {
        let mut history = state.history.lock().await;
        history.push(seed_message(1, 1, 7, 0));
        history.push(seed_message(2, 1, 7, 1));
    }
    let runtime = ClientRuntime::new(settings);
    runtime.sign_in("mina@example.test", "pw").await.expect("sign in");
    wait_for_state(&runtime, ConnectionState::Connected).await;

    let session = runtime.open_room(RoomId(1)).await.expect("open room");
    let messages = session.messages();
    assert_eq!(messages.borrow().len(), 2);

    // Wait for the broker to register the room subscription before pushing.
    wait_until(|| {
        let state = state.clone();
        async move {
            state
                .subscribe_log
                .lock()
                .await
                .iter()
                .any(|topic| topic == &room_topic(RoomId(1)))
        }
    })
    .await;

    // Redelivery of a known id is a no-op, a fresh id is appended.
    state.inject(
        room_topic(RoomId(1)),
        serde_json::to_value(seed_message(2, 1, 7, 1)).expect("encode"),
    );
    state.inject(
        room_topic(RoomId(1)),
        serde_json::to_value(seed_message(3, 1, 7, 2)).expect("encode"),
    );

    wait_until(|| {
        let messages = messages.clone();
        async move { messages.borrow().len() == 3 }
    })
    .await;

    let ids: Vec<i64> = messages.borrow().iter().map(|m| m.message_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    session.close().await;
}

#[tokio::test]
async fn published_message_echo_reconciles_to_one_entry() {
    let (settings, state) = spawn_backend().await;
    let runtime = ClientRuntime::new(settings);
    runtime.sign_in("mina@example.test", "pw").await.expect("sign in");
    wait_for_state(&runtime, ConnectionState::Connected).await;

    let session = runtime.open_room(RoomId(1)).await.expect("open room");
    assert!(session.send("hello there").await);

    let messages = session.messages();
    wait_until(|| {
        let messages = messages.clone();
        async move {
            messages
                .borrow()
                .iter()
                .any(|m| m.content == "hello there")
        }
    })
    .await;

    let count = messages
        .borrow()
        .iter()
        .filter(|m| m.content == "hello there")
        .count();
    assert_eq!(count, 1);

    let room_publishes = state
        .published
        .lock()
        .await
        .iter()
        .filter(|(topic, _)| topic == &room_topic(RoomId(1)))
        .count();
    assert_eq!(room_publishes, 1);
    session.close().await;
}

#[tokio::test]
async fn reconnect_restores_subscriptions_and_refetch_covers_the_gap() {
    let (settings, state) = spawn_backend().await;
    {
        let mut history = state.history.lock().await;
        history.push(seed_message(1, 1, 7, 0));
    }
    let runtime = ClientRuntime::new(settings);
    runtime.sign_in("mina@example.test", "pw").await.expect("sign in");
    wait_for_state(&runtime, ConnectionState::Connected).await;

    let session = runtime.open_room(RoomId(1)).await.expect("open room");
    let messages = session.messages();
    assert_eq!(messages.borrow().len(), 1);

    // Make sure the first announcement reached the broker before severing.
    wait_until(|| {
        let state = state.clone();
        async move {
            state
                .subscribe_log
                .lock()
                .await
                .iter()
                .any(|topic| topic == &room_topic(RoomId(1)))
        }
    })
    .await;

    // Sever the socket; a peer message lands while the client is away.
    let _ = state.drop_tx.send(());
    state.history.lock().await.push(seed_message(50, 1, 7, 5));

    wait_until(|| {
        let state = state.clone();
        async move { *state.connects.lock().await >= 2 }
    })
    .await;
    wait_for_state(&runtime, ConnectionState::Connected).await;

    // The room topic was re-announced without any caller involvement.
    let announcements = state
        .subscribe_log
        .lock()
        .await
        .iter()
        .filter(|topic| *topic == &room_topic(RoomId(1)))
        .count();
    assert!(announcements >= 2, "expected re-subscription, got {announcements}");

    // The outage message is invisible until the caller re-fetches history.
    assert!(!messages.borrow().iter().any(|m| m.message_id.0 == 50));
    session.refresh().await.expect("refresh");
    assert!(messages.borrow().iter().any(|m| m.message_id.0 == 50));

    // A late live redelivery of the same message does not duplicate it.
    state.inject(
        room_topic(RoomId(1)),
        serde_json::to_value(seed_message(50, 1, 7, 5)).expect("encode"),
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    let occurrences = messages
        .borrow()
        .iter()
        .filter(|m| m.message_id.0 == 50)
        .count();
    assert_eq!(occurrences, 1);
    session.close().await;
}

#[tokio::test]
async fn read_receipts_acknowledge_foreign_unread_messages() {
    let (settings, state) = spawn_backend().await;
    {
        let mut history = state.history.lock().await;
        history.push(seed_message(1, 1, 7, 0)); // foreign, unread
        history.push(seed_message(2, 1, 42, 1)); // own message
    }
    let runtime = ClientRuntime::new(settings);
    runtime.sign_in("mina@example.test", "pw").await.expect("sign in");
    wait_for_state(&runtime, ConnectionState::Connected).await;

    let session = runtime.open_room(RoomId(1)).await.expect("open room");
    let messages = session.messages();

    // The tracker publishes a batched receipt, the broker echoes it, and the
    // echo marks the foreign message read locally.
    wait_until(|| {
        let messages = messages.clone();
        async move {
            messages
                .borrow()
                .iter()
                .any(|m| m.message_id.0 == 1 && m.read_by_recipient)
        }
    })
    .await;

    let receipts: Vec<ReadReceiptPayload> = state
        .published
        .lock()
        .await
        .iter()
        .filter(|(topic, _)| topic == &room_read_topic(RoomId(1)))
        .map(|(_, body)| serde_json::from_value(body.clone()).expect("receipt body"))
        .collect();
    assert!(!receipts.is_empty());
    for receipt in &receipts {
        assert!(receipt.message_ids.contains(&MessageId(1)));
        assert!(
            !receipt.message_ids.contains(&MessageId(2)),
            "own messages must not be acknowledged"
        );
    }

    // A peer acknowledging our own message marks it read; replaying the
    // receipt changes nothing.
    let receipt = serde_json::to_value(ReadReceiptPayload {
        message_ids: vec![MessageId(2)],
    })
    .expect("encode");
    state.inject(room_read_topic(RoomId(1)), receipt.clone());
    wait_until(|| {
        let messages = messages.clone();
        async move {
            messages
                .borrow()
                .iter()
                .any(|m| m.message_id.0 == 2 && m.read_by_recipient)
        }
    })
    .await;
    let before: Vec<ChatMessagePayload> = messages.borrow().clone();
    state.inject(room_read_topic(RoomId(1)), receipt);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after: Vec<ChatMessagePayload> = messages.borrow().clone();
    assert_eq!(
        before.iter().map(|m| m.read_by_recipient).collect::<Vec<_>>(),
        after.iter().map(|m| m.read_by_recipient).collect::<Vec<_>>()
    );
    session.close().await;
}

#[tokio::test]
async fn publish_fails_closed_and_rest_fallback_delivers() {
    let (settings, state) = spawn_backend().await;
    let runtime = ClientRuntime::new(settings);
    runtime.sign_in("mina@example.test", "pw").await.expect("sign in");
    wait_for_state(&runtime, ConnectionState::Connected).await;

    runtime.channel.disconnect().await;
    assert!(
        !runtime
            .channel
            .publish(&room_topic(RoomId(1)), json!({"anything": true}))
            .await
    );

    let message = runtime
        .chat()
        .send_message(RoomId(1), "sent over rest")
        .await
        .expect("rest fallback");
    assert_eq!(message.content, "sent over rest");
    assert!(state
        .history
        .lock()
        .await
        .iter()
        .any(|m| m.message_id == message.message_id));
}
