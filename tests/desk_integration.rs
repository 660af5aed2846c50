//! End-to-end run of the real HTTP and WebSocket adapters against an
//! in-process axum stub of the chat backend and its STOMP endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use frames::{Command, Frame, Inbound};
use serde_json::{Value, json};
use supportdesk::{
    ChatPhase, CurrentUser, QueueTab, SenderRole, SessionContext, SupportDesk, SupportDeskConfig, TokenProvider,
    UserRole,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Stub {
    /// Authorization header of every REST request, by path.
    rest_auth: Mutex<Vec<(String, Option<String>)>>,
    /// Authorization header of every STOMP CONNECT.
    stomp_auth: Mutex<Vec<Option<String>>>,
    /// (subscription id, destination) of every SUBSCRIBE.
    subscriptions: Mutex<Vec<(String, String)>>,
    unassigned: Mutex<Vec<Value>>,
    mine: Mutex<Vec<Value>>,
    mine_status: Mutex<Option<StatusCode>>,
}

impl Stub {
    fn record(&self, path: &str, headers: &HeaderMap) {
        let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_owned);
        self.rest_auth.lock().unwrap().push((path.to_owned(), auth));
    }

    fn subscribed(&self, destination: &str) -> bool {
        self.subscriptions.lock().unwrap().iter().any(|(_, d)| d == destination)
    }

    fn subscription_for(&self, destination: &str) -> Option<String> {
        self.subscriptions.lock().unwrap().iter().find(|(_, d)| d == destination).map(|(id, _)| id.clone())
    }
}

type Shared = Arc<Stub>;

async fn my_chats(State(stub): State<Shared>, headers: HeaderMap) -> Response {
    stub.record("/client/chats", &headers);
    axum::Json(json!([
        {"id": 1, "clientEmail": "client@bank.test", "lastMessage": "old", "closed": true},
        {"id": 2, "clientEmail": "client@bank.test", "lastMessage": "hello", "closed": false}
    ]))
    .into_response()
}

async fn start_chat(State(stub): State<Shared>, headers: HeaderMap) -> Response {
    stub.record("/client/chats/start", &headers);
    axum::Json(json!({"id": 3, "closed": false})).into_response()
}

async fn chat_messages(State(stub): State<Shared>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    stub.record(&format!("/chats/{id}/messages"), &headers);
    axum::Json(json!([
        {"id": 10, "content": "hello", "date": "2025-03-01T09:00:00", "senderType": "CLIENT",
         "sender": {"email": "client@bank.test", "role": "CLIENT"}}
    ]))
    .into_response()
}

async fn unassigned(State(stub): State<Shared>, headers: HeaderMap) -> Response {
    stub.record("/support/chats/unassigned", &headers);
    axum::Json(Value::Array(stub.unassigned.lock().unwrap().clone())).into_response()
}

async fn mine(State(stub): State<Shared>, headers: HeaderMap) -> Response {
    stub.record("/support/chats", &headers);
    if let Some(status) = *stub.mine_status.lock().unwrap() {
        return (status, "denied").into_response();
    }
    axum::Json(Value::Array(stub.mine.lock().unwrap().clone())).into_response()
}

async fn assign(State(stub): State<Shared>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    stub.record(&format!("/support/chats/{id}/assign"), &headers);
    let mut unassigned = stub.unassigned.lock().unwrap();
    let Some(pos) = unassigned.iter().position(|c| c["id"] == json!(id)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let chat = unassigned.remove(pos);
    stub.mine.lock().unwrap().push(chat);
    // The backend answers with a conflict even though the assignment committed.
    StatusCode::CONFLICT.into_response()
}

async fn stomp(State(stub): State<Shared>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_stomp(socket, stub))
}

async fn serve_stomp(mut socket: WebSocket, stub: Shared) {
    let mut next_id = 500;
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else { continue };
        let Ok(items) = frames::decode(text.as_str()) else { continue };
        for item in items {
            let Inbound::Frame(frame) = item else { continue };
            let replies = match frame.command {
                Command::Connect => {
                    stub.stomp_auth.lock().unwrap().push(frame.header("Authorization").map(str::to_owned));
                    vec![Frame::new(Command::Connected).with_header("version", "1.2").with_header("heart-beat", "0,0")]
                }
                Command::Subscribe => {
                    let id = frame.header("id").unwrap_or_default().to_owned();
                    let destination = frame.header("destination").unwrap_or_default().to_owned();
                    stub.subscriptions.lock().unwrap().push((id, destination));
                    Vec::new()
                }
                Command::Send => {
                    next_id += 1;
                    let destination = frame.header("destination").unwrap_or_default();
                    let chat = destination.trim_start_matches("/app/chats/").trim_end_matches("/send");
                    let topic = format!("/topic/chats/{chat}");
                    let Some(subscription) = stub.subscription_for(&topic) else { continue };
                    let content: Value = serde_json::from_str(&frame.body).unwrap_or(Value::Null);
                    let body = json!({
                        "id": next_id, "content": content["content"], "date": "2025-03-01T09:01:00",
                        "senderRole": "CLIENT", "senderEmail": "client@bank.test"
                    });
                    vec![
                        Frame::new(Command::Message)
                            .with_header("destination", topic)
                            .with_header("subscription", subscription)
                            .with_header("message-id", next_id.to_string())
                            .with_body(body.to_string()),
                    ]
                }
                Command::Disconnect => return,
                _ => Vec::new(),
            };
            for reply in replies {
                if socket.send(WsMessage::Text(frames::encode_frame(&reply).into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn start_backend(stub: Shared) -> String {
    let app = Router::new()
        .route("/client/chats", get(my_chats))
        .route("/client/chats/start", post(start_chat))
        .route("/client/chats/{id}/messages", get(chat_messages))
        .route("/support/chats/unassigned", get(unassigned))
        .route("/support/chats", get(mine))
        .route("/support/chats/{id}/assign", put(assign))
        .route("/support/chats/{id}/messages", get(chat_messages))
        .route("/ws/websocket", get(stomp))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn session(role: UserRole) -> Arc<SessionContext> {
    let session = Arc::new(SessionContext::new());
    session.sign_in(CurrentUser { email: "user@bank.test".into(), role }, "jwt-int");
    session
}

fn config(base_url: &str) -> SupportDeskConfig {
    let mut config = SupportDeskConfig::default().with_base_url(base_url).unwrap();
    config.connect_wait = WAIT;
    config.refresh_interval = Duration::ZERO;
    config
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn client_chat_over_real_adapters() {
    let stub = Shared::default();
    let base_url = start_backend(stub.clone()).await;
    let desk = SupportDesk::new(config(&base_url), session(UserRole::Client)).unwrap();

    let chat = desk.client_chat();
    let session = tokio::time::timeout(WAIT, chat.init()).await.unwrap().unwrap();

    assert_eq!(session.id, 2);
    assert_eq!(chat.phase(), ChatPhase::Active);
    let history = chat.snapshot().messages;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, SenderRole::Client);
    assert_eq!(history[0].sender_email.as_deref(), Some("client@bank.test"));

    eventually("chat topic subscription", || stub.subscribed("/topic/chats/2")).await;
    chat.send("my card is blocked").unwrap();
    eventually("echo", || chat.snapshot().messages.len() == 2).await;
    assert_eq!(chat.snapshot().messages[1].content, "my card is blocked");

    assert_eq!(stub.stomp_auth.lock().unwrap().as_slice(), &[Some("Bearer jwt-int".to_owned())]);
    assert!(
        stub.rest_auth
            .lock()
            .unwrap()
            .iter()
            .all(|(_, auth)| auth.as_deref() == Some("Bearer jwt-int"))
    );

    desk.dispose();
}

#[tokio::test]
async fn support_assign_over_real_adapters() {
    let stub = Shared::default();
    *stub.unassigned.lock().unwrap() = vec![
        json!({"id": 4, "clientEmail": "a@bank.test", "lastMessage": "help", "closed": false}),
        json!({"id": 5, "clientEmail": "b@bank.test", "lastMessage": "", "closed": false}),
    ];
    let base_url = start_backend(stub.clone()).await;
    let desk = SupportDesk::new(config(&base_url), session(UserRole::Support)).unwrap();

    let queue = desk.support_queue();
    let report = tokio::time::timeout(WAIT, queue.init()).await.unwrap();
    assert!(report.unassigned.is_ok() && report.mine.is_ok());
    assert_eq!(queue.snapshot().unassigned.iter().map(|c| c.id).collect::<Vec<_>>(), vec![4]);
    eventually("queue topic subscription", || stub.subscribed("/topic/support/unassigned")).await;

    tokio::time::timeout(WAIT, queue.assign(4)).await.unwrap().unwrap();

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.tab, QueueTab::Mine);
    assert_eq!(snapshot.selected.map(|c| c.id), Some(4));
    assert_eq!(snapshot.messages.len(), 1);
    eventually("selected chat subscription", || stub.subscribed("/topic/chats/4")).await;

    desk.dispose();
}

#[tokio::test]
async fn unauthorized_response_signs_the_user_out() {
    let stub = Shared::default();
    *stub.mine_status.lock().unwrap() = Some(StatusCode::UNAUTHORIZED);
    let base_url = start_backend(stub.clone()).await;
    let session = session(UserRole::Support);
    let desk = SupportDesk::new(config(&base_url), session.clone()).unwrap();

    let report = desk.support_queue().refresh_lists().await;

    assert_eq!(report.mine.unwrap_err().status(), Some(401));
    assert!(report.unassigned.is_ok());
    assert!(!session.is_authenticated());
    assert_eq!(session.token(), None);
}
