use super::*;

use crate::session::{SessionContext, UserRole};
use crate::testing::{FakeBroker, WAIT, eventually, fast_config, signed_in};

fn manager(broker: &FakeBroker, config: ConnectionConfig) -> ConnectionManager {
    ConnectionManager::new(
        "ws://broker.test:8080/ws/websocket",
        Arc::new(broker.clone()),
        signed_in(UserRole::Client),
        config,
    )
}

async fn connect(manager: &ConnectionManager) -> Result<(), ConnectionError> {
    tokio::time::timeout(WAIT, manager.connect()).await.expect("connect timed out")
}

#[tokio::test]
async fn connect_sends_credentials_and_heart_beat() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());

    connect(&manager).await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    let connects = broker.received(Command::Connect);
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].header("Authorization"), Some("Bearer jwt-test"));
    assert_eq!(connects[0].header("host"), Some("broker.test:8080"));
    assert_eq!(connects[0].header("heart-beat"), Some("0,0"));
}

#[tokio::test]
async fn connect_without_token_sends_no_authorization() {
    let broker = FakeBroker::new();
    let manager = ConnectionManager::new(
        "ws://broker.test/ws/websocket",
        Arc::new(broker.clone()),
        Arc::new(SessionContext::new()),
        fast_config(),
    );

    connect(&manager).await.unwrap();
    assert_eq!(broker.received(Command::Connect)[0].header("Authorization"), None);
}

#[tokio::test]
async fn connect_is_idempotent() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());

    let (a, b) = tokio::join!(manager.connect(), manager.connect());
    a.unwrap();
    b.unwrap();
    connect(&manager).await.unwrap();

    assert_eq!(broker.opens(), 1);
    assert_eq!(broker.received(Command::Connect).len(), 1);
}

#[tokio::test]
async fn disconnect_when_idle_is_noop() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());

    manager.disconnect();
    manager.disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.epoch(), 0);
    assert_eq!(broker.opens(), 0);
}

#[tokio::test]
async fn disconnect_sends_disconnect_and_allows_reconnect() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());
    connect(&manager).await.unwrap();

    manager.disconnect();
    eventually("DISCONNECT frame", || broker.received(Command::Disconnect).len() == 1).await;
    eventually("disconnected state", || manager.state() == ConnectionState::Disconnected).await;
    manager.disconnect();

    connect(&manager).await.unwrap();
    assert_eq!(broker.opens(), 2);
}

#[tokio::test]
async fn subscribe_and_send_fail_fast_when_not_connected() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());
    let handler: FrameHandler = Arc::new(|_: &Frame| {});

    assert_eq!(manager.subscribe("/topic/chats/1", handler).unwrap_err(), ConnectionError::NotConnected);
    assert_eq!(
        manager.send(Frame::send_json("/app/chats/1/send", "{}")).unwrap_err(),
        ConnectionError::NotConnected
    );
}

#[tokio::test]
async fn message_frames_reach_their_subscription_handler() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());
    connect(&manager).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: FrameHandler = Arc::new(move |frame: &Frame| {
        sink.lock().unwrap().push(frame.body.clone());
    });
    manager.subscribe("/topic/chats/3", handler).unwrap();
    eventually("broker subscription", || broker.subscriptions_to("/topic/chats/3") == 1).await;

    broker.send_raw("NOT A FRAME\n\n\0");
    broker.publish("/topic/chats/4", "elsewhere");
    broker.publish("/topic/chats/3", r#"{"id":1}"#);

    eventually("delivery", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0], r#"{"id":1}"#);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn unsubscribe_sends_unsubscribe_frame() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());
    connect(&manager).await.unwrap();

    let handler: FrameHandler = Arc::new(|_: &Frame| {});
    let subscription = manager.subscribe("/topic/chats/3", handler).unwrap();
    eventually("broker subscription", || broker.subscriptions_to("/topic/chats/3") == 1).await;

    manager.unsubscribe(&subscription.id);
    manager.unsubscribe(&subscription.id);
    eventually("broker unsubscription", || broker.subscriptions_to("/topic/chats/3") == 0).await;
    assert_eq!(broker.received(Command::Unsubscribe).len(), 1);
}

#[tokio::test]
async fn reconnects_after_link_drop_and_advances_epoch() {
    let broker = FakeBroker::new();
    let manager = manager(&broker, fast_config());
    connect(&manager).await.unwrap();
    assert_eq!(manager.epoch(), 0);

    broker.drop_link();

    eventually("second open", || broker.opens() == 2).await;
    eventually("reconnected", || manager.is_connected()).await;
    assert_eq!(manager.epoch(), 1);
}

#[tokio::test]
async fn first_failure_is_reported_while_retrying() {
    let broker = FakeBroker::new();
    broker.refuse_next_opens(1);
    let manager = manager(&broker, fast_config());

    let error = connect(&manager).await.unwrap_err();
    assert!(matches!(error, ConnectionError::Transport(_)));

    eventually("retry connected", || manager.is_connected()).await;
    assert_eq!(broker.opens(), 2);
    connect(&manager).await.unwrap();
}

#[tokio::test]
async fn broker_error_during_handshake_is_surfaced() {
    let broker = FakeBroker::new();
    broker.reject_connect("Bad token");
    let config = ConnectionConfig { reconnect_delay: Duration::ZERO, ..fast_config() };
    let manager = manager(&broker, config);

    assert_eq!(connect(&manager).await.unwrap_err(), ConnectionError::Broker("Bad token".into()));
    eventually("driver stopped", || manager.state() == ConnectionState::Disconnected).await;
    assert_eq!(broker.opens(), 1);
}

#[tokio::test]
async fn sends_heart_beats_at_negotiated_interval() {
    let broker = FakeBroker::new();
    broker.set_heart_beat(HeartBeat::new(0, 30));
    let config = ConnectionConfig { heart_beat: HeartBeat::new(20, 0), ..fast_config() };
    let manager = manager(&broker, config);
    connect(&manager).await.unwrap();

    eventually("client heart-beats", || broker.heartbeats() >= 2).await;
    assert!(manager.is_connected());
}

#[tokio::test]
async fn silent_broker_trips_the_watchdog() {
    let broker = FakeBroker::new();
    broker.set_heart_beat(HeartBeat::new(40, 0));
    let config = ConnectionConfig { heart_beat: HeartBeat::new(0, 40), ..fast_config() };
    let manager = manager(&broker, config);
    connect(&manager).await.unwrap();

    eventually("reconnect after silence", || broker.opens() >= 2).await;
}

#[test]
fn host_of_strips_scheme_path_and_credentials() {
    assert_eq!(host_of("ws://localhost:8080/ws/websocket"), "localhost:8080");
    assert_eq!(host_of("wss://user:pw@bank.test/ws?x=1"), "bank.test");
    assert_eq!(host_of("bank.test"), "bank.test");
}
