use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use signal_relay::auth::Claims;
use signal_relay::{routes, CallStatus, Config, Hub, HubHandle, Role, SignalKind, SignalMessage, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, HubHandle) {
    start_relay_with(&[]).await
}

async fn start_relay_with(overrides: &[(&str, &str)]) -> (SocketAddr, HubHandle) {
    let config = Config::from_lookup(|key| {
        if key == "JWT_SECRET" {
            return Some(SECRET.to_string());
        }
        overrides.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    })
    .unwrap();
    let (hub, _task) = Hub::spawn(config.hub());
    let app = routes::router(routes::AppState::new(&config, hub.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

fn token(user_id: UserId, role: Role) -> String {
    let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
    encode(
        &Header::default(),
        &Claims { sub: user_id, role, exp },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn wait_for_presence(hub: &HubHandle, user_id: UserId, connected: bool) {
    for _ in 0..250 {
        if hub.is_connected(user_id).await == connected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("user {user_id} never reached connected={connected}");
}

async fn join(addr: SocketAddr, hub: &HubHandle, user_id: UserId, role: Role) -> Client {
    let url = format!("ws://{addr}/ws?token={}", token(user_id, role));
    let (ws, _) = connect_async(url).await.unwrap();
    wait_for_presence(hub, user_id, true).await;
    ws
}

async fn send(ws: &mut Client, frame: &str) {
    ws.send(Message::text(frame)).await.unwrap();
}

async fn next_signal(ws: &mut Client) -> SignalMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return SignalMessage::decode(text.as_bytes()).unwrap();
        }
    }
}

#[tokio::test]
async fn relays_call_handshake_between_sockets() {
    let (addr, hub) = start_relay().await;
    let mut client = join(addr, &hub, 100, Role::Client).await;
    let mut specialist = join(addr, &hub, 200, Role::Specialist).await;

    send(&mut client, r#"{"type":"offer","session_id":"abc","from":42,"to":200,"data":{"sdp":"v=0"}}"#).await;
    let offer = next_signal(&mut specialist).await;
    assert_eq!(offer.kind, SignalKind::Offer);
    assert_eq!(offer.from, 100);
    assert_eq!(hub.active_call_for(100, 200).await.unwrap().status, CallStatus::Waiting);

    send(&mut specialist, r#"{"type":"answer","session_id":"abc","to":100,"data":{"sdp":"v=0"}}"#).await;
    let answer = next_signal(&mut client).await;
    assert_eq!((answer.kind, answer.from), (SignalKind::Answer, 200));
    assert_eq!(hub.active_call_for(100, 200).await.unwrap().status, CallStatus::Active);

    send(&mut client, r#"{"type":"end","session_id":"abc","to":200}"#).await;
    assert_eq!(next_signal(&mut specialist).await.kind, SignalKind::End);
    assert!(hub.active_call_for(100, 200).await.is_none());
    assert_eq!(hub.session("abc").await.unwrap().status, CallStatus::Ended);
}

#[tokio::test]
async fn offline_callee_yields_error_frame() {
    let (addr, hub) = start_relay().await;
    let mut client = join(addr, &hub, 100, Role::Client).await;

    send(&mut client, r#"{"type":"offer","session_id":"xyz","to":999}"#).await;
    let reply = next_signal(&mut client).await;
    assert_eq!(reply.kind, SignalKind::Error);
    assert_eq!(reply.session_id, "xyz");
}

#[tokio::test]
async fn malformed_frame_does_not_drop_connection() {
    let (addr, hub) = start_relay().await;
    let mut client = join(addr, &hub, 100, Role::Client).await;

    send(&mut client, "{this is not json").await;
    send(&mut client, r#"{"type":"ping","session_id":"p1"}"#).await;

    let pong = next_signal(&mut client).await;
    assert_eq!(pong.kind, SignalKind::Pong);
    assert_eq!(pong.session_id, "p1");
    assert!(hub.is_connected(100).await);
}

#[tokio::test]
async fn upgrade_requires_valid_token() {
    let (addr, hub) = start_relay().await;

    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws?token=garbage")).await.is_err());
    assert_eq!(hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn reconnect_supersedes_previous_socket() {
    let (addr, hub) = start_relay().await;
    let mut first = join(addr, &hub, 100, Role::Client).await;
    let mut second = join(addr, &hub, 100, Role::Client).await;

    // The first socket is closed by the relay
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);

    assert_eq!(hub.stats().await.unwrap().connections, 1);
    send(&mut second, r#"{"type":"ping"}"#).await;
    assert_eq!(next_signal(&mut second).await.kind, SignalKind::Pong);
}

#[tokio::test]
async fn closing_socket_unregisters_user() {
    let (addr, hub) = start_relay().await;
    let mut client = join(addr, &hub, 100, Role::Client).await;

    client.close(None).await.unwrap();
    wait_for_presence(&hub, 100, false).await;
}

#[tokio::test]
async fn silent_peer_is_dropped_after_keepalive_deadline() {
    let (addr, hub) = start_relay_with(&[("RELAY_PING_INTERVAL_SECS", "1"), ("RELAY_PONG_WAIT_SECS", "2")]).await;

    // Never polled, so the relay's pings go unanswered
    let _silent = join(addr, &hub, 100, Role::Client).await;
    wait_for_presence(&hub, 100, false).await;
}
