//! End-to-end tests against a real listener with a `tokio-tungstenite` client.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use portico_core::{Opcode, ServerState};
use portico_server::{
    AuthScheme, Behavior, IncomingMessage, ServerConfig, ServerError, Session, SessionRegistry,
    WebSocketServer,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const TIMEOUT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Behaviors ──

struct Echo;

#[async_trait]
impl Behavior for Echo {
    async fn on_message(&mut self, session: &Arc<Session>, message: IncomingMessage) {
        let payload = Bytes::copy_from_slice(message.as_bytes());
        let _ = session.send(message.opcode(), payload).await;
    }
}

/// Relays every text message to all sessions of the service.
struct Chat;

#[async_trait]
impl Behavior for Chat {
    async fn on_message(&mut self, session: &Arc<Session>, message: IncomingMessage) {
        let Some(text) = message.as_text() else {
            return;
        };
        if let Some(registry) = session.sessions() {
            let _ = registry
                .broadcast(Opcode::Text, Bytes::from(text.to_string()))
                .await;
        }
    }
}

// ── Helpers ──

fn config() -> ServerConfig {
    ServerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn boot(config: ServerConfig) -> (WebSocketServer, String) {
    let server = WebSocketServer::new(config);
    server.add_websocket_service("/echo", || Echo).unwrap();
    server.add_websocket_service("/chat", || Chat).unwrap();
    server.start().unwrap();
    let base = format!("ws://{}", server.local_addr().unwrap());
    (server, base)
}

async fn connect(url: &str) -> Client {
    let (client, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    client
}

async fn rejected_status(request: impl IntoClientRequest + Unpin) -> StatusCode {
    match timeout(TIMEOUT, connect_async(request)).await.unwrap() {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status(),
        Err(other) => panic!("expected HTTP rejection, got {other}"),
        Ok(_) => panic!("expected HTTP rejection, upgrade succeeded"),
    }
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let message = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

async fn wait_for_count(registry: &SessionRegistry, count: usize) {
    timeout(TIMEOUT, async {
        while registry.count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} sessions, have {}", registry.count()));
}

/// Keep reading so pings are answered; returns every close frame seen.
fn keep_reading(mut client: Client) -> tokio::task::JoinHandle<Vec<Option<u16>>> {
    tokio::spawn(async move {
        let mut closes = Vec::new();
        while let Some(Ok(message)) = client.next().await {
            if let Message::Close(frame) = message {
                closes.push(frame.map(|frame| u16::from(frame.code)));
            }
        }
        closes
    })
}

// ── Tests ──

#[tokio::test]
async fn echo_round_trip() {
    let (server, base) = boot(config());
    let mut client = connect(&format!("{base}/echo")).await;

    client.send(Message::text("hello")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "hello");

    client
        .send(Message::binary(Bytes::from_static(&[9, 8, 7])))
        .await
        .unwrap();
    let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::binary(Bytes::from_static(&[9, 8, 7])));

    client.close(None).await.unwrap();
    let registry = Arc::clone(server.service("/echo").unwrap().registry());
    wait_for_count(&registry, 0).await;
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn trailing_slash_and_query_reach_the_service() {
    let (server, base) = boot(config());
    let mut client = connect(&format!("{base}/echo/?room=1")).await;
    client.send(Message::text("ok")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "ok");
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn unknown_path_is_not_implemented() {
    let (server, base) = boot(config());
    assert_eq!(
        rejected_status(format!("{base}/nowhere")).await,
        StatusCode::NOT_IMPLEMENTED
    );
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn auth_none_rejects_everyone() {
    let server = WebSocketServer::new(config());
    server.add_websocket_service("/echo", || Echo).unwrap();
    assert!(server.set_auth_scheme(AuthScheme::None));
    server.start().unwrap();
    let url = format!("ws://{}/echo", server.local_addr().unwrap());

    assert_eq!(rejected_status(url).await, StatusCode::FORBIDDEN);
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn basic_auth_challenge_and_credentials() {
    let server = WebSocketServer::new(config());
    server.add_websocket_service("/echo", || Echo).unwrap();
    let users = BTreeMap::from([("alice".to_string(), "secret".to_string())]);
    assert!(server.set_auth_scheme(AuthScheme::basic_from_table("portico", users)));
    server.start().unwrap();
    let url = format!("ws://{}/echo", server.local_addr().unwrap());

    match timeout(TIMEOUT, connect_async(url.as_str())).await.unwrap() {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()[WWW_AUTHENTICATE], "Basic realm=\"portico\"");
        }
        Err(other) => panic!("expected 401, got {other}"),
        Ok(_) => panic!("expected 401, upgrade succeeded"),
    }

    let with_credentials = |credentials: &str| {
        let mut request = url.as_str().into_client_request().unwrap();
        let value = format!("Basic {}", STANDARD.encode(credentials));
        let _ = request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        request
    };

    assert_eq!(
        rejected_status(with_credentials("alice:wrong")).await,
        StatusCode::FORBIDDEN
    );

    let (mut client, _) = connect_async(with_credentials("alice:secret")).await.unwrap();
    client.send(Message::text("in")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "in");
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn hot_added_service_is_reachable() {
    let (server, base) = boot(config());
    assert_eq!(
        rejected_status(format!("{base}/late")).await,
        StatusCode::NOT_IMPLEMENTED
    );

    server.add_websocket_service("/late", || Echo).unwrap();
    let mut client = connect(&format!("{base}/late")).await;
    client.send(Message::text("made it")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "made it");
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn removed_service_closes_sessions_going_away() {
    let (server, base) = boot(config());
    let client = connect(&format!("{base}/echo")).await;
    let registry = Arc::clone(server.service("/echo").unwrap().registry());
    wait_for_count(&registry, 1).await;
    let reader = keep_reading(client);

    assert!(server.remove_websocket_service("/echo").await);
    let closes = timeout(TIMEOUT, reader).await.unwrap().unwrap();
    assert_eq!(closes, vec![Some(u16::from(CloseCode::Away))]);

    assert_eq!(
        rejected_status(format!("{base}/echo")).await,
        StatusCode::NOT_IMPLEMENTED
    );
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn sweep_evicts_unresponsive_client() {
    let config = ServerConfig {
        wait_time: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(300),
        ..config()
    };
    let (server, base) = boot(config);
    let url = format!("{base}/chat");

    let _first = keep_reading(connect(&url).await);
    let _second = keep_reading(connect(&url).await);
    // Never polled, so it never answers a ping.
    let _idle = connect(&url).await;

    let registry = Arc::clone(server.service("/chat").unwrap().registry());
    wait_for_count(&registry, 3).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(registry.count(), 2);
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, base) = boot(config());
    let url = format!("{base}/chat");
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(connect(&url).await);
    }
    let registry = Arc::clone(server.service("/chat").unwrap().registry());
    wait_for_count(&registry, 4).await;

    let summary = registry
        .broadcast(Opcode::Text, Bytes::from_static(b"news"))
        .await
        .unwrap();
    assert_eq!(summary.delivered, 4);
    for client in &mut clients {
        assert_eq!(next_text(client).await, "news");
    }

    // A chat message from one client fans out to all of them.
    clients[0].send(Message::text("from zero")).await.unwrap();
    for client in &mut clients {
        assert_eq!(next_text(client).await, "from zero");
    }
    server.stop(1000, "").await.unwrap();
}

#[tokio::test]
async fn stop_closes_clients_with_the_given_code() {
    let (server, base) = boot(config());
    let readers: Vec<_> = [
        connect(&format!("{base}/echo")).await,
        connect(&format!("{base}/chat")).await,
    ]
    .into_iter()
    .map(keep_reading)
    .collect();
    wait_for_count(server.service("/echo").unwrap().registry(), 1).await;
    wait_for_count(server.service("/chat").unwrap().registry(), 1).await;

    server.stop(1001, "server going down").await.unwrap();
    assert_eq!(server.state(), ServerState::Stop);
    server.wait().await.unwrap();

    for reader in readers {
        let closes = timeout(TIMEOUT, reader).await.unwrap().unwrap();
        assert_eq!(closes, vec![Some(1001)]);
    }
    assert!(TcpStream::connect(server.local_addr().unwrap()).await.is_err());
}

#[tokio::test]
async fn lifecycle_errors() {
    let (server, _) = boot(config());
    assert!(matches!(
        server.add_websocket_service("/echo", || Echo),
        Err(ServerError::DuplicatePath(_))
    ));
    server.start().unwrap();
    server.stop(1000, "").await.unwrap();
    server.stop(1000, "").await.unwrap();
    assert!(matches!(server.start(), Err(ServerError::AlreadyStopped)));
}
