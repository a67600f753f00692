#![allow(dead_code)]

use futures::StreamExt;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::Level;
use windsock::auth::unix_seconds;
use windsock::auth::TokenAuthenticator;
use windsock::broker::memory::{self, MemoryPublisher, RequestLog};
use windsock::config::Config;
use windsock::Gateway;

pub const SECRET: &str = "test-secret";
pub const WAIT: Duration = Duration::from_secs(2);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

static INIT: std::sync::Once = std::sync::Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse::<Level>().ok())
            .unwrap_or(Level::INFO);

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .init();
    });
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.log_level = "info".to_string();
    config.server.listen = "127.0.0.1:0".to_string();
    config.auth.secret = SECRET.to_string();
    config.broker.retry_backoff_ms = 1;
    config.broker.max_backoff_ms = 5;
    config
}

pub struct TestGateway {
    pub gateway: Gateway,
    pub address: String,
    pub publisher: MemoryPublisher,
    pub requests: RequestLog,
}

pub async fn start_gateway(config: Config) -> TestGateway {
    let (publisher, subscriber) = memory::subscription(64);
    let (requester, requests) = memory::requests(64);
    let gateway = windsock::start(config, Box::new(subscriber), Box::new(requester))
        .await
        .unwrap();
    let address = gateway.address().await.unwrap();
    TestGateway {
        gateway,
        address,
        publisher,
        requests,
    }
}

pub fn token_at(identity: &str, subscribe: &str, publish: &str, issued_at: i64) -> String {
    TokenAuthenticator::new(SECRET, Duration::from_secs(60))
        .unwrap()
        .issue(identity, subscribe, publish, issued_at, "nonce", "127.0.0.1")
        .unwrap()
}

pub fn token(identity: &str, subscribe: &str, publish: &str) -> String {
    token_at(identity, subscribe, publish, unix_seconds(SystemTime::now()))
}

pub fn socket_url(address: &str, path: &str, token: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("ws://{address}{path}?token={encoded}")
}

pub async fn connect(address: &str, token: &str) -> Client {
    let (client, _) = timeout(
        WAIT,
        tokio_tungstenite::connect_async(socket_url(address, "/socket/", token)),
    )
    .await
    .unwrap()
    .unwrap();
    client
}

/// Wait until the gateway has registered `count` sessions
pub async fn wait_for_clients(gateway: &Gateway, count: i64) {
    let stats = gateway.stats();
    timeout(WAIT, async {
        while stats.snapshot().clients_current != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

pub async fn next_message<S>(client: &mut WebSocketStream<S>) -> Message
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap()
}

pub async fn next_text<S>(client: &mut WebSocketStream<S>) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match next_message(client).await {
        Message::Text(text) => text.as_str().to_owned(),
        other => panic!("expected text, got {other:?}"),
    }
}
