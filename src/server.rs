use crate::auth::{self, AuthError, Authenticator, ConnectionIdentity};
use crate::bridge::{BridgeContext, BrokerBridge, RetryPolicy};
use crate::broker::{Requester, Subscriber};
use crate::config::{Config, ServerConfig};
use crate::health::Health;
use crate::metrics::Stats;
use crate::router::Room;
use crate::session::{close_frame, Session, SessionContext};
use crate::transport::{self, Incoming, Listener};
use anyhow::Context as _;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long a refused client gets to acknowledge the close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept, so a persistent error such as EMFILE does
/// not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Gateway failed to start: {0}")]
    StartupFailed(String),
    #[error("Gateway is already running")]
    AlreadyRunning,
    #[error("Gateway is not running")]
    NotRunning,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Static function to start a gateway with the given configuration and broker
/// transports
pub async fn start(
    config: Config,
    subscriber: Box<dyn Subscriber>,
    requester: Box<dyn Requester>,
) -> Result<Gateway> {
    let gateway = Gateway::new(config);
    gateway.start(subscriber, requester).await?;
    Ok(gateway)
}

pub struct Gateway {
    config: Config,
    stats: Arc<Stats>,
    health: Arc<Health>,
    shutdown_token: CancellationToken,
    running: AtomicBool,
    server_handle: Mutex<Option<JoinHandle<()>>>,
    room_handle: Mutex<Option<JoinHandle<()>>>,
    bridge: Mutex<Option<BrokerBridge>>,
    address: RwLock<Option<String>>,
}

/// Shared by the accept loop and every connection task
struct Acceptor {
    server: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    session: SessionContext,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        let shutdown_token = CancellationToken::new();
        Self {
            config,
            stats: Arc::new(Stats::new()),
            // A failed bridge pipeline takes the whole gateway down.
            health: Arc::new(Health::new(shutdown_token.clone())),
            shutdown_token,
            running: AtomicBool::new(false),
            server_handle: Mutex::new(None),
            room_handle: Mutex::new(None),
            bridge: Mutex::new(None),
            address: RwLock::new(None),
        }
    }

    pub async fn start(
        &self,
        subscriber: Box<dyn Subscriber>,
        requester: Box<dyn Requester>,
    ) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyRunning);
        }
        if self.shutdown_token.is_cancelled() {
            return Err(ServerError::StartupFailed("gateway has already been stopped".into()));
        }
        self.config
            .validate()
            .map_err(|e| ServerError::StartupFailed(e.to_string()))?;
        let authenticator = auth::new(&self.config.auth)
            .map_err(|e| ServerError::StartupFailed(e.to_string()))?;

        info!(version = crate::VERSION, "Starting gateway");

        let listener = self.bind().await?;
        let bound_addr = listener
            .local_addr()
            .map_err(|e| ServerError::StartupFailed(format!("Failed to get local address: {e}")))?;
        *self.address.write().await = Some(bound_addr.to_string());
        info!(path = %self.config.server.path, "Gateway listening on {}", bound_addr);

        let (room, room_handle) =
            Room::spawn(self.config.session.slow_consumer, Arc::clone(&self.stats));
        let (client_messages, outbound_queue) = mpsc::channel(self.config.session.inbound_capacity);

        let bridge = BrokerBridge::spawn(
            subscriber,
            requester,
            outbound_queue,
            BridgeContext {
                room: room.clone(),
                stats: Arc::clone(&self.stats),
                health: Arc::clone(&self.health),
                retry: RetryPolicy::from_config(&self.config.broker),
                request_timeout: self.config.broker.request_timeout(),
            },
            self.shutdown_token.clone(),
        );

        let acceptor = Arc::new(Acceptor {
            server: self.config.server.clone(),
            authenticator,
            session: SessionContext {
                room,
                client_messages,
                stats: Arc::clone(&self.stats),
                outbound_capacity: self.config.session.outbound_capacity,
                shutdown: self.shutdown_token.clone(),
            },
        });

        let shutdown_token = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            Self::run_server(listener, acceptor, shutdown_token).await;
        });

        *self.server_handle.lock().await = Some(handle);
        *self.room_handle.lock().await = Some(room_handle);
        *self.bridge.lock().await = Some(bridge);

        self.running.store(true, Ordering::Release);
        info!("Gateway started successfully");
        Ok(())
    }

    /// Stop accepting, close every session, then wind the broker bridge
    /// down once the last queued client message has been forwarded
    pub async fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ServerError::NotRunning);
        }

        info!("Stopping gateway");
        self.shutdown_token.cancel();

        // The accept loop returns only after every connection task is done.
        if let Some(handle) = self.server_handle.lock().await.take() {
            handle.await.unwrap_or_else(|e| {
                error!("Error in waiting for accept loop {e}");
            });
        }

        if let Some(bridge) = self.bridge.lock().await.take() {
            if let Err(e) = bridge.join().await {
                error!("Broker bridge stopped with error: {e}");
            }
        }

        if let Some(handle) = self.room_handle.lock().await.take() {
            handle.await.unwrap_or_else(|e| {
                error!("Error in waiting for room task {e}");
            });
        }

        self.running.store(false, Ordering::Release);
        info!(uptime = ?self.stats.uptime(), "Gateway stopped");
        Ok(())
    }

    /// Resolves once shutdown has begun, either through [`Gateway::stop`] or
    /// because a bridge pipeline failed for good
    pub async fn closed(&self) {
        self.shutdown_token.cancelled().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn address(&self) -> Option<String> {
        self.address.read().await.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn health(&self) -> Arc<Health> {
        Arc::clone(&self.health)
    }

    async fn bind(&self) -> Result<Listener> {
        let listen = &self.config.server.listen;
        let tls = match &self.config.server.tls {
            Some(tls) => {
                let acceptor =
                    transport::build_tls_acceptor(tls).map_err(|e| ServerError::Tls(e.to_string()))?;
                info!(cert = %tls.cert_file.display(), "TLS enabled");
                Some(acceptor)
            }
            None => None,
        };

        Listener::bind(listen, tls)
            .await
            .map_err(|e| ServerError::StartupFailed(format!("Failed to bind to {listen}: {e}")))
    }

    async fn run_server(
        listener: Listener,
        acceptor: Arc<Acceptor>,
        shutdown_token: CancellationToken,
    ) {
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(incoming) => {
                            connections.spawn(handle_connection(incoming, Arc::clone(&acceptor)));
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                            if !pause_after_accept_error(&shutdown_token).await {
                                break;
                            }
                        }
                    }
                }

                _ = shutdown_token.cancelled() => {
                    info!("Gateway received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);
        connections.close();
        connections.wait().await;
        info!("Accept loop completed");
    }
}

/// Sleep off a failed accept. Returns false when shutdown arrived first.
async fn pause_after_accept_error(shutdown_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        _ = shutdown_token.cancelled() => false,
    }
}

/// Run the TLS and WebSocket handshakes under one deadline, authenticate the
/// `token` query parameter and hand the connection over to a session
async fn handle_connection(incoming: Incoming, acceptor: Arc<Acceptor>) {
    let peer = incoming.peer_addr().to_string();
    debug!(%peer, "Accepted connection");

    let verdict: Arc<std::sync::Mutex<Option<std::result::Result<ConnectionIdentity, AuthError>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let verdict_cb = Arc::clone(&verdict);
    let acceptor_cb = Arc::clone(&acceptor);
    let peer_cb = peer.clone();

    let callback =
        move |req: &HsRequest, response: HsResponse| -> std::result::Result<HsResponse, ErrorResponse> {
            let uri = req.uri();
            if !acceptor_cb.server.path_matches(uri.path()) {
                warn!(peer = %peer_cb, path = uri.path(), "Upgrade requested for unknown path");
                let mut err_response = ErrorResponse::new(Some("Not Found".to_string()));
                *err_response.status_mut() = StatusCode::NOT_FOUND;
                return Err(err_response);
            }

            let token = token_param(uri.query());
            let result = acceptor_cb
                .authenticator
                .authenticate(&token, SystemTime::now());
            if let Ok(mut guard) = verdict_cb.lock() {
                *guard = Some(result);
            }
            Ok(response)
        };

    let handshake = async {
        let stream = incoming.establish().await.context("TLS handshake failed")?;
        tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .context("WebSocket handshake failed")
    };
    let deadline = acceptor.server.handshake_timeout();
    let handshake = tokio::select! {
        _ = acceptor.session.shutdown.cancelled() => return,
        handshake = tokio::time::timeout(deadline, handshake) => handshake,
    };
    let mut ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, error = ?e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, timeout = ?deadline, "Handshake timed out");
            return;
        }
    };

    let verdict = verdict.lock().ok().and_then(|mut guard| guard.take());
    match verdict {
        Some(Ok(identity)) => {
            debug!(%peer, identity = %identity.identity, "Handshake authenticated");
            if let Err(e) = Session::run(ws, identity, acceptor.session.clone()).await {
                warn!(%peer, error = %e, "Session not started");
            }
        }
        Some(Err(e)) => {
            warn!(%peer, reason = %e, "Refused connection");
            // Give the client a moment to answer the close
            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                let _ = ws.close(Some(close_frame(CloseCode::Policy, &e.to_string()))).await;
                while let Some(Ok(_)) = ws.next().await {}
            })
            .await;
        }
        None => {
            error!(%peer, "Handshake finished without an authentication result");
            let _ = tokio::time::timeout(
                CLOSE_GRACE,
                ws.close(Some(close_frame(CloseCode::Error, "internal error"))),
            )
            .await;
        }
    }
}

/// Percent-decoded value of the `token` query parameter, empty when absent
fn token_param(query: Option<&str>) -> String {
    query
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_default()
}
