use crate::auth::ConnectionIdentity;
use crate::metrics::Stats;
use crate::protocol::Envelope;
use crate::router::{Room, RoomError, SessionId};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on flushing and closing towards a client that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a session needs from the gateway
#[derive(Clone)]
pub struct SessionContext {
    pub room: Room,
    /// Shared queue consumed by the bridge's outbound pipeline
    pub client_messages: mpsc::Sender<Envelope>,
    pub stats: Arc<Stats>,
    pub outbound_capacity: usize,
    pub shutdown: CancellationToken,
}

/// One authenticated client connection.
///
/// Shared by its two pumps; each pump owns one half of the socket, so the
/// transport itself needs no lock. Whichever pump stops first tears the
/// session down; the other one follows through the session token.
pub struct Session {
    id: SessionId,
    identity: ConnectionIdentity,
    room: Room,
    stats: Arc<Stats>,
    /// Gateway-wide shutdown
    shutdown: CancellationToken,
    /// This session only, child of `shutdown`
    token: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Join the room and pump messages until the connection ends.
    ///
    /// Returns after both pumps have stopped and the session has left the
    /// room.
    pub async fn run<S>(
        mut ws: WebSocketStream<S>,
        identity: ConnectionIdentity,
        ctx: SessionContext,
    ) -> Result<(), RoomError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = format!("session_{}", Uuid::new_v4());
        let (mailbox, outbound) = mpsc::channel(ctx.outbound_capacity.max(1));

        if let Err(e) = ctx
            .room
            .join(&id, &identity.subscribe_prefix, mailbox)
            .await
        {
            warn!(session_id = %id, "Room unavailable, refusing session");
            let _ = ws.close(Some(close_frame(CloseCode::Away, "server shutting down"))).await;
            return Err(e);
        }

        ctx.stats.client_connected();
        info!(
            session_id = %id,
            identity = %identity.identity,
            subscribe_prefix = %identity.subscribe_prefix,
            publish_prefix = %identity.publish_prefix,
            "Session started"
        );

        let session = Arc::new(Session {
            id,
            identity,
            room: ctx.room,
            stats: ctx.stats,
            token: ctx.shutdown.child_token(),
            shutdown: ctx.shutdown,
            closed: AtomicBool::new(false),
        });

        let (sink, stream) = ws.split();
        let push = tokio::spawn(Arc::clone(&session).push_to_client(sink, outbound));
        let pull = tokio::spawn(Arc::clone(&session).pull_from_client(stream, ctx.client_messages));

        for (pump, handle) in [("outbound", push), ("inbound", pull)] {
            if let Err(e) = handle.await {
                error!(session_id = %session.id, pump, "Session pump failed: {e}");
            }
        }
        // A panicked pump never reached its own teardown.
        session.teardown().await;
        Ok(())
    }

    /// Write routed envelopes to the client until the queue closes, a write
    /// fails, or the session is cancelled
    async fn push_to_client<S>(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut outbound: mpsc::Receiver<Envelope>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let close = loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    if !self.shutdown.is_cancelled() {
                        // The inbound side saw the peer go away.
                        break None;
                    }
                    let flush = async {
                        while let Ok(envelope) = outbound.try_recv() {
                            if self.write(&mut sink, &envelope).await.is_err() {
                                break;
                            }
                        }
                    };
                    if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
                        debug!(session_id = %self.id, "Client not reading, dropping queued messages");
                        break None;
                    }
                    break Some(close_frame(CloseCode::Away, "server shutting down"));
                }
                next = outbound.recv() => match next {
                    Some(envelope) => {
                        // A client that stopped reading must not pin the pump.
                        let written = tokio::select! {
                            biased;
                            written = self.write(&mut sink, &envelope) => written,
                            _ = self.token.cancelled() => break None,
                        };
                        if let Err(e) = written {
                            debug!(session_id = %self.id, error = %e, "Write to client failed");
                            break None;
                        }
                    }
                    None => {
                        info!(session_id = %self.id, "Evicted from room");
                        break Some(close_frame(CloseCode::Policy, "slow consumer"));
                    }
                },
            }
        };

        // Release the queue before leaving, the router may be waiting on it.
        drop(outbound);
        if let Some(frame) = close {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        self.teardown().await;
    }

    /// Forward client frames to the broker under this session's publish
    /// prefix until the client goes away or the session is cancelled
    async fn pull_from_client<S>(
        self: Arc<Self>,
        mut stream: SplitStream<WebSocketStream<S>>,
        client_messages: mpsc::Sender<Envelope>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = stream.next() => frame,
            };

            let content = match frame {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(session_id = %self.id, len = data.len(), "Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = %self.id, "Client closed connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "Read from client failed");
                    break;
                }
            };

            debug!(session_id = %self.id, "Incoming client message");
            let envelope = Envelope {
                address: self.identity.publish_prefix.clone(),
                content,
            };
            tokio::select! {
                _ = self.token.cancelled() => break,
                sent = client_messages.send(envelope) => {
                    if sent.is_err() {
                        warn!(session_id = %self.id, "Broker bridge gone, closing session");
                        break;
                    }
                }
            }
        }

        drop(stream);
        self.teardown().await;
    }

    async fn write<S>(
        &self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        envelope: &Envelope,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Failed to serialize envelope");
                return Ok(());
            }
        };
        sink.send(Message::Text(json.into())).await?;
        debug!(session_id = %self.id, address = %envelope.address, "Sent message to client");
        Ok(())
    }

    /// Leave the room and release the connection slot. Runs once no matter
    /// how many times it is called.
    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Err(e) = self.room.leave(&self.id).await {
            debug!(session_id = %self.id, error = %e, "Leave skipped");
        }
        self.stats.client_disconnected();
        info!(session_id = %self.id, identity = %self.identity.identity, "Tore down session");
    }
}

pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }
}
