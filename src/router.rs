use crate::config::SlowConsumer;
use crate::metrics::Stats;
use crate::protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type SessionId = String;

/// Sending half of a session's outbound queue. The room holds the only one,
/// so dropping it closes the queue.
pub type Mailbox = mpsc::Sender<Envelope>;

const COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room is closed")]
    Closed,
}

enum Command {
    Join {
        session_id: SessionId,
        subscribe_prefix: String,
        mailbox: Mailbox,
        ack: oneshot::Sender<()>,
    },
    Leave {
        session_id: SessionId,
        ack: oneshot::Sender<()>,
    },
    Route(Envelope),
    Members(oneshot::Sender<usize>),
}

/// Handle to the registry of active sessions.
///
/// Cloning is cheap. All joins, leaves and routes are funnelled through one
/// task, so broker deliveries are totally ordered across sessions. The task
/// ends once every handle is dropped, closing all remaining mailboxes.
#[derive(Clone)]
pub struct Room {
    commands: mpsc::Sender<Command>,
}

impl Room {
    pub fn spawn(policy: SlowConsumer, stats: Arc<Stats>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let router = Router {
            members: HashMap::new(),
            policy,
            stats,
        };
        let handle = tokio::spawn(router.run(rx));
        (Self { commands: tx }, handle)
    }

    /// Register a session. Returns once the room has recorded it, so any
    /// envelope routed afterwards can reach it.
    pub async fn join(
        &self,
        session_id: &str,
        subscribe_prefix: &str,
        mailbox: Mailbox,
    ) -> Result<(), RoomError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Join {
            session_id: session_id.to_owned(),
            subscribe_prefix: subscribe_prefix.to_owned(),
            mailbox,
            ack,
        })
        .await?;
        done.await.map_err(|_| RoomError::Closed)
    }

    /// Remove a session. Leaving twice, or after eviction, is a no-op.
    pub async fn leave(&self, session_id: &str) -> Result<(), RoomError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Leave {
            session_id: session_id.to_owned(),
            ack,
        })
        .await?;
        done.await.map_err(|_| RoomError::Closed)
    }

    /// Queue an envelope for fan-out to every session whose subscribe prefix
    /// is a prefix of its address.
    pub async fn route(&self, envelope: Envelope) -> Result<(), RoomError> {
        self.send(Command::Route(envelope)).await
    }

    pub async fn members(&self) -> Result<usize, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Members(tx)).await?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), RoomError> {
        self.commands.send(command).await.map_err(|_| RoomError::Closed)
    }
}

struct Member {
    subscribe_prefix: String,
    mailbox: Mailbox,
}

struct Router {
    members: HashMap<SessionId, Member>,
    policy: SlowConsumer,
    stats: Arc<Stats>,
}

impl Router {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!(policy = ?self.policy, "Room started");

        while let Some(command) = commands.recv().await {
            match command {
                Command::Join {
                    session_id,
                    subscribe_prefix,
                    mailbox,
                    ack,
                } => {
                    info!(%session_id, %subscribe_prefix, "Session joined room");
                    self.members.insert(
                        session_id,
                        Member {
                            subscribe_prefix,
                            mailbox,
                        },
                    );
                    let _ = ack.send(());
                }
                Command::Leave { session_id, ack } => {
                    if self.members.remove(&session_id).is_some() {
                        info!(%session_id, "Session left room");
                    } else {
                        debug!(%session_id, "Session already gone from room");
                    }
                    let _ = ack.send(());
                }
                Command::Route(envelope) => self.route(envelope).await,
                Command::Members(reply) => {
                    let _ = reply.send(self.members.len());
                }
            }
        }

        info!(remaining = self.members.len(), "Room closed");
    }

    async fn route(&mut self, envelope: Envelope) {
        let mut delivered = 0usize;
        let mut gone = Vec::new();

        for (session_id, member) in &self.members {
            if !envelope.matches_prefix(&member.subscribe_prefix) {
                continue;
            }

            match self.policy {
                SlowConsumer::Block => match member.mailbox.send(envelope.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(_) => gone.push(session_id.clone()),
                },
                SlowConsumer::Disconnect => match member.mailbox.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(%session_id, "Outbound queue full, disconnecting slow consumer");
                        self.stats.route_eviction();
                        gone.push(session_id.clone());
                    }
                    Err(TrySendError::Closed(_)) => gone.push(session_id.clone()),
                },
            }
        }

        for session_id in gone {
            debug!(%session_id, "Dropping session from room");
            self.members.remove(&session_id);
        }

        debug!(address = %envelope.address, delivered, "Routed envelope");
    }
}
