use async_trait::async_trait;
use tracing::{debug, info, warn};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::broker::{BrokerError, Requester, Subscriber};
use crate::protocol::Envelope;

/// SUB socket connected to the broker's publisher
pub struct ZmqSubscriber {
    socket: SubSocket,
}

impl ZmqSubscriber {
    pub async fn connect(endpoint: &str, filter: &str) -> Result<Self, BrokerError> {
        let mut socket = SubSocket::new();
        socket.connect(endpoint).await?;
        socket.subscribe(filter).await?;
        info!(endpoint, filter, "Subscribed to broker");
        Ok(Self { socket })
    }
}

#[async_trait]
impl Subscriber for ZmqSubscriber {
    async fn recv(&mut self) -> Result<Envelope, BrokerError> {
        let message = self.socket.recv().await?;
        let frames = message.into_vec();
        Envelope::from_frames(&frames).ok_or(BrokerError::MalformedMessage(frames.len()))
    }
}

/// REQ socket to the broker.
///
/// A REQ socket that lost a reply can never send again, so after any failed
/// or abandoned request the socket is dropped and rebuilt on the next call.
pub struct ZmqRequester {
    endpoint: String,
    socket: Option<ReqSocket>,
}

impl ZmqRequester {
    pub async fn connect(endpoint: &str) -> Result<Self, BrokerError> {
        let mut requester = Self {
            endpoint: endpoint.to_owned(),
            socket: None,
        };
        requester.socket().await?;
        info!(endpoint, "Connected to broker request socket");
        Ok(requester)
    }

    async fn socket(&mut self) -> Result<&mut ReqSocket, BrokerError> {
        if self.socket.is_none() {
            debug!(endpoint = %self.endpoint, "Opening broker request socket");
            let mut socket = ReqSocket::new();
            socket.connect(&self.endpoint).await?;
            self.socket = Some(socket);
        }
        self.socket.as_mut().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl Requester for ZmqRequester {
    async fn request(&mut self, payload: &str) -> Result<(), BrokerError> {
        let result = async {
            let socket = self.socket().await?;
            socket.send(ZmqMessage::from(payload.to_owned())).await?;
            socket.recv().await?;
            Ok::<(), BrokerError>(())
        }
        .await;

        if let Err(ref e) = result {
            warn!(endpoint = %self.endpoint, error = %e, "Broker request failed, resetting socket");
            self.socket = None;
        }
        result
    }

    async fn reset(&mut self) {
        self.socket = None;
    }
}
