//! Transports to the external message broker.
//!
//! The bridge only sees the two traits below; `zmq` talks to a real ZeroMQ
//! broker and `memory` backs embedding and tests.

pub mod memory;
pub mod zmq;

pub use memory::{MemoryPublisher, MemoryRequester, MemorySubscriber, RequestLog};
pub use zmq::{ZmqRequester, ZmqSubscriber};

use crate::config::BrokerConfig;
use crate::protocol::Envelope;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),
    #[error("Malformed broker message with {0} frames")]
    MalformedMessage(usize),
    #[error("Broker request timed out")]
    Timeout,
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Broker channel closed")]
    Closed,
}

impl BrokerError {
    /// Whether the error says something about the transport, as opposed to a
    /// single bad message that can simply be skipped
    pub fn is_transport(&self) -> bool {
        !matches!(self, BrokerError::MalformedMessage(_))
    }
}

/// Receiving side of the broker's publish channel
#[async_trait]
pub trait Subscriber: Send {
    /// Wait for the next `(address, content)` message
    async fn recv(&mut self) -> Result<Envelope, BrokerError>;
}

/// Request side of the broker: one request, exactly one reply
#[async_trait]
pub trait Requester: Send {
    /// Send `payload` and wait for the reply, whose content is ignored
    async fn request(&mut self, payload: &str) -> Result<(), BrokerError>;

    /// Called after a request was abandoned mid-flight (timeout), so the
    /// next request starts from a clean state
    async fn reset(&mut self) {}
}

/// Open both ZeroMQ sockets described by the broker config
pub async fn connect(
    config: &BrokerConfig,
) -> Result<(Box<dyn Subscriber>, Box<dyn Requester>), BrokerError> {
    let subscriber = ZmqSubscriber::connect(&config.sub_endpoint, &config.subscribe_filter).await?;
    let requester = ZmqRequester::connect(&config.req_endpoint).await?;
    Ok((Box::new(subscriber), Box::new(requester)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_is_not_transport_failure() {
        assert!(!BrokerError::MalformedMessage(3).is_transport());
        assert!(BrokerError::Timeout.is_transport());
        assert!(BrokerError::Closed.is_transport());
        assert!(BrokerError::Unavailable("down".into()).is_transport());
    }
}
