use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, Requester, Subscriber};
use crate::protocol::Envelope;

/// In-process stand-in for a broker publisher.
///
/// Dropping every [`MemoryPublisher`] makes the subscriber fail with
/// [`BrokerError::Closed`], the same as a lost connection.
pub fn subscription(capacity: usize) -> (MemoryPublisher, MemorySubscriber) {
    let (tx, rx) = mpsc::channel(capacity);
    (MemoryPublisher { tx }, MemorySubscriber { rx })
}

/// In-process stand-in for a broker reply socket. Every request is recorded
/// in the [`RequestLog`] and answered immediately.
pub fn requests(capacity: usize) -> (MemoryRequester, RequestLog) {
    let (tx, rx) = mpsc::channel(capacity);
    let failures = Arc::new(AtomicU32::new(0));
    (
        MemoryRequester {
            tx,
            failures: Arc::clone(&failures),
        },
        RequestLog { rx, failures },
    )
}

#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::Sender<Result<Envelope, BrokerError>>,
}

impl MemoryPublisher {
    pub async fn publish(&self, address: &str, content: &str) -> Result<(), BrokerError> {
        self.tx
            .send(Ok(Envelope::new(address, content)))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Make the subscriber's next receive fail with `error`
    pub async fn fail(&self, error: BrokerError) -> Result<(), BrokerError> {
        self.tx.send(Err(error)).await.map_err(|_| BrokerError::Closed)
    }
}

pub struct MemorySubscriber {
    rx: mpsc::Receiver<Result<Envelope, BrokerError>>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn recv(&mut self) -> Result<Envelope, BrokerError> {
        self.rx.recv().await.unwrap_or(Err(BrokerError::Closed))
    }
}

pub struct MemoryRequester {
    tx: mpsc::Sender<String>,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl Requester for MemoryRequester {
    async fn request(&mut self, payload: &str) -> Result<(), BrokerError> {
        let inject = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(BrokerError::Unavailable("injected failure".into()));
        }
        self.tx
            .send(payload.to_owned())
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

/// Broker-side view of the requests a [`MemoryRequester`] made
pub struct RequestLog {
    rx: mpsc::Receiver<String>,
    failures: Arc<AtomicU32>,
}

impl RequestLog {
    /// Next raw request payload, `None` once the requester is gone
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next request decoded as an envelope
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let payload = self.next().await?;
        serde_json::from_str(&payload).ok()
    }

    /// Fail the next `count` requests before they reach the log
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}
