use crate::broker::{BrokerError, Requester, Subscriber};
use crate::config::BrokerConfig;
use crate::health::{Health, Pipeline};
use crate::metrics::Stats;
use crate::protocol::Envelope;
use crate::router::Room;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{pipeline} pipeline gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        pipeline: Pipeline,
        attempts: u32,
        last: BrokerError,
    },
}

/// Bounded exponential backoff shared by both pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the `attempt`-th consecutive failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// The two long-running pipelines between the broker and the room
pub struct BrokerBridge {
    inbound: JoinHandle<Result<(), BridgeError>>,
    outbound: JoinHandle<Result<(), BridgeError>>,
}

pub struct BridgeContext {
    pub room: Room,
    pub stats: Arc<Stats>,
    pub health: Arc<Health>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl BrokerBridge {
    /// Start both pipelines.
    ///
    /// The inbound pipeline stops on `shutdown`. The outbound pipeline keeps
    /// forwarding until every sender of `client_messages` is gone, so queued
    /// client messages are drained before it exits.
    pub fn spawn(
        subscriber: Box<dyn Subscriber>,
        requester: Box<dyn Requester>,
        client_messages: mpsc::Receiver<Envelope>,
        ctx: BridgeContext,
        shutdown: CancellationToken,
    ) -> Self {
        let inbound = tokio::spawn(broker_to_room(
            subscriber,
            ctx.room,
            Arc::clone(&ctx.stats),
            Arc::clone(&ctx.health),
            ctx.retry,
            shutdown,
        ));
        let outbound = tokio::spawn(clients_to_broker(
            requester,
            client_messages,
            ctx.stats,
            ctx.health,
            ctx.retry,
            ctx.request_timeout,
        ));
        Self { inbound, outbound }
    }

    /// Wait for both pipelines to finish
    pub async fn join(self) -> Result<(), BridgeError> {
        let inbound = flatten(self.inbound.await);
        let outbound = flatten(self.outbound.await);
        inbound.and(outbound)
    }
}

fn flatten(
    joined: Result<Result<(), BridgeError>, tokio::task::JoinError>,
) -> Result<(), BridgeError> {
    joined.unwrap_or_else(|e| {
        error!("Bridge pipeline task failed: {e}");
        Ok(())
    })
}

/// Receive `(address, content)` messages from the broker and route them
pub async fn broker_to_room(
    mut subscriber: Box<dyn Subscriber>,
    room: Room,
    stats: Arc<Stats>,
    health: Arc<Health>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let mut failures = 0u32;

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = subscriber.recv() => received,
        };

        match received {
            Ok(envelope) => {
                failures = 0;
                debug!(address = %envelope.address, "Received broker message");
                if room.route(envelope).await.is_err() {
                    info!("Room closed, stopping inbound pipeline");
                    break;
                }
                stats.broker_message();
            }
            Err(e) if !e.is_transport() => {
                warn!(error = %e, "Skipping broker message");
            }
            Err(e) => {
                failures += 1;
                if failures >= retry.max_attempts {
                    health.fail(Pipeline::Inbound, e.to_string());
                    return Err(BridgeError::RetriesExhausted {
                        pipeline: Pipeline::Inbound,
                        attempts: failures,
                        last: e,
                    });
                }
                let delay = retry.backoff(failures);
                warn!(error = %e, attempt = failures, ?delay, "Broker receive failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("Inbound pipeline stopped");
    Ok(())
}

/// Forward client messages to the broker one request at a time
pub async fn clients_to_broker(
    mut requester: Box<dyn Requester>,
    mut client_messages: mpsc::Receiver<Envelope>,
    stats: Arc<Stats>,
    health: Arc<Health>,
    retry: RetryPolicy,
    request_timeout: Duration,
) -> Result<(), BridgeError> {
    while let Some(envelope) = client_messages.recv().await {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(address = %envelope.address, error = %e, "Failed to serialize envelope, dropping");
                continue;
            }
        };

        if let Err((attempts, last)) =
            forward(requester.as_mut(), &payload, retry, request_timeout, &stats).await
        {
            error!(address = %envelope.address, "Dropping client message after {attempts} attempts");
            health.fail(Pipeline::Outbound, last.to_string());
            return Err(BridgeError::RetriesExhausted {
                pipeline: Pipeline::Outbound,
                attempts,
                last,
            });
        }
        debug!(address = %envelope.address, "Forwarded client message");
    }

    info!("Outbound pipeline drained");
    Ok(())
}

async fn forward(
    requester: &mut dyn Requester,
    payload: &str,
    retry: RetryPolicy,
    request_timeout: Duration,
    stats: &Stats,
) -> Result<(), (u32, BrokerError)> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        stats.broker_request();

        let result = match tokio::time::timeout(request_timeout, requester.request(payload)).await {
            Ok(result) => result,
            Err(_) => {
                requester.reset().await;
                Err(BrokerError::Timeout)
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                stats.broker_request_failed();
                if attempt >= retry.max_attempts {
                    return Err((attempt, e));
                }
                let delay = retry.backoff(attempt);
                warn!(error = %e, attempt, ?delay, "Broker request failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory;
    use crate::config::SlowConsumer;
    use async_trait::async_trait;
    use tokio::time::timeout;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn health() -> (Arc<Health>, CancellationToken) {
        let token = CancellationToken::new();
        (Arc::new(Health::new(token.clone())), token)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = BrokerConfig {
            max_attempts: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_inbound_routes_and_counts() {
        let stats = Arc::new(Stats::new());
        let (room, _) = Room::spawn(SlowConsumer::Block, Arc::clone(&stats));
        let (tx, mut rx) = mpsc::channel(8);
        room.join("s1", "sub.a", tx).await.unwrap();

        let (publisher, subscriber) = memory::subscription(8);
        let (health, _) = health();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broker_to_room(
            Box::new(subscriber),
            room.clone(),
            Arc::clone(&stats),
            health,
            fast_retry(3),
            shutdown.clone(),
        ));

        publisher.publish("sub.a.event", "hi").await.unwrap();
        let envelope = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(envelope, Envelope::new("sub.a.event", "hi"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().broker_messages, 1);
    }

    #[tokio::test]
    async fn test_inbound_recovers_from_transient_failures() {
        let stats = Arc::new(Stats::new());
        let (room, _) = Room::spawn(SlowConsumer::Block, Arc::clone(&stats));
        let (tx, mut rx) = mpsc::channel(8);
        room.join("s1", "", tx).await.unwrap();

        let (publisher, subscriber) = memory::subscription(8);
        let (health, token) = health();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broker_to_room(
            Box::new(subscriber),
            room.clone(),
            stats,
            Arc::clone(&health),
            fast_retry(3),
            shutdown.clone(),
        ));

        // Two failures, a success, then two more: the count resets in between.
        publisher.fail(BrokerError::Timeout).await.unwrap();
        publisher.fail(BrokerError::Timeout).await.unwrap();
        publisher.publish("a", "1").await.unwrap();
        publisher.fail(BrokerError::Timeout).await.unwrap();
        publisher.fail(BrokerError::Timeout).await.unwrap();
        publisher.fail(BrokerError::MalformedMessage(1)).await.unwrap();
        publisher.publish("b", "2").await.unwrap();

        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap().content, "1");
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap().content, "2");
        assert!(health.is_healthy());
        assert!(!token.is_cancelled());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_escalates_after_exhaustion() {
        let stats = Arc::new(Stats::new());
        let (room, _) = Room::spawn(SlowConsumer::Block, Arc::clone(&stats));
        let (publisher, subscriber) = memory::subscription(8);
        drop(publisher);

        let (health, token) = health();
        let result = timeout(
            Duration::from_secs(1),
            broker_to_room(
                Box::new(subscriber),
                room,
                stats,
                Arc::clone(&health),
                fast_retry(3),
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();

        assert!(matches!(
            result,
            Err(BridgeError::RetriesExhausted {
                pipeline: Pipeline::Inbound,
                attempts: 3,
                ..
            })
        ));
        assert!(token.is_cancelled());
        assert!(health.failure(Pipeline::Inbound).is_some());
    }

    #[tokio::test]
    async fn test_outbound_forwards_in_order() {
        let (requester, mut log) = memory::requests(8);
        let (tx, rx) = mpsc::channel(8);
        let (health, _) = health();
        let task = tokio::spawn(clients_to_broker(
            Box::new(requester),
            rx,
            Arc::new(Stats::new()),
            health,
            fast_retry(3),
            Duration::from_secs(1),
        ));

        tx.send(Envelope::new("pub.a", "ping")).await.unwrap();
        tx.send(Envelope::new("pub.a", "pong")).await.unwrap();
        drop(tx);

        assert_eq!(log.next().await.unwrap(), r#"{"address":"pub.a","content":"ping"}"#);
        assert_eq!(log.next_envelope().await.unwrap(), Envelope::new("pub.a", "pong"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_outbound_retries_then_succeeds() {
        let (requester, mut log) = memory::requests(8);
        log.fail_next(2);
        let (tx, rx) = mpsc::channel(8);
        let (health, _) = health();
        let task = tokio::spawn(clients_to_broker(
            Box::new(requester),
            rx,
            Arc::new(Stats::new()),
            Arc::clone(&health),
            fast_retry(3),
            Duration::from_secs(1),
        ));

        tx.send(Envelope::new("pub.a", "retry me")).await.unwrap();
        drop(tx);

        assert_eq!(log.next_envelope().await.unwrap().content, "retry me");
        task.await.unwrap().unwrap();
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_outbound_escalates_after_exhaustion() {
        let (requester, log) = memory::requests(8);
        log.fail_next(10);
        let (tx, rx) = mpsc::channel(8);
        let (health, token) = health();

        tx.send(Envelope::new("pub.a", "lost")).await.unwrap();
        let result = clients_to_broker(
            Box::new(requester),
            rx,
            Arc::new(Stats::new()),
            Arc::clone(&health),
            fast_retry(3),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(
            result,
            Err(BridgeError::RetriesExhausted {
                pipeline: Pipeline::Outbound,
                attempts: 3,
                ..
            })
        ));
        assert!(token.is_cancelled());
        assert!(tx.is_closed());
    }

    struct SilentBroker {
        resets: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl Requester for SilentBroker {
        async fn request(&mut self, _payload: &str) -> Result<(), BrokerError> {
            std::future::pending().await
        }

        async fn reset(&mut self) {
            self.resets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_outbound_times_out_and_resets() {
        let resets = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let requester = SilentBroker {
            resets: Arc::clone(&resets),
        };
        let (tx, rx) = mpsc::channel(8);
        let (health, _) = health();

        tx.send(Envelope::new("pub.a", "unanswered")).await.unwrap();
        let result = clients_to_broker(
            Box::new(requester),
            rx,
            Arc::new(Stats::new()),
            health,
            fast_retry(2),
            Duration::from_millis(20),
        )
        .await;

        match result {
            Err(BridgeError::RetriesExhausted { last, attempts, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, BrokerError::Timeout));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(resets.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bridge_spawn_and_join() {
        let stats = Arc::new(Stats::new());
        let (room, _) = Room::spawn(SlowConsumer::Block, Arc::clone(&stats));
        let (_publisher, subscriber) = memory::subscription(8);
        let (requester, _log) = memory::requests(8);
        let (tx, rx) = mpsc::channel(8);
        let (health, _) = health();
        let shutdown = CancellationToken::new();

        let bridge = BrokerBridge::spawn(
            Box::new(subscriber),
            Box::new(requester),
            rx,
            BridgeContext {
                room,
                stats,
                health,
                retry: fast_retry(3),
                request_timeout: Duration::from_secs(1),
            },
            shutdown.clone(),
        );

        shutdown.cancel();
        drop(tx);
        timeout(Duration::from_secs(1), bridge.join()).await.unwrap().unwrap();
    }
}
