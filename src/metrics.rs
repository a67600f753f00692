//! Process counters, kept in-process and mirrored to the `metrics` facade.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Messages received from the broker subscription (counter).
pub const BROKER_MESSAGES_TOTAL: &str = "windsock_broker_messages_total";
/// Requests forwarded to the broker (counter).
pub const BROKER_REQUESTS_TOTAL: &str = "windsock_broker_requests_total";
/// Failed broker request attempts (counter).
pub const BROKER_REQUEST_FAILURES_TOTAL: &str = "windsock_broker_request_failures_total";
/// Currently connected clients (gauge).
pub const CLIENTS_CURRENT: &str = "windsock_clients_current";
/// Clients seen since start (counter).
pub const CLIENTS_TOTAL: &str = "windsock_clients_total";
/// Sessions evicted for not keeping up (counter).
pub const ROUTE_EVICTIONS_TOTAL: &str = "windsock_route_evictions_total";
/// Seconds since the gateway was created (gauge).
pub const UPTIME_SECONDS: &str = "windsock_uptime_seconds";

/// Install the global Prometheus recorder and serve it over HTTP.
///
/// Must be called once, from inside the runtime, before any metric is
/// recorded.
pub fn install_exporter(listen: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    broker_messages: AtomicU64,
    clients_current: AtomicI64,
    clients_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub broker_messages: u64,
    pub clients_current: i64,
    pub clients_total: u64,
    pub uptime: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            broker_messages: AtomicU64::new(0),
            clients_current: AtomicI64::new(0),
            clients_total: AtomicU64::new(0),
        }
    }

    pub fn broker_message(&self) {
        self.broker_messages.fetch_add(1, Ordering::Relaxed);
        counter!(BROKER_MESSAGES_TOTAL).increment(1);
    }

    pub fn client_connected(&self) {
        self.clients_current.fetch_add(1, Ordering::Relaxed);
        self.clients_total.fetch_add(1, Ordering::Relaxed);
        gauge!(CLIENTS_CURRENT).increment(1.0);
        counter!(CLIENTS_TOTAL).increment(1);
    }

    pub fn client_disconnected(&self) {
        self.clients_current.fetch_sub(1, Ordering::Relaxed);
        gauge!(CLIENTS_CURRENT).decrement(1.0);
    }

    pub fn broker_request(&self) {
        counter!(BROKER_REQUESTS_TOTAL).increment(1);
    }

    pub fn broker_request_failed(&self) {
        counter!(BROKER_REQUEST_FAILURES_TOTAL).increment(1);
    }

    pub fn route_eviction(&self) {
        counter!(ROUTE_EVICTIONS_TOTAL).increment(1);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.uptime();
        gauge!(UPTIME_SECONDS).set(uptime.as_secs_f64());
        StatsSnapshot {
            broker_messages: self.broker_messages.load(Ordering::Relaxed),
            clients_current: self.clients_current.load(Ordering::Relaxed),
            clients_total: self.clients_total.load(Ordering::Relaxed),
            uptime,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_counters() {
        let stats = Stats::new();
        stats.client_connected();
        stats.client_connected();
        stats.client_disconnected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.clients_current, 1);
        assert_eq!(snapshot.clients_total, 2);
        assert_eq!(snapshot.broker_messages, 0);
    }

    #[test]
    fn test_broker_messages() {
        let stats = Stats::new();
        for _ in 0..3 {
            stats.broker_message();
        }
        assert_eq!(stats.snapshot().broker_messages, 3);
    }
}
