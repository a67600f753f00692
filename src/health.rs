use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    /// Broker subscription into the room
    Inbound,
    /// Shared client queue out to the broker
    Outbound,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Inbound => f.write_str("inbound"),
            Pipeline::Outbound => f.write_str("outbound"),
        }
    }
}

/// Health of the broker bridge.
///
/// A pipeline failure is terminal: the first reason recorded sticks and the
/// escalation token is cancelled so the owning gateway shuts down.
#[derive(Debug)]
pub struct Health {
    inbound: OnceLock<String>,
    outbound: OnceLock<String>,
    escalate: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub inbound: Option<String>,
    pub outbound: Option<String>,
}

impl Health {
    pub fn new(escalate: CancellationToken) -> Self {
        Self {
            inbound: OnceLock::new(),
            outbound: OnceLock::new(),
            escalate,
        }
    }

    pub fn fail(&self, pipeline: Pipeline, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%pipeline, %reason, "broker pipeline failed, shutting down");
        let _ = self.slot(pipeline).set(reason);
        self.escalate.cancel();
    }

    pub fn failure(&self, pipeline: Pipeline) -> Option<&str> {
        self.slot(pipeline).get().map(String::as_str)
    }

    pub fn is_healthy(&self) -> bool {
        self.inbound.get().is_none() && self.outbound.get().is_none()
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            healthy: self.is_healthy(),
            inbound: self.inbound.get().cloned(),
            outbound: self.outbound.get().cloned(),
        }
    }

    fn slot(&self, pipeline: Pipeline) -> &OnceLock<String> {
        match pipeline {
            Pipeline::Inbound => &self.inbound,
            Pipeline::Outbound => &self.outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_healthy() {
        let health = Health::new(CancellationToken::new());
        assert!(health.is_healthy());
        assert_eq!(
            health.report(),
            HealthReport {
                healthy: true,
                inbound: None,
                outbound: None
            }
        );
    }

    #[test]
    fn test_failure_escalates() {
        let token = CancellationToken::new();
        let health = Health::new(token.clone());

        health.fail(Pipeline::Outbound, "5 attempts failed");

        assert!(token.is_cancelled());
        assert!(!health.is_healthy());
        assert_eq!(health.failure(Pipeline::Outbound), Some("5 attempts failed"));
        assert_eq!(health.failure(Pipeline::Inbound), None);
    }

    #[test]
    fn test_first_reason_sticks() {
        let health = Health::new(CancellationToken::new());
        health.fail(Pipeline::Inbound, "first");
        health.fail(Pipeline::Inbound, "second");
        assert_eq!(health.failure(Pipeline::Inbound), Some("first"));
    }
}
