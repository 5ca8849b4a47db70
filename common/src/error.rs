// Copyright 2024 Oxide Computer Company
use std::fmt::Display;

pub type Result<T, E = E2eError> = std::result::Result<T, E>;

/// Failures surfaced by the harness.
///
/// Everything except `Teardown` is propagated to the caller as soon as it
/// happens; `Teardown` collects the failures seen while closing a scenario.
#[derive(thiserror::Error, Debug)]
pub enum E2eError {
    /// Bad or duplicate setup. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service {service} failed to start: {reason}")]
    Startup { service: String, reason: String },

    #[error("service {service} failed to stop: {reason}")]
    Shutdown { service: String, reason: String },

    /// A readiness check, metric gate or request deadline was not met.
    #[error(
        "timed out waiting for {subject}: {condition} (last observed: {last})"
    )]
    Timeout {
        subject: String,
        condition: String,
        last: String,
    },

    #[error("transport error talking to {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A response arrived but did not have the expected shape.
    #[error("protocol error from {target}: {reason}")]
    Protocol { target: String, reason: String },

    #[error("teardown failed: {}", join_errors(.0))]
    Teardown(Vec<E2eError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl E2eError {
    /// Classify a `reqwest` failure, keeping deadline expiry separate from
    /// connection and body errors.
    pub fn from_reqwest(target: impl Display, e: reqwest::Error) -> E2eError {
        if e.is_timeout() {
            E2eError::Timeout {
                subject: target.to_string(),
                condition: "request completed".to_string(),
                last: e.to_string(),
            }
        } else if e.is_decode() {
            E2eError::Protocol {
                target: target.to_string(),
                reason: e.to_string(),
            }
        } else {
            E2eError::Transport {
                target: target.to_string(),
                source: Box::new(e),
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, E2eError::Timeout { .. })
    }
}

fn join_errors(errors: &[E2eError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
