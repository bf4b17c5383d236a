//! Error types for the engine, the client pool, job starters and the poller.
//!
//! Each layer has its own enum so callers can tell a process that never came
//! up apart from an engine that refused a request.

use crate::types::{ClientId, JobHandle};
use thiserror::Error;

/// Failure talking to a running engine over its local API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The HTTP request itself failed.
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The engine answered with an API error.
    #[error("engine API error {code}: {message}")]
    Api {
        /// Engine error code (or HTTP status when the body has none).
        code: String,
        /// Message reported by the engine.
        message: String,
    },

    /// An action call was not acknowledged with `OK`.
    #[error("engine rejected {operation}")]
    Rejected {
        /// Component/name of the rejected call.
        operation: String,
    },

    /// The response body did not have the expected shape.
    #[error("malformed response to {operation}: {detail}")]
    Malformed {
        /// Component/name of the call.
        operation: String,
        /// What was wrong.
        detail: String,
    },
}

impl EngineError {
    pub fn rejected(operation: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
        }
    }

    pub fn malformed(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Failure bringing an engine process up.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch engine: {0}")]
    Io(#[from] std::io::Error),

    /// The process closed before printing the readiness marker.
    #[error("engine {kind} process exited with code {code:?} before becoming ready")]
    ExitedEarly { kind: &'static str, code: Option<i32> },

    #[error("no free engine port left in range {first}-{last}")]
    PortsExhausted { first: u16, last: u16 },

    /// Post-launch configuration of the engine failed.
    #[error("failed to configure engine: {0}")]
    Configure(#[from] EngineError),
}

/// Failure starting a scan job.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("engine refused to start the job: {0}")]
    Engine(#[from] EngineError),

    #[error("unknown engine client: {0}")]
    UnknownClient(ClientId),

    #[error("job {0} is already monitored")]
    AlreadyMonitored(JobHandle),

    /// A precondition call answered but did not succeed.
    #[error("failed to {step}")]
    Precondition { step: &'static str },
}

/// A poll tick that failed after every retry.
#[derive(Debug, Error)]
#[error("polling {what} failed after {attempts} attempts: {last}")]
pub struct PollError {
    pub what: &'static str,
    pub attempts: u32,
    #[source]
    pub last: EngineError,
}

/// Failure inside the session persistence gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}
