//! # Error Handling Module
//!
//! Structured error taxonomy for the event mesh engine. Each variant tracks
//! enough context to decide, at the call site, whether the failure should be
//! surfaced to a wire caller, folded into an FSM transition, or simply
//! counted and swallowed (see spec §7 for the propagation policy).

use thiserror::Error;

/// Main error type for the event mesh engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed event JSON or a destination mismatch at the ingress boundary.
    #[error("validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Configuration failed to load or did not pass validation.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A pool rejected an insert under the `reject` overflow policy, or a
    /// structural invariant inside a pool was violated.
    #[error("pool error: {message}")]
    Pool { message: String, pool: &'static str },

    /// The host-supplied `analyze` callback panicked or returned an error.
    #[error("analyzer error: {message}")]
    Analyzer { message: String, retry_count: u32 },

    /// A lifecycle hook (`on_starting`, `on_pausing`, ...) failed.
    #[error("lifecycle hook error: {message}")]
    Lifecycle { message: String, hook: &'static str },

    /// Outbound POST failed: timeout, connection error, or non-200 response.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        destination: String,
        status_code: Option<u16>,
    },

    /// Snapshot read/write failed.
    #[error("persistence error: {message}")]
    Persistence { message: String, path: String },

    /// An FSM command was rejected because it is illegal in the current state.
    #[error("illegal transition: {command} is not admitted in state {state}")]
    IllegalTransition { command: String, state: String },

    /// An internal invariant was violated; the engine transitions to FAULT.
    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Whether the wire boundary should see this error (spec §7: only
    /// validation errors are surfaced to the caller).
    pub fn is_wire_visible(&self) -> bool {
        matches!(self, EngineError::Validation { .. })
    }

    /// Whether this error should drive the FSM to `ON_ERROR`/`FAULT`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Lifecycle { .. } | EngineError::Internal { .. }
        )
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>>(message: S, field: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn pool<S: Into<String>>(message: S, pool: &'static str) -> Self {
        Self::Pool {
            message: message.into(),
            pool,
        }
    }

    pub fn transport<S: Into<String>>(message: S, destination: S, status_code: Option<u16>) -> Self {
        Self::Transport {
            message: message.into(),
            destination: destination.into(),
            status_code,
        }
    }

    pub fn persistence<S: Into<String>>(message: S, path: S) -> Self {
        Self::Persistence {
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Validation {
            message: format!("json error: {err}"),
            field: None,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        EngineError::Transport {
            message: err.to_string(),
            destination: err.url().map(|u| u.to_string()).unwrap_or_default(),
            status_code: status,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration {
            message: err.to_string(),
        }
    }
}
