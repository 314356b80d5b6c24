//! Error types for reply-pilot.

use std::fmt;
use std::time::Duration;

/// Top-level error type for the autopilot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Switch error: {0}")]
    Switch(#[from] SwitchError),

    #[error("Decision service error: {0}")]
    Decision(#[from] DecisionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the observation or action layer.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("Element {handle} not found")]
    ElementNotFound { handle: String },

    #[error("Action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("Operation not supported by this surface: {0}")]
    Unsupported(String),
}

/// Contact switch failures.
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("No contact element matches {target}")]
    ContactNotFound { target: String },

    #[error("Activation of {target} failed: {reason}")]
    ActivationFailed { target: String, reason: String },

    #[error("Switch to {target} not confirmed (surface reports {reported:?})")]
    NotConfirmed {
        target: String,
        reported: Option<String>,
    },
}

/// AI decision service failures. The router degrades these to "no action".
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("Decision service {service} is not configured")]
    Unavailable { service: String },

    #[error("Decision service {service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("Decision service {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Execution phase a send failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Switch,
    Acquire,
    Fill,
    Submit,
    Verify,
    Tool,
}

impl fmt::Display for SendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Switch => "switch",
            Self::Acquire => "acquire",
            Self::Fill => "fill",
            Self::Submit => "submit",
            Self::Verify => "verify",
            Self::Tool => "tool",
        };
        f.write_str(label)
    }
}

/// Why a reply task was rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("[{phase}] switch to {conversation} failed: {reason}")]
    Switch {
        phase: SendPhase,
        conversation: String,
        reason: String,
    },

    #[error("[{phase}] {element} unavailable after {waited:?}")]
    ElementUnavailable {
        phase: SendPhase,
        element: String,
        waited: Duration,
    },

    #[error("[{phase}] send control stayed disabled for {conversation}")]
    SubmitDisabled { phase: SendPhase, conversation: String },

    #[error("[{phase}] send to {conversation} not confirmed after {attempts} attempts")]
    NotConfirmed {
        phase: SendPhase,
        conversation: String,
        attempts: u32,
    },

    #[error("[{phase}] surface action failed: {reason}")]
    Action { phase: SendPhase, reason: String },

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Queue internal failure: {0}")]
    Internal(String),
}

impl SendError {
    /// Phase the failure is attributed to, if it came from execution.
    pub fn phase(&self) -> Option<SendPhase> {
        match self {
            Self::Switch { phase, .. }
            | Self::ElementUnavailable { phase, .. }
            | Self::SubmitDisabled { phase, .. }
            | Self::NotConfirmed { phase, .. }
            | Self::Action { phase, .. } => Some(*phase),
            Self::Cancelled(_) | Self::Internal(_) => None,
        }
    }
}

/// Result type alias for the autopilot.
pub type Result<T> = std::result::Result<T, Error>;
