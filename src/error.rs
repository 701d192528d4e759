use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("A session is already running with a different configuration")]
    SessionAlreadyRunning,

    #[error("No session is running")]
    SessionNotRunning,

    #[error("Flow {0} already has a pending breakpoint")]
    DuplicateBreakpoint(String),

    #[error("Flow {0} has no pending breakpoint")]
    NoPendingBreakpoint(String),

    #[error("Stage mismatch: {0}")]
    StageMismatch(String),

    #[error("Subscriber {0} overflowed its event buffer and was disconnected")]
    Overflow(u64),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Invalid transition for flow {flow_id} from {from} to {to}")]
    InvalidTransition {
        flow_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout error")]
    Timeout,
}

impl ControlError {
    /// Caller-input errors are recovered locally and never touch session state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ControlError::SessionAlreadyRunning
                | ControlError::DuplicateBreakpoint(_)
                | ControlError::NoPendingBreakpoint(_)
                | ControlError::StageMismatch(_)
                | ControlError::FlowNotFound(_)
                | ControlError::InvalidRule(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Failed to start engine: {0}")]
    StartFailed(String),

    #[error("Failed to stop engine: {0}")]
    StopFailed(String),

    #[error("Engine connection lost: {0}")]
    ConnectionLost(String),

    #[error("Engine rejected command: {0}")]
    CommandRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u64),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Terminal error outcome of a single flow. Not a system fault.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum FlowError {
    #[error("Simulated packet loss")]
    SimulatedPacketLoss,

    #[error("Engine reported error: {message}")]
    Adapter { message: String },

    #[error("Session stopped before the flow finished")]
    SessionStopped,
}

pub type Result<T> = std::result::Result<T, ControlError>;

impl warp::reject::Reject for ControlError {}
