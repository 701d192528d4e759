//! Consumer-visible event stream.

use crate::flow::{Flow, FlowStatus};
use crate::session::SessionState;
use serde::{Deserialize, Serialize};

pub mod bus;
pub mod multiplexer;

pub use bus::{EventBus, Subscription};
pub use multiplexer::EventMultiplexer;

/// What happened to a flow in one accepted state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowChange {
    RequestReceived,
    Paused,
    /// Breakpoint edits were applied to the snapshot
    Modified,
    Forwarded,
    ResponseReceived,
    Completed,
    Aborted,
    Errored,
}

impl FlowChange {
    pub fn for_status(status: FlowStatus) -> Option<Self> {
        Some(match status {
            FlowStatus::Pending => return None,
            FlowStatus::RequestReceived => Self::RequestReceived,
            FlowStatus::PausedAtRequestBreakpoint | FlowStatus::PausedAtResponseBreakpoint => {
                Self::Paused
            }
            FlowStatus::Forwarded => Self::Forwarded,
            FlowStatus::ResponseReceived => Self::ResponseReceived,
            FlowStatus::Completed => Self::Completed,
            FlowStatus::Aborted => Self::Aborted,
            FlowStatus::Errored => Self::Errored,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    /// Bus-wide publication order
    pub sequence: u64,
    pub change: FlowChange,
    pub flow: Flow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub sequence: u64,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlEvent {
    Flow(FlowEvent),
    Session(SessionEvent),
}

impl ControlEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            ControlEvent::Flow(e) => e.sequence,
            ControlEvent::Session(e) => e.sequence,
        }
    }

    pub fn as_flow(&self) -> Option<&FlowEvent> {
        match self {
            ControlEvent::Flow(e) => Some(e),
            ControlEvent::Session(_) => None,
        }
    }
}
