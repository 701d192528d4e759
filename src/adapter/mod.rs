//! Capability interface to the native capture engine.
//!
//! Exactly one [`PlatformAdapter`] is active per controller. It is injected at
//! construction time; the control plane never builds engines itself.

use crate::config::SessionConfig;
use crate::error::AdapterError;
use crate::flow::{FlowId, FlowRequest, FlowResponse, Modifications};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod bridge;
pub mod wire;

pub use bridge::BridgeAdapter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub detail: Option<String>,
}

impl Ack {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }
}

/// What the engine behind an adapter can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Connections can be held for breakpoints
    pub hold_connections: bool,
    /// Held connections accept request/response edits on continue
    pub modify_flows: bool,
    pub tls_interception: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            hold_connections: true,
            modify_flows: true,
            tls_interception: true,
        }
    }
}

/// Session-level state reported by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawFlowKind {
    RequestReceived(FlowRequest),
    ResponseReceived(FlowResponse),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawFlowEvent {
    pub flow_id: FlowId,
    /// Engine-provided ordering hint; arrival order is used when absent
    pub sequence: Option<u64>,
    pub kind: RawFlowKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Flow(RawFlowEvent),
    StatusChanged {
        state: EngineState,
        message: Option<String>,
    },
}

impl AdapterEvent {
    pub fn request(flow_id: impl Into<FlowId>, request: FlowRequest) -> Self {
        Self::Flow(RawFlowEvent {
            flow_id: flow_id.into(),
            sequence: None,
            kind: RawFlowKind::RequestReceived(request),
        })
    }

    pub fn response(flow_id: impl Into<FlowId>, response: FlowResponse) -> Self {
        Self::Flow(RawFlowEvent {
            flow_id: flow_id.into(),
            sequence: None,
            kind: RawFlowKind::ResponseReceived(response),
        })
    }

    pub fn error(flow_id: impl Into<FlowId>, message: impl Into<String>) -> Self {
        Self::Flow(RawFlowEvent {
            flow_id: flow_id.into(),
            sequence: None,
            kind: RawFlowKind::Error(message.into()),
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        if let Self::Flow(raw) = &mut self {
            raw.sequence = Some(sequence);
        }
        self
    }
}

/// Where an engine pushes raw events. Cheap to clone and never blocks the
/// engine's own execution context.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns false once the session is no longer listening.
    pub fn send(&self, event: AdapterEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn start(&self, config: &SessionConfig, events: EventSink) -> Result<Ack, AdapterError>;

    /// Best-effort. Must succeed on an already-stopped engine.
    async fn stop(&self) -> Result<Ack, AdapterError>;

    async fn hold_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError>;

    async fn continue_connection(
        &self,
        flow_id: &FlowId,
        modifications: Option<&Modifications>,
    ) -> Result<(), AdapterError>;

    async fn abort_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError>;
}
