//! Versioned JSON messages exchanged with an engine bridge.
//!
//! Every frame is a JSON object carrying `"v"` (the wire version) and
//! `"type"`. Frames with another version are rejected instead of being
//! interpreted with a guessed shape.

use super::{AdapterEvent, EngineState, RawFlowEvent, RawFlowKind};
use crate::config::SessionConfig;
use crate::error::AdapterError;
use crate::flow::{FlowId, FlowRequest, FlowResponse, Headers, Modifications};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WirePhase {
    Request,
    Response,
    Error,
}

/// Headers arrive either as ordered pairs or as a plain object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireHeaders {
    Pairs(Vec<(String, String)>),
    Map(BTreeMap<String, String>),
}

impl Default for WireHeaders {
    fn default() -> Self {
        Self::Pairs(Vec::new())
    }
}

impl From<WireHeaders> for Headers {
    fn from(headers: WireHeaders) -> Self {
        match headers {
            WireHeaders::Pairs(pairs) => pairs.into_iter().collect(),
            WireHeaders::Map(map) => map.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: WireHeaders,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub status_code: u16,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: WireHeaders,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFlow {
    pub id: String,
    pub phase: WirePhase,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub request: Option<WireRequest>,
    #[serde(default)]
    pub response: Option<WireResponse>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Engine to control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineMessage {
    Flow(WireFlow),
    Status {
        state: EngineState,
        #[serde(default)]
        message: Option<String>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Ack { command_id: String },
    #[serde(rename_all = "camelCase")]
    Nack { command_id: String, reason: String },
}

/// Control plane to engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Start {
        command_id: String,
        config: SessionConfig,
    },
    #[serde(rename_all = "camelCase")]
    Stop { command_id: String },
    #[serde(rename_all = "camelCase")]
    Hold { command_id: String, flow_id: FlowId },
    #[serde(rename_all = "camelCase")]
    Continue {
        command_id: String,
        flow_id: FlowId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified: Option<Modifications>,
    },
    #[serde(rename_all = "camelCase")]
    Abort { command_id: String, flow_id: FlowId },
    Ping,
}

impl ControlMessage {
    pub fn command_id(&self) -> Option<&str> {
        match self {
            Self::Start { command_id, .. }
            | Self::Stop { command_id }
            | Self::Hold { command_id, .. }
            | Self::Continue { command_id, .. }
            | Self::Abort { command_id, .. } => Some(command_id.as_str()),
            Self::Ping => None,
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, AdapterError> {
    let mut value =
        serde_json::to_value(message).map_err(|e| AdapterError::Protocol(e.to_string()))?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("v".to_string(), WIRE_VERSION.into());
        }
        None => {
            return Err(AdapterError::Protocol(
                "wire messages must be JSON objects".to_string(),
            ))
        }
    }
    Ok(value.to_string())
}

pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, AdapterError> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| AdapterError::Protocol(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| AdapterError::Protocol("frame is not a JSON object".to_string()))?;
    let version = object
        .remove("v")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| AdapterError::Protocol("frame has no wire version".to_string()))?;
    if version != WIRE_VERSION as u64 {
        return Err(AdapterError::UnsupportedVersion(version));
    }
    serde_json::from_value(value).map_err(|e| AdapterError::Protocol(e.to_string()))
}

fn body_bytes(text: Option<String>, base64: Option<String>) -> Result<Option<Vec<u8>>, AdapterError> {
    if let Some(encoded) = base64 {
        return STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| AdapterError::Protocol(format!("invalid bodyBase64: {}", e)));
    }
    Ok(text.map(String::into_bytes))
}

impl TryFrom<WireRequest> for FlowRequest {
    type Error = AdapterError;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        Ok(FlowRequest {
            method: wire.method,
            url: wire.url,
            headers: wire.headers.into(),
            body: body_bytes(wire.body, wire.body_base64)?,
        })
    }
}

impl TryFrom<WireResponse> for FlowResponse {
    type Error = AdapterError;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        Ok(FlowResponse {
            status_code: wire.status_code,
            reason: wire.reason,
            headers: wire.headers.into(),
            body: body_bytes(wire.body, wire.body_base64)?,
        })
    }
}

impl EngineMessage {
    /// Raw event carried by this message, if it carries one.
    pub fn into_event(self) -> Result<Option<AdapterEvent>, AdapterError> {
        match self {
            EngineMessage::Flow(flow) => {
                let kind = match flow.phase {
                    WirePhase::Request => RawFlowKind::RequestReceived(
                        flow.request
                            .ok_or_else(|| missing(&flow.id, "request"))?
                            .try_into()?,
                    ),
                    WirePhase::Response => RawFlowKind::ResponseReceived(
                        flow.response
                            .ok_or_else(|| missing(&flow.id, "response"))?
                            .try_into()?,
                    ),
                    WirePhase::Error => RawFlowKind::Error(
                        flow.error
                            .unwrap_or_else(|| "unspecified engine error".to_string()),
                    ),
                };
                Ok(Some(AdapterEvent::Flow(RawFlowEvent {
                    flow_id: FlowId::new(flow.id),
                    sequence: flow.seq,
                    kind,
                })))
            }
            EngineMessage::Status { state, message } => {
                Ok(Some(AdapterEvent::StatusChanged { state, message }))
            }
            EngineMessage::Pong | EngineMessage::Ack { .. } | EngineMessage::Nack { .. } => Ok(None),
        }
    }
}

fn missing(flow_id: &str, field: &str) -> AdapterError {
    AdapterError::Protocol(format!("flow {} is missing its {} payload", flow_id, field))
}
