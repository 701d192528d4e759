//! Flow data model and the per-flow status state machine.
//!
//! A [`Flow`] is one intercepted request/response exchange. Its status only
//! ever moves forward along the edges encoded in [`FlowStatus::can_transition_to`].

use crate::error::{ControlError, FlowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod headers;
pub mod table;

pub use headers::Headers;
pub use table::FlowTable;

/// Opaque flow identifier assigned by the capture engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowStatus {
    Pending,
    RequestReceived,
    PausedAtRequestBreakpoint,
    Forwarded,
    ResponseReceived,
    PausedAtResponseBreakpoint,
    Completed,
    Aborted,
    Errored,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Errored)
    }

    /// Position along the request/response path. Terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::RequestReceived => 1,
            Self::PausedAtRequestBreakpoint => 2,
            Self::Forwarded => 3,
            Self::ResponseReceived => 4,
            Self::PausedAtResponseBreakpoint => 5,
            Self::Completed | Self::Aborted | Self::Errored => 6,
        }
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            Self::PausedAtRequestBreakpoint | Self::PausedAtResponseBreakpoint
        )
    }

    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Errored) | (_, Aborted) => true,
            (Pending, RequestReceived) => true,
            (RequestReceived, PausedAtRequestBreakpoint) => true,
            (RequestReceived, Forwarded) => true,
            (PausedAtRequestBreakpoint, Forwarded) => true,
            (Forwarded, ResponseReceived) => true,
            (ResponseReceived, PausedAtResponseBreakpoint) => true,
            (ResponseReceived, Completed) => true,
            (PausedAtResponseBreakpoint, Completed) => true,
            _ => false,
        }
    }

    pub fn paused_at(stage: Stage) -> Self {
        match stage {
            Stage::Request => Self::PausedAtRequestBreakpoint,
            Stage::Response => Self::PausedAtResponseBreakpoint,
        }
    }

    pub fn received(stage: Stage) -> Self {
        match stage {
            Stage::Request => Self::RequestReceived,
            Stage::Response => Self::ResponseReceived,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    #[serde(default, with = "body_serde", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl FlowRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len() as u64)
    }

    /// Host component of the URL, falling back to the `Host` header.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .or_else(|| {
                self.headers
                    .get("host")
                    .map(|h| h.split(':').next().unwrap_or(h).to_string())
            })
    }

    pub fn path(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(u) => u.path().to_string(),
            Err(_) => self
                .url
                .split('?')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn apply(&mut self, edit: &RequestModification) {
        if let Some(method) = &edit.method {
            self.method = method.clone();
        }
        if let Some(url) = &edit.url {
            self.url = url.clone();
        }
        for name in &edit.remove_headers {
            self.headers.remove(name);
        }
        for (name, value) in edit.headers.iter() {
            self.headers.set(name, value);
        }
        if let Some(body) = &edit.body {
            self.body = Some(body.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub headers: Headers,
    #[serde(default, with = "body_serde", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl FlowResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len() as u64)
    }

    pub fn apply(&mut self, edit: &ResponseModification) {
        if let Some(code) = edit.status_code {
            self.status_code = code;
        }
        if let Some(reason) = &edit.reason {
            self.reason = Some(reason.clone());
        }
        for name in &edit.remove_headers {
            self.headers.remove(name);
        }
        for (name, value) in edit.headers.iter() {
            self.headers.set(name, value);
        }
        if let Some(body) = &edit.body {
            self.body = Some(body.clone());
        }
    }
}

/// Edits applied to a request when resuming a request breakpoint.
/// Supplied headers replace same-named headers; others are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestModification {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    #[serde(default, with = "body_serde")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseModification {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    #[serde(default, with = "body_serde")]
    pub body: Option<Vec<u8>>,
}

/// Modification handed to the engine together with a continue command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum Modifications {
    Request(RequestModification),
    Response(ResponseModification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTimestamps {
    pub created: DateTime<Utc>,
    pub request_completed: Option<DateTime<Utc>>,
    pub response_completed: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub request: FlowRequest,
    pub response: Option<FlowResponse>,
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowError>,
    pub timestamps: FlowTimestamps,
    /// Set once a breakpoint edit has been applied.
    pub modified: bool,
}

impl Flow {
    pub fn new(id: FlowId) -> Self {
        Self {
            id,
            request: FlowRequest::default(),
            response: None,
            status: FlowStatus::Pending,
            error: None,
            timestamps: FlowTimestamps {
                created: Utc::now(),
                request_completed: None,
                response_completed: None,
                finished: None,
            },
            modified: false,
        }
    }

    pub fn transition(&mut self, next: FlowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ControlError::InvalidTransition {
                flow_id: self.id.to_string(),
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        let now = Utc::now();
        match next {
            FlowStatus::RequestReceived => self.timestamps.request_completed = Some(now),
            FlowStatus::ResponseReceived => self.timestamps.response_completed = Some(now),
            s if s.is_terminal() => self.timestamps.finished = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, error: FlowError) -> Result<()> {
        self.transition(FlowStatus::Errored)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

mod body_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
