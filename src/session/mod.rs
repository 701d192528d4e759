use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub mod controller;

pub use controller::SessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Snapshot of the single capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Option<Uuid>,
    pub port: u16,
    pub bind_address: String,
    pub bypass_list: BTreeSet<String>,
    pub ssl_interception_enabled: bool,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::idle()
    }
}

impl Session {
    /// A session that has never run.
    pub fn idle() -> Self {
        Self::for_config(&SessionConfig::default(), SessionState::Stopped)
    }

    pub(crate) fn for_config(config: &SessionConfig, state: SessionState) -> Self {
        Self {
            session_id: None,
            port: config.port,
            bind_address: config.bind_address.clone(),
            bypass_list: config.bypass_list.clone(),
            ssl_interception_enabled: config.ssl_interception,
            state,
            started_at: None,
            stopped_at: None,
            last_error: None,
        }
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            port: self.port,
            bind_address: self.bind_address.clone(),
            ssl_interception: self.ssl_interception_enabled,
            bypass_list: self.bypass_list.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }
}

/// Result of `stop`. Warnings never prevent the session from reaching `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub session: Session,
    pub warnings: Vec<String>,
}
