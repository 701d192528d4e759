//! Breakpoint tickets: at most one outstanding decision per flow.
//!
//! A ticket is *engaged* when its flow is held at the ticket's stage and the
//! engine has been told to hold the connection. A consumer may also pause a
//! flow ahead of time; the ticket is then *armed* and engages when the flow
//! reaches that stage.
//!
//! Callers must serialize operations on the same flow. The event multiplexer
//! does this by routing every flow through a single lane task.

use crate::adapter::PlatformAdapter;
use crate::config::BreakpointConfig;
use crate::error::{ControlError, FlowError, Result};
use crate::flow::{
    Flow, FlowId, FlowStatus, Modifications, RequestModification, ResponseModification, Stage,
};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a ticket resolves when nobody decides in time, or when the session stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointPolicy {
    #[default]
    AutoAbort,
    AutoResume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointTicket {
    pub id: Uuid,
    pub flow_id: FlowId,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    /// Set when the flow is actually held
    pub engaged_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    timeout: Option<Duration>,
}

impl BreakpointTicket {
    fn new(flow_id: FlowId, stage: Stage, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            stage,
            created_at: Utc::now(),
            engaged_at: None,
            expires_at: None,
            timeout,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged_at.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn held_for(&self) -> Duration {
        self.engaged_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or_default()
    }
}

/// Outcome of a successful resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    pub stage: Stage,
    /// False when an armed ticket was cancelled before it engaged
    pub was_held: bool,
}

pub struct BreakpointCoordinator {
    tickets: DashMap<FlowId, BreakpointTicket>,
    adapter: Arc<dyn PlatformAdapter>,
    config: BreakpointConfig,
    metrics: Arc<Metrics>,
}

impl BreakpointCoordinator {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        config: BreakpointConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tickets: DashMap::new(),
            adapter,
            config,
            metrics,
        }
    }

    pub fn timeout_policy(&self) -> BreakpointPolicy {
        self.config.timeout_policy
    }

    pub fn stop_policy(&self) -> BreakpointPolicy {
        self.config.stop_policy
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.config.default_timeout()
    }

    pub fn ticket(&self, flow_id: &FlowId) -> Option<BreakpointTicket> {
        self.tickets.get(flow_id).map(|t| t.clone())
    }

    pub fn pending(&self) -> Vec<BreakpointTicket> {
        let mut tickets: Vec<_> = self.tickets.iter().map(|t| t.value().clone()).collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }

    /// Opens a ticket for `flow` at `stage`. Engages immediately when the flow
    /// sits at that stage's received status, otherwise arms it.
    pub async fn pause(
        &self,
        flow: &mut Flow,
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<BreakpointTicket> {
        if self.tickets.contains_key(&flow.id) {
            return Err(ControlError::DuplicateBreakpoint(flow.id.to_string()));
        }
        if !can_pause(flow.status, stage) {
            return Err(ControlError::StageMismatch(format!(
                "flow {} is {:?} and can no longer pause at the {:?} stage",
                flow.id, flow.status, stage
            )));
        }

        let mut ticket = BreakpointTicket::new(flow.id.clone(), stage, timeout);
        if flow.status == FlowStatus::received(stage) {
            self.hold(flow, &mut ticket).await?;
        } else {
            tracing::info!(flow_id = %flow.id, ?stage, "Breakpoint armed");
        }
        self.tickets.insert(flow.id.clone(), ticket.clone());
        Ok(ticket)
    }

    /// Engages an armed ticket once its flow reaches the ticket's stage.
    pub async fn engage(&self, flow: &mut Flow) -> Result<Option<BreakpointTicket>> {
        let mut ticket = match self.tickets.get(&flow.id) {
            Some(t) if !t.is_engaged() && flow.status == FlowStatus::received(t.stage) => t.clone(),
            _ => return Ok(None),
        };
        if let Err(e) = self.hold(flow, &mut ticket).await {
            self.tickets.remove(&flow.id);
            return Err(e);
        }
        self.tickets.insert(flow.id.clone(), ticket.clone());
        Ok(Some(ticket))
    }

    async fn hold(&self, flow: &mut Flow, ticket: &mut BreakpointTicket) -> Result<()> {
        if !self.adapter.capabilities().hold_connections {
            return Err(crate::error::AdapterError::CommandRejected(format!(
                "engine '{}' cannot hold connections",
                self.adapter.name()
            ))
            .into());
        }
        self.adapter.hold_connection(&flow.id).await?;
        flow.transition(FlowStatus::paused_at(ticket.stage))?;

        let now = Utc::now();
        ticket.engaged_at = Some(now);
        ticket.expires_at = ticket
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
        self.metrics.record_breakpoint_opened();
        tracing::info!(
            flow_id = %flow.id,
            stage = ?ticket.stage,
            timeout_ms = ticket.timeout.map(|t| t.as_millis() as u64),
            "Flow paused at breakpoint"
        );
        Ok(())
    }

    /// Clears the flow's ticket, applies edits and lets the engine continue.
    ///
    /// The caller moves the flow on (`Forwarded` or `Completed`) when
    /// `was_held` is true.
    pub async fn resume(
        &self,
        flow: &mut Flow,
        request: Option<RequestModification>,
        response: Option<ResponseModification>,
    ) -> Result<Resumed> {
        let ticket = self
            .ticket(&flow.id)
            .ok_or_else(|| ControlError::NoPendingBreakpoint(flow.id.to_string()))?;

        match (ticket.stage, &request, &response) {
            (Stage::Request, _, Some(_)) => {
                return Err(ControlError::StageMismatch(format!(
                    "flow {} is paused at the request stage; response edits are not accepted",
                    flow.id
                )))
            }
            (Stage::Response, Some(_), _) => {
                return Err(ControlError::StageMismatch(format!(
                    "flow {} is paused at the response stage; request edits are not accepted",
                    flow.id
                )))
            }
            _ => {}
        }

        if !ticket.is_engaged() {
            if request.is_some() || response.is_some() {
                return Err(ControlError::StageMismatch(format!(
                    "flow {} has not reached the {:?} stage yet",
                    flow.id, ticket.stage
                )));
            }
            self.tickets.remove(&flow.id);
            tracing::info!(flow_id = %flow.id, stage = ?ticket.stage, "Armed breakpoint cancelled");
            return Ok(Resumed {
                stage: ticket.stage,
                was_held: false,
            });
        }

        let modifications = match (request, response) {
            (Some(edit), _) => {
                flow.request.apply(&edit);
                Some(Modifications::Request(edit))
            }
            (_, Some(edit)) => {
                if let Some(resp) = flow.response.as_mut() {
                    resp.apply(&edit);
                }
                Some(Modifications::Response(edit))
            }
            _ => None,
        };
        if modifications.is_some() {
            flow.modified = true;
        }

        let result = self
            .adapter
            .continue_connection(&flow.id, modifications.as_ref())
            .await;
        self.close(&flow.id, &ticket);

        if let Err(e) = result {
            self.metrics.record_adapter_error();
            tracing::warn!(flow_id = %flow.id, error = %e, "Engine failed to continue held flow");
            flow.fail(FlowError::Adapter {
                message: e.to_string(),
            })?;
            return Err(e.into());
        }

        tracing::info!(
            flow_id = %flow.id,
            stage = ?ticket.stage,
            modified = modifications.is_some(),
            "Flow resumed"
        );
        Ok(Resumed {
            stage: ticket.stage,
            was_held: true,
        })
    }

    /// Terminates the flow's connection. Returns false for flows that were
    /// already terminal.
    pub async fn abort(&self, flow: &mut Flow) -> Result<bool> {
        if let Some((_, ticket)) = self.tickets.remove(&flow.id) {
            if ticket.is_engaged() {
                self.metrics.record_breakpoint_closed(ticket.held_for());
            }
        }
        if flow.is_terminal() {
            return Ok(false);
        }

        if let Err(e) = self.adapter.abort_connection(&flow.id).await {
            self.metrics.record_adapter_error();
            tracing::warn!(flow_id = %flow.id, error = %e, "Engine failed to abort connection");
        }
        flow.transition(FlowStatus::Aborted)?;
        tracing::info!(flow_id = %flow.id, "Flow aborted");
        Ok(true)
    }

    /// Policy to apply if `ticket_id` is still the flow's engaged ticket.
    pub fn expire(&self, flow_id: &FlowId, ticket_id: Uuid) -> Option<BreakpointPolicy> {
        let ticket = self.tickets.get(flow_id)?;
        if ticket.id != ticket_id || !ticket.is_engaged() {
            return None;
        }
        self.metrics.record_breakpoint_expired();
        tracing::info!(
            flow_id = %flow_id,
            stage = ?ticket.stage,
            policy = ?self.config.timeout_policy,
            "Breakpoint timed out"
        );
        Some(self.config.timeout_policy)
    }

    /// Drops any ticket for a flow that ended without a decision.
    pub fn discard(&self, flow_id: &FlowId) {
        if let Some((_, ticket)) = self.tickets.remove(flow_id) {
            if ticket.is_engaged() {
                self.metrics.record_breakpoint_closed(ticket.held_for());
            }
        }
    }

    fn close(&self, flow_id: &FlowId, ticket: &BreakpointTicket) {
        self.tickets.remove(flow_id);
        self.metrics.record_breakpoint_closed(ticket.held_for());
    }
}

/// Whether a flow in `status` can still stop at `stage`.
fn can_pause(status: FlowStatus, stage: Stage) -> bool {
    use FlowStatus::*;
    match stage {
        Stage::Request => matches!(status, Pending | RequestReceived),
        Stage::Response => matches!(
            status,
            Pending | RequestReceived | PausedAtRequestBreakpoint | Forwarded | ResponseReceived
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRequest, FlowResponse, Headers};
    use crate::test_utils::{MockAdapter, RecordedCommand};

    fn coordinator(adapter: Arc<MockAdapter>) -> BreakpointCoordinator {
        BreakpointCoordinator::new(adapter, BreakpointConfig::default(), Arc::new(Metrics::new()))
    }

    fn received_flow(id: &str) -> Flow {
        let mut flow = Flow::new(id.into());
        flow.request = FlowRequest::new("GET", "https://example.com/");
        flow.transition(FlowStatus::RequestReceived).unwrap();
        flow
    }

    #[tokio::test]
    async fn test_pause_holds_connection() {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = coordinator(adapter.clone());
        let mut flow = received_flow("f1");

        let ticket = coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();
        assert!(ticket.is_engaged());
        assert_eq!(flow.status, FlowStatus::PausedAtRequestBreakpoint);
        assert_eq!(
            adapter.commands(),
            vec![RecordedCommand::Hold(FlowId::new("f1"))]
        );
        assert_eq!(coordinator.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_second_pause_is_duplicate() {
        let coordinator = coordinator(Arc::new(MockAdapter::new()));
        let mut flow = received_flow("f1");

        coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();
        let err = coordinator
            .pause(&mut flow, Stage::Response, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DuplicateBreakpoint(_)));
        assert_eq!(coordinator.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_applies_request_edit() {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = coordinator(adapter.clone());
        let mut flow = received_flow("f1");
        coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();

        let edit = RequestModification {
            headers: Headers::from_iter([("X", "1")]),
            ..Default::default()
        };
        let resumed = coordinator
            .resume(&mut flow, Some(edit.clone()), None)
            .await
            .unwrap();

        assert_eq!(
            resumed,
            Resumed {
                stage: Stage::Request,
                was_held: true
            }
        );
        assert_eq!(flow.request.headers.get("x"), Some("1"));
        assert!(flow.modified);
        assert!(coordinator.ticket(&flow.id).is_none());
        assert_eq!(
            adapter.commands().last(),
            Some(&RecordedCommand::Continue(
                FlowId::new("f1"),
                Some(Modifications::Request(edit))
            ))
        );
    }

    #[tokio::test]
    async fn test_resume_without_ticket_or_wrong_stage() {
        let coordinator = coordinator(Arc::new(MockAdapter::new()));
        let mut flow = received_flow("f1");

        let err = coordinator.resume(&mut flow, None, None).await.unwrap_err();
        assert!(matches!(err, ControlError::NoPendingBreakpoint(_)));

        coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();
        let err = coordinator
            .resume(&mut flow, None, Some(ResponseModification::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StageMismatch(_)));
        // ticket survives a rejected resume
        assert!(coordinator.ticket(&flow.id).is_some());
    }

    #[tokio::test]
    async fn test_armed_ticket_engages_on_arrival() {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = coordinator(adapter.clone());
        let mut flow = received_flow("f1");
        flow.transition(FlowStatus::Forwarded).unwrap();

        let ticket = coordinator.pause(&mut flow, Stage::Response, None).await.unwrap();
        assert!(!ticket.is_engaged());
        assert!(adapter.commands().is_empty());

        flow.response = Some(FlowResponse::new(200));
        flow.transition(FlowStatus::ResponseReceived).unwrap();
        let engaged = coordinator.engage(&mut flow).await.unwrap().unwrap();
        assert!(engaged.is_engaged());
        assert_eq!(flow.status, FlowStatus::PausedAtResponseBreakpoint);
    }

    #[tokio::test]
    async fn test_armed_ticket_rejects_edits_but_can_be_cancelled() {
        let coordinator = coordinator(Arc::new(MockAdapter::new()));
        let mut flow = Flow::new("f1".into());
        coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();

        let err = coordinator
            .resume(&mut flow, Some(RequestModification::default()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StageMismatch(_)));

        let resumed = coordinator.resume(&mut flow, None, None).await.unwrap();
        assert!(!resumed.was_held);
        assert!(coordinator.pending().is_empty());
    }

    #[tokio::test]
    async fn test_pause_after_stage_is_mismatch() {
        let coordinator = coordinator(Arc::new(MockAdapter::new()));
        let mut flow = received_flow("f1");
        flow.transition(FlowStatus::Forwarded).unwrap();

        let err = coordinator
            .pause(&mut flow, Stage::Request, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StageMismatch(_)));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = coordinator(adapter.clone());
        let mut flow = received_flow("f1");
        coordinator.pause(&mut flow, Stage::Request, None).await.unwrap();

        assert!(coordinator.abort(&mut flow).await.unwrap());
        assert_eq!(flow.status, FlowStatus::Aborted);
        assert!(coordinator.pending().is_empty());

        assert!(!coordinator.abort(&mut flow).await.unwrap());
        let aborts = adapter
            .commands()
            .into_iter()
            .filter(|c| matches!(c, RecordedCommand::Abort(_)))
            .count();
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn test_hold_requires_capability() {
        let adapter = Arc::new(MockAdapter::new().without_hold());
        let coordinator = coordinator(adapter);
        let mut flow = received_flow("f1");

        let err = coordinator
            .pause(&mut flow, Stage::Request, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Adapter(_)));
        assert_eq!(flow.status, FlowStatus::RequestReceived);
        assert!(coordinator.pending().is_empty());
    }

    #[tokio::test]
    async fn test_expire_matches_ticket_id() {
        let coordinator = coordinator(Arc::new(MockAdapter::new()));
        let mut flow = received_flow("f1");
        let ticket = coordinator
            .pause(&mut flow, Stage::Request, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(ticket.expires_at.is_some());

        assert_eq!(coordinator.expire(&flow.id, Uuid::new_v4()), None);
        assert_eq!(
            coordinator.expire(&flow.id, ticket.id),
            Some(BreakpointPolicy::AutoAbort)
        );
    }
}
