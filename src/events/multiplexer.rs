//! Projects raw engine events into flow state.
//!
//! Every flow gets its own lane task. Engine events, consumer commands,
//! throttle deadlines and breakpoint timeouts for one flow are handled by
//! that lane in order; lanes for different flows run independently.
//!
//! A lane opened by anything other than the flow's request waits at most
//! [`ORPHAN_GRACE`] for that request, and only [`MAX_ORPHAN_LANES`] such lanes
//! exist at once.

use super::{EventBus, FlowChange};
use crate::adapter::{AdapterEvent, EngineState, PlatformAdapter, RawFlowEvent, RawFlowKind};
use crate::breakpoint::{BreakpointCoordinator, BreakpointPolicy, BreakpointTicket};
use crate::error::{ControlError, FlowError, Result};
use crate::flow::{
    Flow, FlowId, FlowRequest, FlowResponse, FlowStatus, FlowTable, Headers, Modifications,
    RequestModification, ResponseModification, Stage,
};
use crate::metrics::Metrics;
use crate::rules::{DecisionAction, LocalResponse, Mapping, RuleEngine};
use crate::throttle::{Direction, ThrottleProfile, ThrottleSimulator};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// How long a lane waits for the request of a flow it has only seen later
/// events for.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(5);
pub const MAX_ORPHAN_LANES: usize = 256;
/// Early events buffered per flow
const MAX_DEFERRED: usize = 16;

/// Services every lane works against.
#[derive(Clone)]
pub struct Pipeline {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub rules: Arc<RuleEngine>,
    pub throttle: Arc<ThrottleSimulator>,
    pub breakpoints: Arc<BreakpointCoordinator>,
    pub table: Arc<FlowTable>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
}

/// Engine-level status forwarded to the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub message: Option<String>,
}

enum LaneCommand {
    Event(RawFlowEvent),
    Pause {
        stage: Stage,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<BreakpointTicket>>,
    },
    Resume {
        request: Option<RequestModification>,
        response: Option<ResponseModification>,
        reply: oneshot::Sender<Result<Flow>>,
    },
    Abort {
        reply: oneshot::Sender<Result<Flow>>,
    },
    Shutdown {
        policy: BreakpointPolicy,
    },
}

type Lanes = DashMap<FlowId, mpsc::UnboundedSender<LaneCommand>>;

pub struct EventMultiplexer {
    pipeline: Pipeline,
    lanes: Arc<Lanes>,
    orphans: Arc<AtomicUsize>,
    admitting: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EventMultiplexer {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            lanes: Arc::new(DashMap::new()),
            orphans: Arc::new(AtomicUsize::new(0)),
            admitting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Consumes the engine's event stream until it closes or the multiplexer
    /// shuts down.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
        status: mpsc::UnboundedSender<EngineStatus>,
    ) {
        let this = self.clone();
        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(AdapterEvent::Flow(raw)) => this.dispatch(raw),
                    Some(AdapterEvent::StatusChanged { state, message }) => {
                        let _ = status.send(EngineStatus { state, message });
                    }
                    None => break,
                }
            }
            tracing::debug!("Engine event stream ended");
        });
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lanes still waiting for their flow's request.
    pub fn orphan_count(&self) -> usize {
        self.orphans.load(Ordering::Acquire)
    }

    /// New flows are refused from now on; running lanes carry on.
    pub fn stop_admitting(&self) {
        self.admitting.store(false, Ordering::Release);
    }

    /// Routes one raw event to its flow's lane, opening a lane for new flows.
    pub fn dispatch(&self, raw: RawFlowEvent) {
        if let Some(lane) = self.lanes.get(&raw.flow_id) {
            if let Err(mpsc::error::SendError(LaneCommand::Event(raw))) =
                lane.send(LaneCommand::Event(raw))
            {
                self.duplicate(&raw, "flow already finished");
            }
            return;
        }

        if self.pipeline.table.is_retired(&raw.flow_id) {
            self.duplicate(&raw, "flow already finished");
            return;
        }
        if matches!(raw.kind, RawFlowKind::Error(_)) {
            tracing::debug!(flow_id = %raw.flow_id, "Error reported for unknown flow");
            return;
        }
        if !self.admitting.load(Ordering::Acquire) {
            tracing::debug!(flow_id = %raw.flow_id, "Not admitting new flows; dropping engine event");
            return;
        }

        // the flow's request may still be on its way, or the flow may have
        // left the retention buffer long ago
        let orphan = !matches!(raw.kind, RawFlowKind::RequestReceived(_));
        if orphan {
            if self.orphans.load(Ordering::Acquire) >= MAX_ORPHAN_LANES {
                self.duplicate(&raw, "too many flows waiting for their request");
                return;
            }
            self.orphans.fetch_add(1, Ordering::AcqRel);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let flow_id = raw.flow_id.clone();
        let _ = tx.send(LaneCommand::Event(raw));
        self.lanes.insert(flow_id.clone(), tx);

        let mut lane = FlowLane::new(flow_id, self.pipeline.clone(), self.lanes.clone());
        if orphan {
            lane.orphan = Some(self.orphans.clone());
        }
        self.tracker.spawn(lane.run(rx, self.cancel.child_token()));
    }

    fn duplicate(&self, raw: &RawFlowEvent, why: &str) {
        self.pipeline.metrics.record_duplicate();
        tracing::debug!(flow_id = %raw.flow_id, reason = why, "Discarding duplicate engine event");
    }

    pub async fn pause(
        &self,
        flow_id: &FlowId,
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<BreakpointTicket> {
        self.request(
            flow_id,
            |reply| LaneCommand::Pause {
                stage,
                timeout,
                reply,
            },
            |flow| {
                Err(ControlError::StageMismatch(format!(
                    "flow {} already finished as {:?}",
                    flow.id, flow.status
                )))
            },
        )
        .await
    }

    pub async fn resume(
        &self,
        flow_id: &FlowId,
        request: Option<RequestModification>,
        response: Option<ResponseModification>,
    ) -> Result<Flow> {
        self.request(
            flow_id,
            |reply| LaneCommand::Resume {
                request,
                response,
                reply,
            },
            |flow| Err(ControlError::NoPendingBreakpoint(flow.id.to_string())),
        )
        .await
    }

    /// Aborting a finished flow returns its final snapshot unchanged.
    pub async fn abort(&self, flow_id: &FlowId) -> Result<Flow> {
        self.request(flow_id, |reply| LaneCommand::Abort { reply }, Ok)
            .await
    }

    async fn request<T>(
        &self,
        flow_id: &FlowId,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LaneCommand,
        finished: impl FnOnce(Flow) -> Result<T>,
    ) -> Result<T> {
        let lane = self.lanes.get(flow_id).map(|l| l.clone());
        if let Some(lane) = lane {
            let (tx, rx) = oneshot::channel();
            if lane.send(build(tx)).is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }
        match self.pipeline.table.get(flow_id) {
            Some(flow) => finished(flow),
            None => Err(ControlError::FlowNotFound(flow_id.to_string())),
        }
    }

    /// Stops admitting events, resolves held flows with `policy` and waits up
    /// to `timeout` for every lane to finish. Lanes still running after that
    /// are cancelled.
    pub async fn shutdown(&self, policy: BreakpointPolicy, timeout: Duration) -> bool {
        self.admitting.store(false, Ordering::Release);
        for lane in self.lanes.iter() {
            let _ = lane.send(LaneCommand::Shutdown { policy });
        }
        self.tracker.close();

        let clean = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !clean {
            tracing::warn!(
                lanes = self.lanes.len(),
                "Flow lanes did not finish in time; cancelling"
            );
        }
        self.cancel.cancel();
        self.tracker.wait().await;
        clean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Forward,
    Complete,
}

enum Fit {
    Apply,
    Defer,
    Duplicate,
}

/// Per-flow worker. Owns the authoritative copy of its flow.
struct FlowLane {
    flow: Flow,
    pipeline: Pipeline,
    lanes: Arc<Lanes>,
    admitted: bool,
    opened_at: Instant,
    /// Slot in the orphan count, held until the request arrives
    orphan: Option<Arc<AtomicUsize>>,
    last_sequence: Option<u64>,
    deferred: Vec<RawFlowEvent>,
    bypassed: bool,
    /// Rule throttles matched at the current stage
    throttle: Option<ThrottleProfile>,
    scheduled: Option<(Instant, Step)>,
    expiry: Option<(Instant, Uuid)>,
}

impl FlowLane {
    fn new(flow_id: FlowId, pipeline: Pipeline, lanes: Arc<Lanes>) -> Self {
        Self {
            flow: Flow::new(flow_id),
            pipeline,
            lanes,
            admitted: false,
            opened_at: Instant::now(),
            orphan: None,
            last_sequence: None,
            deferred: Vec::new(),
            bypassed: false,
            throttle: None,
            scheduled: None,
            expiry: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LaneCommand>, cancel: CancellationToken) {
        while !self.flow.is_terminal() {
            let now = Instant::now();
            let scheduled_at = self.scheduled.map(|(at, _)| at);
            let expires_at = self.expiry.map(|(at, _)| at);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_now();
                    break;
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(scheduled_at.unwrap_or(now)), if scheduled_at.is_some() => {
                    if let Some((_, step)) = self.scheduled.take() {
                        self.perform(step);
                    }
                }
                _ = tokio::time::sleep_until(expires_at.unwrap_or(now)), if expires_at.is_some() => {
                    self.on_expiry().await;
                }
                _ = tokio::time::sleep_until(self.opened_at + ORPHAN_GRACE), if !self.admitted => {
                    for raw in std::mem::take(&mut self.deferred) {
                        self.discard(&raw, "request never arrived");
                    }
                    break;
                }
            }

            if !self.flow.is_terminal() {
                self.replay_deferred().await;
            }
        }
        self.retire(rx).await;
    }

    async fn handle(&mut self, command: LaneCommand) {
        match command {
            LaneCommand::Event(raw) => self.on_event(raw).await,
            LaneCommand::Pause {
                stage,
                timeout,
                reply,
            } => {
                let _ = reply.send(self.pause(stage, timeout).await);
            }
            LaneCommand::Resume {
                request,
                response,
                reply,
            } => {
                let _ = reply.send(self.resume(request, response).await);
            }
            LaneCommand::Abort { reply } => {
                let _ = reply.send(self.abort().await);
            }
            LaneCommand::Shutdown { policy } => self.shut_down(policy).await,
        }
    }

    fn fit(&self, kind: &RawFlowKind) -> Fit {
        use FlowStatus::*;
        match (kind, self.flow.status) {
            (_, status) if status.is_terminal() => Fit::Duplicate,
            (RawFlowKind::Error(_), _) => Fit::Apply,
            (RawFlowKind::RequestReceived(_), Pending) => Fit::Apply,
            (RawFlowKind::RequestReceived(_), _) => Fit::Duplicate,
            (RawFlowKind::ResponseReceived(_), Forwarded) => Fit::Apply,
            (
                RawFlowKind::ResponseReceived(_),
                Pending | RequestReceived | PausedAtRequestBreakpoint,
            ) => Fit::Defer,
            (RawFlowKind::ResponseReceived(_), _) => Fit::Duplicate,
        }
    }

    async fn on_event(&mut self, raw: RawFlowEvent) {
        if let (Some(seq), Some(last)) = (raw.sequence, self.last_sequence) {
            if seq <= last {
                self.discard(&raw, "sequence already applied");
                return;
            }
        }
        match self.fit(&raw.kind) {
            Fit::Apply => self.apply(raw).await,
            Fit::Defer if self.deferred.len() >= MAX_DEFERRED => {
                self.discard(&raw, "too many early events");
            }
            Fit::Defer => {
                tracing::debug!(flow_id = %self.flow.id, status = ?self.flow.status, "Deferring early engine event");
                self.deferred.push(raw);
            }
            Fit::Duplicate => self.discard(&raw, "event is behind the flow's status"),
        }
    }

    async fn replay_deferred(&mut self) {
        loop {
            let ready = self
                .deferred
                .iter()
                .position(|raw| !matches!(self.fit(&raw.kind), Fit::Defer));
            let Some(index) = ready else { break };
            let raw = self.deferred.remove(index);
            self.on_event(raw).await;
            if self.flow.is_terminal() {
                break;
            }
        }
    }

    fn discard(&self, raw: &RawFlowEvent, reason: &str) {
        self.pipeline.metrics.record_duplicate();
        tracing::debug!(
            flow_id = %raw.flow_id,
            sequence = raw.sequence,
            status = ?self.flow.status,
            reason,
            "Discarding duplicate engine event"
        );
    }

    async fn apply(&mut self, raw: RawFlowEvent) {
        if let Some(seq) = raw.sequence {
            self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
        }
        match raw.kind {
            RawFlowKind::RequestReceived(request) => self.on_request(request).await,
            RawFlowKind::ResponseReceived(response) => self.on_response(response).await,
            RawFlowKind::Error(message) => self.on_error(message),
        }
    }

    async fn on_request(&mut self, request: FlowRequest) {
        self.flow.request = request;
        if !self.advance(FlowStatus::RequestReceived) {
            return;
        }
        self.admitted = true;
        self.release_orphan_slot();
        self.pipeline.metrics.record_flow_admitted();
        self.emit(FlowChange::RequestReceived);
        self.decide(Stage::Request, Step::Forward).await;
    }

    async fn on_response(&mut self, response: FlowResponse) {
        self.flow.response = Some(response);
        if !self.advance(FlowStatus::ResponseReceived) {
            return;
        }
        self.emit(FlowChange::ResponseReceived);

        if self.bypassed {
            self.proceed(Step::Complete).await;
            return;
        }
        self.decide(Stage::Response, Step::Complete).await;
    }

    /// Evaluates the rules once for `stage`. An armed consumer breakpoint
    /// takes the place of the rule outcome unless a rule blocks the flow.
    async fn decide(&mut self, stage: Stage, next: Step) {
        let decision = self.pipeline.rules.evaluate(&self.flow, stage);
        self.throttle = decision.throttle;
        if decision.action == DecisionAction::Block {
            self.block().await;
            return;
        }
        if let Some(mapping) = decision.mapping {
            self.apply_mapping(mapping).await;
        }
        match decision.action {
            DecisionAction::Bypass => {
                self.bypassed = true;
                self.proceed(next).await;
            }
            DecisionAction::Breakpoint(stage) => {
                if !self.engage_armed().await {
                    self.open_breakpoint(stage, next).await;
                }
            }
            DecisionAction::Forward | DecisionAction::Block => self.proceed(next).await,
        }
    }

    /// Holds the flow for an armed breakpoint, or moves it on through the throttle.
    async fn proceed(&mut self, next: Step) {
        if !self.engage_armed().await {
            self.schedule(next);
        }
    }

    async fn apply_mapping(&mut self, mapping: Mapping) {
        let modifications = match mapping {
            Mapping::Remote { target_url } => {
                tracing::info!(flow_id = %self.flow.id, from = %self.flow.request.url, to = %target_url, "Map remote");
                let edit = RequestModification {
                    url: Some(target_url),
                    ..Default::default()
                };
                self.flow.request.apply(&edit);
                Modifications::Request(edit)
            }
            Mapping::Local(local) => match local_response(&local, self.flow.response.as_ref()).await {
                Ok(edit) => {
                    tracing::info!(flow_id = %self.flow.id, file = %local.file_path.display(), "Map local");
                    if let Some(response) = self.flow.response.as_mut() {
                        response.apply(&edit);
                    }
                    Modifications::Response(edit)
                }
                Err(e) => {
                    tracing::error!(flow_id = %self.flow.id, file = %local.file_path.display(), error = %e, "Map local failed");
                    return;
                }
            },
        };

        self.flow.modified = true;
        if let Err(e) = self
            .pipeline
            .adapter
            .continue_connection(&self.flow.id, Some(&modifications))
            .await
        {
            self.pipeline.metrics.record_adapter_error();
            tracing::warn!(flow_id = %self.flow.id, error = %e, "Engine rejected mapped rewrite");
        }
        self.emit(FlowChange::Modified);
    }

    fn on_error(&mut self, message: String) {
        tracing::warn!(flow_id = %self.flow.id, error = %message, "Engine reported flow error");
        self.pipeline.metrics.record_adapter_error();
        self.pipeline.breakpoints.discard(&self.flow.id);
        self.fail(FlowError::Adapter { message });
    }

    fn profile(&self) -> ThrottleProfile {
        self.pipeline.throttle.effective(self.throttle.as_ref())
    }

    /// Runs `step` once the throttle allows it.
    fn schedule(&mut self, step: Step) {
        let delay = if self.bypassed {
            Duration::ZERO
        } else {
            let (direction, bytes) = match step {
                Step::Forward => (Direction::Upload, self.flow.request.body_len()),
                Step::Complete => (
                    Direction::Download,
                    self.flow.response.as_ref().map_or(0, |r| r.body_len()),
                ),
            };
            self.pipeline
                .throttle
                .delay_for(direction, bytes, &self.profile())
        };

        if delay.is_zero() {
            self.perform(step);
        } else {
            tracing::trace!(flow_id = %self.flow.id, ?step, delay_ms = delay.as_millis() as u64, "Throttling flow");
            self.scheduled = Some((Instant::now() + delay, step));
        }
    }

    fn perform(&mut self, step: Step) {
        match step {
            Step::Forward => {
                if self.advance(FlowStatus::Forwarded) {
                    self.emit(FlowChange::Forwarded);
                }
            }
            Step::Complete => {
                if !self.bypassed && self.pipeline.throttle.roll_loss(&self.profile()) {
                    self.pipeline.metrics.record_simulated_loss();
                    tracing::info!(flow_id = %self.flow.id, "Simulated packet loss");
                    self.fail(FlowError::SimulatedPacketLoss);
                } else if self.advance(FlowStatus::Completed) {
                    self.emit(FlowChange::Completed);
                }
            }
        }
    }

    async fn block(&mut self) {
        tracing::info!(flow_id = %self.flow.id, "Flow blocked by rule");
        match self.pipeline.breakpoints.abort(&mut self.flow).await {
            Ok(true) => self.emit(FlowChange::Aborted),
            Ok(false) => {}
            Err(e) => tracing::error!(flow_id = %self.flow.id, error = %e, "Failed to block flow"),
        }
    }

    async fn engage_armed(&mut self) -> bool {
        match self.pipeline.breakpoints.engage(&mut self.flow).await {
            Ok(Some(ticket)) => {
                self.held(&ticket);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(flow_id = %self.flow.id, error = %e, "Could not hold flow for armed breakpoint");
                false
            }
        }
    }

    async fn open_breakpoint(&mut self, stage: Stage, otherwise: Step) {
        let timeout = self.pipeline.breakpoints.default_timeout();
        match self.pipeline.breakpoints.pause(&mut self.flow, stage, timeout).await {
            Ok(ticket) => self.held(&ticket),
            Err(e) => {
                tracing::warn!(flow_id = %self.flow.id, ?stage, error = %e, "Breakpoint skipped");
                self.schedule(otherwise);
            }
        }
    }

    fn held(&mut self, ticket: &BreakpointTicket) {
        self.scheduled = None;
        self.expiry = ticket
            .timeout()
            .map(|timeout| (Instant::now() + timeout, ticket.id));
        self.emit(FlowChange::Paused);
    }

    async fn pause(&mut self, stage: Stage, timeout: Option<Duration>) -> Result<BreakpointTicket> {
        if !self.admitted {
            return Err(ControlError::FlowNotFound(self.flow.id.to_string()));
        }
        let timeout = timeout.or_else(|| self.pipeline.breakpoints.default_timeout());
        let ticket = self
            .pipeline
            .breakpoints
            .pause(&mut self.flow, stage, timeout)
            .await?;
        if ticket.is_engaged() {
            self.held(&ticket);
        }
        Ok(ticket)
    }

    async fn resume(
        &mut self,
        request: Option<RequestModification>,
        response: Option<ResponseModification>,
    ) -> Result<Flow> {
        if !self.admitted {
            return Err(ControlError::FlowNotFound(self.flow.id.to_string()));
        }
        let edited = request.is_some() || response.is_some();
        let result = self
            .pipeline
            .breakpoints
            .resume(&mut self.flow, request, response)
            .await;

        match result {
            Ok(resumed) if resumed.was_held => {
                self.expiry = None;
                if edited {
                    self.emit(FlowChange::Modified);
                }
                self.schedule(match resumed.stage {
                    Stage::Request => Step::Forward,
                    Stage::Response => Step::Complete,
                });
                Ok(self.flow.clone())
            }
            Ok(_) => Ok(self.flow.clone()),
            Err(e) => {
                if self.flow.status == FlowStatus::Errored {
                    self.expiry = None;
                    self.emit(FlowChange::Errored);
                }
                Err(e)
            }
        }
    }

    async fn abort(&mut self) -> Result<Flow> {
        if self.pipeline.breakpoints.abort(&mut self.flow).await? {
            self.scheduled = None;
            self.expiry = None;
            self.emit(FlowChange::Aborted);
        }
        Ok(self.flow.clone())
    }

    async fn on_expiry(&mut self) {
        let Some((_, ticket_id)) = self.expiry.take() else {
            return;
        };
        match self.pipeline.breakpoints.expire(&self.flow.id, ticket_id) {
            Some(BreakpointPolicy::AutoAbort) => {
                if let Err(e) = self.abort().await {
                    tracing::error!(flow_id = %self.flow.id, error = %e, "Failed to abort expired breakpoint");
                }
            }
            Some(BreakpointPolicy::AutoResume) => {
                if let Err(e) = self.resume(None, None).await {
                    tracing::error!(flow_id = %self.flow.id, error = %e, "Failed to resume expired breakpoint");
                }
            }
            None => {}
        }
    }

    async fn shut_down(&mut self, policy: BreakpointPolicy) {
        self.scheduled = None;
        self.expiry = None;

        if self.flow.status.is_paused() {
            match policy {
                BreakpointPolicy::AutoAbort => {
                    if let Err(e) = self.abort().await {
                        tracing::warn!(flow_id = %self.flow.id, error = %e, "Abort on stop failed");
                    }
                }
                BreakpointPolicy::AutoResume => {
                    if let Ok(resumed) = self.pipeline.breakpoints.resume(&mut self.flow, None, None).await {
                        let next = match resumed.stage {
                            Stage::Request => Step::Forward,
                            Stage::Response => Step::Complete,
                        };
                        self.bypassed = true;
                        self.perform(next);
                    }
                }
            }
        }
        self.stop_now();
    }

    /// Ends the flow without further engine calls.
    fn stop_now(&mut self) {
        self.pipeline.breakpoints.discard(&self.flow.id);
        if !self.flow.is_terminal() {
            self.fail(FlowError::SessionStopped);
        }
    }

    fn advance(&mut self, next: FlowStatus) -> bool {
        match self.flow.transition(next) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(flow_id = %self.flow.id, error = %e, "Rejected flow transition");
                false
            }
        }
    }

    fn fail(&mut self, error: FlowError) {
        self.scheduled = None;
        self.expiry = None;
        match self.flow.fail(error) {
            Ok(()) => self.emit(FlowChange::Errored),
            Err(e) => tracing::error!(flow_id = %self.flow.id, error = %e, "Rejected flow failure"),
        }
    }

    fn emit(&self, change: FlowChange) {
        if !self.admitted {
            return;
        }
        self.pipeline.table.upsert(&self.flow);
        self.pipeline.bus.publish_flow(change, &self.flow);
    }

    fn release_orphan_slot(&mut self) {
        if let Some(orphans) = self.orphan.take() {
            orphans.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn retire(mut self, mut rx: mpsc::UnboundedReceiver<LaneCommand>) {
        self.release_orphan_slot();
        let flow_id = self.flow.id.clone();
        if self.admitted {
            self.pipeline.metrics.record_flow_finished(self.flow.status);
            self.pipeline.table.retire(self.flow.clone());
        }
        self.lanes.remove(&flow_id);
        tracing::debug!(flow_id = %flow_id, status = ?self.flow.status, "Flow retired");

        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                LaneCommand::Event(raw) => self.discard(&raw, "flow already finished"),
                LaneCommand::Pause { reply, .. } => {
                    let _ = reply.send(Err(ControlError::StageMismatch(format!(
                        "flow {} already finished as {:?}",
                        flow_id, self.flow.status
                    ))));
                }
                LaneCommand::Resume { reply, .. } => {
                    let _ = reply.send(Err(ControlError::NoPendingBreakpoint(flow_id.to_string())));
                }
                LaneCommand::Abort { reply } => {
                    let _ = reply.send(Ok(self.flow.clone()));
                }
                LaneCommand::Shutdown { .. } => {}
            }
        }
    }
}

/// Edit that swaps the upstream response for the file behind `local`.
async fn local_response(
    local: &LocalResponse,
    current: Option<&FlowResponse>,
) -> std::io::Result<ResponseModification> {
    let body = tokio::fs::read(&local.file_path).await?;
    let headers = local.headers.clone().unwrap_or_else(|| {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/octet-stream");
        headers
    });
    let mut remove_headers: Vec<String> = Vec::new();
    for (name, _) in current.map(|r| r.headers.iter()).into_iter().flatten() {
        if !remove_headers.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            remove_headers.push(name.to_string());
        }
    }
    Ok(ResponseModification {
        status_code: Some(local.status_code.unwrap_or(200)),
        reason: None,
        headers,
        remove_headers,
        body: Some(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakpointConfig;
    use crate::events::{ControlEvent, Subscription};
    use crate::rules::{Rule, RuleAction, RulePattern};
    use crate::test_utils::{MockAdapter, RecordedCommand};

    struct Harness {
        mux: Arc<EventMultiplexer>,
        pipeline: Pipeline,
        adapter: Arc<MockAdapter>,
        events: Subscription,
    }

    fn harness(rules: Vec<Rule>) -> Harness {
        let adapter = Arc::new(MockAdapter::new());
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(64, metrics.clone()));
        let rule_engine = Arc::new(RuleEngine::new());
        rule_engine.set_rules(rules).unwrap();
        let pipeline = Pipeline {
            adapter: adapter.clone(),
            rules: rule_engine,
            throttle: Arc::new(ThrottleSimulator::with_seed(7)),
            breakpoints: Arc::new(BreakpointCoordinator::new(
                adapter.clone(),
                BreakpointConfig::default(),
                metrics.clone(),
            )),
            table: Arc::new(FlowTable::new(16)),
            bus: bus.clone(),
            metrics,
        };
        Harness {
            mux: Arc::new(EventMultiplexer::new(pipeline.clone())),
            events: bus.subscribe(),
            pipeline,
            adapter,
        }
    }

    fn request(id: &str) -> RawFlowEvent {
        RawFlowEvent {
            flow_id: FlowId::new(id),
            sequence: None,
            kind: RawFlowKind::RequestReceived(FlowRequest::new("GET", "https://example.com/")),
        }
    }

    fn response(id: &str) -> RawFlowEvent {
        RawFlowEvent {
            flow_id: FlowId::new(id),
            sequence: None,
            kind: RawFlowKind::ResponseReceived(FlowResponse::new(200)),
        }
    }

    async fn next_change(events: &mut Subscription) -> FlowChange {
        match events.recv().await {
            Some(Ok(ControlEvent::Flow(event))) => event.change,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_flow_completes() {
        let mut h = harness(vec![]);
        h.mux.dispatch(request("f1"));
        h.mux.dispatch(response("f1"));

        for expected in [
            FlowChange::RequestReceived,
            FlowChange::Forwarded,
            FlowChange::ResponseReceived,
            FlowChange::Completed,
        ] {
            assert_eq!(next_change(&mut h.events).await, expected);
        }
    }

    #[tokio::test]
    async fn test_response_before_request_is_deferred() {
        let mut h = harness(vec![]);
        h.mux.dispatch(response("f1"));
        h.mux.dispatch(request("f1"));

        assert_eq!(next_change(&mut h.events).await, FlowChange::RequestReceived);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Forwarded);
        assert_eq!(next_change(&mut h.events).await, FlowChange::ResponseReceived);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Completed);
    }

    #[tokio::test]
    async fn test_block_rule_aborts_connection() {
        let mut h = harness(vec![Rule::new(
            RulePattern::host("example.com"),
            RuleAction::Block,
            1,
        )]);
        h.mux.dispatch(request("f1"));

        assert_eq!(next_change(&mut h.events).await, FlowChange::RequestReceived);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Aborted);
        assert_eq!(
            h.adapter.commands(),
            vec![RecordedCommand::Abort(FlowId::new("f1"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_responses_do_not_pile_up() {
        let h = harness(vec![]);
        for i in 0..1000 {
            h.mux.dispatch(response(&format!("gone-{}", i)));
        }
        assert_eq!(h.mux.lane_count(), MAX_ORPHAN_LANES);
        assert_eq!(h.mux.orphan_count(), MAX_ORPHAN_LANES);

        tokio::time::sleep(ORPHAN_GRACE + Duration::from_secs(1)).await;
        assert_eq!(h.mux.lane_count(), 0);
        assert_eq!(h.mux.orphan_count(), 0);
        assert!(h.pipeline.table.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_within_grace_adopts_orphan_lane() {
        let mut h = harness(vec![]);
        h.mux.dispatch(response("f1"));
        tokio::time::sleep(ORPHAN_GRACE / 2).await;
        h.mux.dispatch(request("f1"));

        assert_eq!(next_change(&mut h.events).await, FlowChange::RequestReceived);
        assert_eq!(h.mux.orphan_count(), 0);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Forwarded);
        assert_eq!(next_change(&mut h.events).await, FlowChange::ResponseReceived);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Completed);
    }

    #[tokio::test]
    async fn test_abort_unknown_flow() {
        let h = harness(vec![]);
        let err = h.mux.abort(&FlowId::new("nope")).await.unwrap_err();
        assert!(matches!(err, ControlError::FlowNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_held_flows() {
        let mut h = harness(vec![Rule::new(
            RulePattern::host("*"),
            RuleAction::BreakpointRequest,
            1,
        )]);
        h.mux.dispatch(request("f1"));
        assert_eq!(next_change(&mut h.events).await, FlowChange::RequestReceived);
        assert_eq!(next_change(&mut h.events).await, FlowChange::Paused);

        assert!(
            h.mux
                .shutdown(BreakpointPolicy::AutoAbort, Duration::from_secs(1))
                .await
        );
        assert_eq!(next_change(&mut h.events).await, FlowChange::Aborted);
        assert_eq!(h.mux.lane_count(), 0);
        assert!(h.pipeline.breakpoints.pending().is_empty());

        let flow = h.pipeline.table.get(&FlowId::new("f1")).unwrap();
        assert_eq!(flow.status, FlowStatus::Aborted);
    }
}
