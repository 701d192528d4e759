use super::{Session, SessionState, StopReport};
use crate::adapter::{EngineState, EventSink, PlatformAdapter};
use crate::breakpoint::{BreakpointCoordinator, BreakpointPolicy, BreakpointTicket};
use crate::certificate::{self, CertificateProvider, CertificateStatus};
use crate::config::{Config, SessionConfig};
use crate::error::{ControlError, Result};
use crate::events::multiplexer::{EngineStatus, Pipeline};
use crate::events::{EventBus, EventMultiplexer, Subscription};
use crate::flow::{Flow, FlowId, FlowTable, RequestModification, ResponseModification, Stage};
use crate::metrics::Metrics;
use crate::rules::{Rule, RuleEngine};
use crate::throttle::{ThrottleProfile, ThrottleSimulator};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct ActiveRun {
    config: SessionConfig,
    multiplexer: Arc<EventMultiplexer>,
    watcher: JoinHandle<()>,
}

/// Owns the single capture session and every consumer-facing operation.
///
/// `start` and `stop` are serialized by one lifecycle lock; everything else
/// reads snapshots and never waits on the engine's lifecycle.
pub struct SessionController {
    adapter: Arc<dyn PlatformAdapter>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    pipeline: Pipeline,
    session: Arc<ArcSwap<Session>>,
    multiplexer: Arc<ArcSwapOption<EventMultiplexer>>,
    lifecycle: Mutex<Option<ActiveRun>>,
    stop_timeout: Duration,
}

impl SessionController {
    pub fn new(adapter: Arc<dyn PlatformAdapter>, config: &Config) -> Result<Self> {
        Self::with_throttle(adapter, config, ThrottleSimulator::new())
    }

    /// Same as [`new`](Self::new) with a caller-supplied throttle simulator,
    /// e.g. a seeded one for reproducible loss.
    pub fn with_throttle(
        adapter: Arc<dyn PlatformAdapter>,
        config: &Config,
        throttle: ThrottleSimulator,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());

        let rules = Arc::new(RuleEngine::new());
        rules.set_rules(config.rules.clone())?;
        throttle.set_profile(config.throttle.clone())?;

        let pipeline = Pipeline {
            adapter: adapter.clone(),
            rules,
            throttle: Arc::new(throttle),
            breakpoints: Arc::new(BreakpointCoordinator::new(
                adapter.clone(),
                config.breakpoints.clone(),
                metrics.clone(),
            )),
            table: Arc::new(FlowTable::new(config.events.retention)),
            bus: Arc::new(EventBus::new(config.events.subscriber_buffer, metrics.clone())),
            metrics,
        };

        Ok(Self {
            adapter,
            certificates: None,
            pipeline,
            session: Arc::new(ArcSwap::from_pointee(Session::for_config(
                &config.session,
                SessionState::Stopped,
            ))),
            multiplexer: Arc::new(ArcSwapOption::empty()),
            lifecycle: Mutex::new(None),
            stop_timeout: config.adapter.stop_timeout(),
        })
    }

    pub fn with_certificates(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(provider);
        self
    }

    /// Current session snapshot. Never waits on the engine.
    pub fn status(&self) -> Session {
        self.session.load().as_ref().clone()
    }

    pub async fn start(&self, config: SessionConfig) -> Result<Session> {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(run) = lifecycle.as_ref() {
            if self.session.load().is_running() {
                if run.config == config {
                    tracing::debug!("Session already running with the same configuration");
                    return Ok(self.status());
                }
                return Err(ControlError::SessionAlreadyRunning);
            }
        }
        // a failed run still holds resources
        if let Some(run) = lifecycle.take() {
            self.teardown(run).await;
        }

        self.check_certificate(&config).await;
        self.pipeline.rules.set_bypass_list(&config.bypass_list)?;

        self.transition(Session::for_config(&config, SessionState::Starting), None);
        tracing::info!(
            adapter = self.adapter.name(),
            address = %config.listen_address(),
            ssl_interception = config.ssl_interception,
            "Starting capture session"
        );

        let (sink, events) = EventSink::channel();
        if let Err(e) = self.adapter.start(&config, sink).await {
            self.pipeline.metrics.record_adapter_error();
            tracing::error!(error = %e, "Engine failed to start");
            let mut failed = Session::for_config(&config, SessionState::Failed);
            failed.last_error = Some(e.to_string());
            self.transition(failed, Some(e.to_string()));
            return Err(e.into());
        }

        let multiplexer = Arc::new(EventMultiplexer::new(self.pipeline.clone()));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        multiplexer.spawn(events, status_tx);

        let watcher = tokio::spawn(watch_engine(
            status_rx,
            self.session.clone(),
            self.pipeline.bus.clone(),
            multiplexer.clone(),
            self.pipeline.metrics.clone(),
        ));

        let mut session = Session::for_config(&config, SessionState::Running);
        session.session_id = Some(Uuid::new_v4());
        session.started_at = Some(Utc::now());
        self.transition(session.clone(), None);
        self.pipeline.metrics.session_starts.inc();
        self.multiplexer.store(Some(multiplexer.clone()));

        *lifecycle = Some(ActiveRun {
            config,
            multiplexer,
            watcher,
        });
        tracing::info!(session_id = ?session.session_id, "Capture session running");
        Ok(session)
    }

    /// Resolves held flows with the stop policy, stops the engine and ends in
    /// `Stopped` whatever the engine does.
    pub async fn stop(&self) -> Result<StopReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        let run = lifecycle.take();
        if run.is_none() && self.status().state == SessionState::Stopped {
            return Ok(StopReport {
                session: self.status(),
                warnings: Vec::new(),
            });
        }

        let mut stopping = self.status();
        stopping.state = SessionState::Stopping;
        self.transition(stopping, None);
        tracing::info!("Stopping capture session");

        let warnings = match run {
            Some(run) => self.teardown(run).await,
            // a start that failed part way may have left the engine running
            None => {
                let mut warnings = Vec::new();
                self.stop_engine(&mut warnings).await;
                log_warnings(&warnings);
                warnings
            }
        };

        let mut stopped = self.status();
        stopped.state = SessionState::Stopped;
        stopped.stopped_at = Some(Utc::now());
        self.transition(stopped.clone(), None);
        tracing::info!(warnings = warnings.len(), "Capture session stopped");

        Ok(StopReport {
            session: stopped,
            warnings,
        })
    }

    async fn teardown(&self, run: ActiveRun) -> Vec<String> {
        let mut warnings = Vec::new();
        self.multiplexer.store(None);

        let policy = self.pipeline.breakpoints.stop_policy();
        if !run.multiplexer.shutdown(policy, self.stop_timeout).await {
            warnings.push("some flows did not settle before the stop timeout".to_string());
        }

        self.stop_engine(&mut warnings).await;

        run.watcher.abort();
        log_warnings(&warnings);
        warnings
    }

    async fn stop_engine(&self, warnings: &mut Vec<String>) {
        match tokio::time::timeout(self.stop_timeout, self.adapter.stop()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warnings.push(format!("engine stop failed: {}", e)),
            Err(_) => warnings.push(format!(
                "engine did not acknowledge stop within {:?}",
                self.stop_timeout
            )),
        }
    }

    fn transition(&self, session: Session, error: Option<String>) {
        let state = session.state;
        self.session.store(Arc::new(session));
        self.pipeline.bus.publish_session(state, error);
    }

    async fn check_certificate(&self, config: &SessionConfig) {
        if !config.ssl_interception {
            return;
        }
        if !self.adapter.capabilities().tls_interception {
            tracing::warn!(
                adapter = self.adapter.name(),
                "Engine cannot intercept TLS; HTTPS flows will be tunnelled"
            );
        }
        if self.certificates.is_some() {
            let status = self.certificate_status().await;
            if !status.usable() {
                tracing::warn!(
                    installed = status.installed,
                    trusted = status.trusted,
                    expired = status.expired,
                    "Root certificate is not usable for TLS interception"
                );
            }
        }
    }

    pub async fn certificate_status(&self) -> CertificateStatus {
        match &self.certificates {
            Some(provider) => certificate::status_of(provider.as_ref()).await,
            None => CertificateStatus::missing(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.pipeline.bus.subscribe()
    }

    /// Replaces the rule set. Flows already past a stage keep their earlier decision.
    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<()> {
        self.pipeline.rules.set_rules(rules)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.pipeline.rules.rules()
    }

    pub fn set_throttle(&self, profile: ThrottleProfile) -> Result<()> {
        self.pipeline.throttle.set_profile(profile)
    }

    pub fn throttle(&self) -> ThrottleProfile {
        self.pipeline.throttle.profile()
    }

    fn running_multiplexer(&self) -> Result<Arc<EventMultiplexer>> {
        self.multiplexer
            .load_full()
            .ok_or(ControlError::SessionNotRunning)
    }

    pub async fn pause_flow(
        &self,
        flow_id: &FlowId,
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<BreakpointTicket> {
        self.running_multiplexer()?
            .pause(flow_id, stage, timeout)
            .await
    }

    pub async fn resume_flow(
        &self,
        flow_id: &FlowId,
        request: Option<RequestModification>,
        response: Option<ResponseModification>,
    ) -> Result<Flow> {
        self.running_multiplexer()?
            .resume(flow_id, request, response)
            .await
    }

    /// Idempotent: aborting a finished flow returns it unchanged, even after
    /// the session stopped.
    pub async fn abort_flow(&self, flow_id: &FlowId) -> Result<Flow> {
        match self.running_multiplexer() {
            Ok(multiplexer) => multiplexer.abort(flow_id).await,
            Err(e) => self.pipeline.table.get(flow_id).ok_or(e),
        }
    }

    pub fn flow(&self, flow_id: &FlowId) -> Option<Flow> {
        self.pipeline.table.get(flow_id)
    }

    pub fn active_flows(&self) -> Vec<Flow> {
        self.pipeline.table.active()
    }

    /// Finished flows kept for late subscribers, oldest first.
    pub fn recent_flows(&self) -> Vec<Flow> {
        self.pipeline.table.recent()
    }

    pub fn pending_breakpoints(&self) -> Vec<BreakpointTicket> {
        self.pipeline.breakpoints.pending()
    }

    pub fn breakpoint_policies(&self) -> (BreakpointPolicy, BreakpointPolicy) {
        (
            self.pipeline.breakpoints.timeout_policy(),
            self.pipeline.breakpoints.stop_policy(),
        )
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.pipeline.metrics.clone()
    }
}

/// Reacts to engine-level status while a run is active. An engine failure
/// moves the session to `Failed` and blocks new flows until the next start.
async fn watch_engine(
    mut status: mpsc::UnboundedReceiver<EngineStatus>,
    session: Arc<ArcSwap<Session>>,
    bus: Arc<EventBus>,
    multiplexer: Arc<EventMultiplexer>,
    metrics: Arc<Metrics>,
) {
    while let Some(EngineStatus { state, message }) = status.recv().await {
        let current = session.load();
        if !current.is_running() {
            tracing::debug!(?state, "Ignoring engine status outside a running session");
            continue;
        }
        match state {
            EngineState::Running => {
                tracing::debug!(message = ?message, "Engine reports running");
            }
            EngineState::Failed | EngineState::Stopped => {
                let reason = message.unwrap_or_else(|| match state {
                    EngineState::Stopped => "engine stopped unexpectedly".to_string(),
                    _ => "engine failed".to_string(),
                });
                metrics.record_adapter_error();
                tracing::error!(reason = %reason, "Capture engine failed");

                multiplexer.stop_admitting();
                let mut failed = current.as_ref().clone();
                failed.state = SessionState::Failed;
                failed.last_error = Some(reason.clone());
                session.store(Arc::new(failed));
                bus.publish_session(SessionState::Failed, Some(reason));
            }
        }
    }
}

fn log_warnings(warnings: &[String]) {
    for warning in warnings {
        tracing::warn!(warning = %warning, "Session stop degraded");
    }
}
