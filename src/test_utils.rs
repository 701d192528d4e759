//! In-process engine double for tests and demos.

use crate::adapter::{
    Ack, AdapterCapabilities, AdapterEvent, EngineState, EventSink, PlatformAdapter,
};
use crate::config::SessionConfig;
use crate::error::AdapterError;
use crate::flow::{FlowId, FlowRequest, FlowResponse, Modifications};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Start(SessionConfig),
    Stop,
    Hold(FlowId),
    Continue(FlowId, Option<Modifications>),
    Abort(FlowId),
}

/// Records every command it receives and lets tests push raw engine events.
pub struct MockAdapter {
    commands: Mutex<Vec<RecordedCommand>>,
    sink: Mutex<Option<EventSink>>,
    capabilities: AdapterCapabilities,
    start_failure: Mutex<Option<AdapterError>>,
    stop_delay: Option<Duration>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            capabilities: AdapterCapabilities::default(),
            start_failure: Mutex::new(None),
            stop_delay: None,
        }
    }

    /// Engine that cannot hold connections for breakpoints.
    pub fn without_hold(mut self) -> Self {
        self.capabilities.hold_connections = false;
        self
    }

    /// `stop` takes this long before acknowledging.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    /// The next `start` calls fail with `error` until cleared with `None`.
    pub fn fail_start(&self, error: Option<AdapterError>) {
        *self.start_failure.lock().unwrap() = error;
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Start(_)))
            .count()
    }

    /// Pushes an event as if the engine produced it. Returns false when no
    /// session is listening.
    pub fn inject(&self, event: AdapterEvent) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    pub fn request(&self, flow_id: &str, request: FlowRequest) -> bool {
        self.inject(AdapterEvent::request(flow_id, request))
    }

    pub fn response(&self, flow_id: &str, response: FlowResponse) -> bool {
        self.inject(AdapterEvent::response(flow_id, response))
    }

    pub fn error(&self, flow_id: &str, message: &str) -> bool {
        self.inject(AdapterEvent::error(flow_id, message))
    }

    pub fn report_status(&self, state: EngineState, message: Option<&str>) -> bool {
        self.inject(AdapterEvent::StatusChanged {
            state,
            message: message.map(str::to_string),
        })
    }

    fn record(&self, command: RecordedCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn start(&self, config: &SessionConfig, events: EventSink) -> Result<Ack, AdapterError> {
        self.record(RecordedCommand::Start(config.clone()));
        if let Some(error) = self.start_failure.lock().unwrap().clone() {
            return Err(error);
        }
        *self.sink.lock().unwrap() = Some(events);
        Ok(Ack::with_detail("mock engine started"))
    }

    async fn stop(&self) -> Result<Ack, AdapterError> {
        self.record(RecordedCommand::Stop);
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        self.sink.lock().unwrap().take();
        Ok(Ack::default())
    }

    async fn hold_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError> {
        self.record(RecordedCommand::Hold(flow_id.clone()));
        Ok(())
    }

    async fn continue_connection(
        &self,
        flow_id: &FlowId,
        modifications: Option<&Modifications>,
    ) -> Result<(), AdapterError> {
        self.record(RecordedCommand::Continue(
            flow_id.clone(),
            modifications.cloned(),
        ));
        Ok(())
    }

    async fn abort_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError> {
        self.record(RecordedCommand::Abort(flow_id.clone()));
        Ok(())
    }
}
