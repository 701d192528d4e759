#![allow(dead_code)]

use flowctl::config::Config;
use flowctl::events::{ControlEvent, FlowChange, FlowEvent, Subscription};
use flowctl::test_utils::MockAdapter;
use flowctl::throttle::ThrottleSimulator;
use flowctl::{FlowId, SessionController, SessionState};
use std::sync::Arc;
use std::time::Duration;

pub fn controller_with(adapter: Arc<MockAdapter>, config: Config) -> SessionController {
    SessionController::with_throttle(adapter, &config, ThrottleSimulator::with_seed(42))
        .expect("controller")
}

pub fn controller(adapter: Arc<MockAdapter>) -> SessionController {
    controller_with(adapter, Config::default())
}

/// Next flow event, skipping session events.
pub async fn next_flow(events: &mut Subscription) -> FlowEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a flow event")
            .expect("event stream ended")
            .expect("subscriber overflowed");
        if let ControlEvent::Flow(flow) = event {
            return flow;
        }
    }
}

/// Skips events until `flow_id` reports `change`.
pub async fn wait_for(events: &mut Subscription, flow_id: &str, change: FlowChange) -> FlowEvent {
    loop {
        let event = next_flow(events).await;
        if event.flow.id == FlowId::new(flow_id) && event.change == change {
            return event;
        }
    }
}

pub async fn wait_for_session(events: &mut Subscription, state: SessionState) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event stream ended")
            .expect("subscriber overflowed");
        if let ControlEvent::Session(session) = event {
            if session.state == state {
                return;
            }
        }
    }
}
