//! Flow and session control plane for an intercepting HTTP(S) debugging proxy.
//!
//! A [`SessionController`] owns one capture session backed by a
//! [`PlatformAdapter`]. Engine events run through the rule engine, the
//! throttle simulator and the breakpoint coordinator before they reach
//! subscribers as ordered [`ControlEvent`]s.

pub mod adapter;
pub mod breakpoint;
pub mod certificate;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod logging;
pub mod metrics;
pub mod rules;
pub mod session;
pub mod test_utils;
pub mod throttle;
pub mod web;

pub use adapter::{BridgeAdapter, PlatformAdapter};
pub use breakpoint::{BreakpointPolicy, BreakpointTicket};
pub use config::Config;
pub use error::{ControlError, Result};
pub use events::{ControlEvent, Subscription};
pub use flow::{Flow, FlowId, FlowStatus, Stage};
pub use rules::{Rule, RuleAction, RulePattern};
pub use session::{Session, SessionController, SessionState, StopReport};
pub use throttle::ThrottleProfile;
