use crate::breakpoint::BreakpointPolicy;
use crate::rules::Rule;
use crate::throttle::ThrottleProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub breakpoints: BreakpointConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub throttle: ThrottleProfile,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
}

/// Parameters handed to the engine when a session starts. Two starts with
/// equal configs are the same session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_session_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_true")]
    pub ssl_interception: bool,
    #[serde(default)]
    pub bypass_list: BTreeSet<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: default_session_port(),
            bind_address: default_bind_address(),
            ssl_interception: true,
            bypass_list: BTreeSet::new(),
        }
    }
}

impl SessionConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointConfig {
    /// Zero keeps tickets open until the consumer acts
    #[serde(default)]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub timeout_policy: BreakpointPolicy,
    #[serde(default)]
    pub stop_policy: BreakpointPolicy,
}

impl BreakpointConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsConfig {
    /// Per-subscriber queue length before the subscriber is disconnected
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Finished flows kept for late subscribers
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            start_timeout_ms: default_start_timeout(),
            stop_timeout_ms: default_stop_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl AdapterConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_bind_address(),
            port: default_api_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Filter directive, e.g. `flowctl=debug`
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Root certificate details reported by the certificate manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    pub fingerprint: String,
    pub not_after: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub trusted: bool,
}

fn default_session_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_subscriber_buffer() -> usize {
    1024
}

fn default_retention() -> usize {
    500
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:9999".to_string()
}

fn default_start_timeout() -> u64 {
    10_000
}

fn default_stop_timeout() -> u64 {
    5_000
}

fn default_command_timeout() -> u64 {
    5_000
}

fn default_api_port() -> u16 {
    8081
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BreakpointPolicy;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.port, 8080);
        assert_eq!(config.session.bind_address, "127.0.0.1");
        assert!(config.session.ssl_interception);
        assert_eq!(config.breakpoints.stop_policy, BreakpointPolicy::AutoAbort);
        assert_eq!(config.breakpoints.default_timeout(), None);
        assert_eq!(config.events.subscriber_buffer, 1024);
        assert!(!config.api.enabled);
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let yaml = r#"
session:
  port: 9090
  bypassList: ["*.apple.com", "localhost"]
breakpoints:
  defaultTimeoutMs: 30000
  timeoutPolicy: autoResume
throttle:
  latencyMs: 200
rules:
  - pattern: { host: "example.com" }
    action: { type: breakpointRequest }
    priority: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("Failed to deserialize");

        assert_eq!(config.session.port, 9090);
        assert_eq!(config.session.bypass_list.len(), 2);
        assert_eq!(config.breakpoints.timeout_policy, BreakpointPolicy::AutoResume);
        assert_eq!(config.breakpoints.stop_policy, BreakpointPolicy::AutoAbort);
        assert_eq!(
            config.breakpoints.default_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.throttle.latency_ms, 200);
        assert_eq!(config.rules.len(), 1);

        let back = serde_yaml::to_string(&config).expect("Failed to serialize");
        let again: Config = serde_yaml::from_str(&back).expect("Failed to deserialize");
        assert_eq!(again.session, config.session);
    }
}
