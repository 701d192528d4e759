use crate::adapter::bridge::BridgeAdapter;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::rules::RuleAction;
use tracing::{error, info, warn};

/// Validates `config`, lists the rules it would install and optionally
/// checks that the engine bridge answers.
pub async fn run_config_check(config: Config, probe: bool) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    let session = &config.session;
    info!(
        "  Capture: {} (TLS interception {})",
        session.listen_address(),
        if session.ssl_interception { "on" } else { "off" }
    );
    if !session.bypass_list.is_empty() {
        info!("  Bypass: {}", session.bypass_list.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    if !config.throttle.is_disabled() {
        info!("  Throttle: {:?}", config.throttle);
    }

    info!("Checking {} rule(s)...", config.rules.len());
    for rule in &config.rules {
        let action = match &rule.action {
            RuleAction::Throttle(_) => "throttle",
            RuleAction::Bypass => "bypass",
            RuleAction::Block => "block",
            RuleAction::BreakpointRequest => "breakpoint (request)",
            RuleAction::BreakpointResponse => "breakpoint (response)",
            RuleAction::MapRemote { .. } => "map remote",
            RuleAction::MapLocal(_) => "map local",
        };
        let state = if rule.enabled { "" } else { " [disabled]" };
        info!(
            "  {} p{} {} {:?}{}",
            rule.name.as_deref().unwrap_or(&rule.id),
            rule.priority,
            action,
            rule.pattern,
            state
        );
    }

    if !probe {
        info!("\n✓ All checks passed");
        return Ok(());
    }

    let adapter = BridgeAdapter::new(&config.adapter);
    match adapter.probe().await {
        Ok(()) => {
            info!("  ✓ Engine bridge reachable at {}", adapter.url());
            info!("\n✓ All checks passed");
            Ok(())
        }
        Err(e) => {
            error!("  ✗ Engine bridge probe failed: {}", e);
            warn!("  ! Sessions cannot start until the bridge at {} is up", adapter.url());
            Err(ConfigError::Validation(format!("engine bridge unreachable: {}", e)).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, RulePattern};

    #[tokio::test]
    async fn test_check_without_probe() {
        let mut config = Config::default();
        config.rules.push(Rule::new(RulePattern::host("*.example.com"), RuleAction::Block, 1));
        tokio_test::assert_ok!(run_config_check(config, false).await);
    }

    #[tokio::test]
    async fn test_check_rejects_invalid_config() {
        let mut config = Config::default();
        config.session.port = 0;
        tokio_test::assert_err!(run_config_check(config, false).await);
    }

    #[tokio::test]
    async fn test_probe_of_closed_bridge_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = Config::default();
        config.adapter.bridge_url = format!("ws://{}", addr);
        config.adapter.start_timeout_ms = 500;
        assert!(run_config_check(config, true).await.is_err());
    }
}
