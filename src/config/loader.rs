use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "FLOWCTL_";

fn base() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
}

/// Per-user configuration directory, e.g. `~/.config/flowctl` on Linux.
pub fn user_config_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("flowctl"))
}

/// Layers defaults, the per-user file, files in the working directory and
/// `FLOWCTL_*` variables, later sources winning.
pub fn load_from_env_or_file() -> Result<Config> {
    let mut figment = base();
    if let Some(dir) = user_config_dir() {
        figment = figment
            .merge(Toml::file(dir.join("flowctl.toml")))
            .merge(Yaml::file(dir.join("flowctl.yaml")));
    }

    let config: Config = figment
        .merge(Toml::file("flowctl.toml"))
        .merge(Json::file("flowctl.json"))
        .merge(Yaml::file("flowctl.yaml"))
        .merge(Yaml::file("flowctl.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => base().merge(Toml::file(path)),
        Some("json") => base().merge(Json::file(path)),
        Some("yaml") | Some("yml") => base().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };
    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.session.port == 0 {
        return Err(ConfigError::Validation("Session port must be greater than 0".into()).into());
    }

    if config.api.enabled
        && config.api.port == config.session.port
        && config.api.host == config.session.bind_address
    {
        return Err(ConfigError::Validation(
            "Control API and capture session ports must be different".into(),
        )
        .into());
    }

    if config.events.subscriber_buffer == 0 {
        return Err(ConfigError::Validation(
            "Subscriber buffer must be greater than 0".into(),
        )
        .into());
    }

    let url = &config.adapter.bridge_url;
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(ConfigError::Validation(format!(
            "Bridge URL '{}' must be a ws:// or wss:// URL",
            url
        ))
        .into());
    }

    config.throttle.validate()?;

    for rule in &config.rules {
        rule.pattern.compile()?;
        if let crate::rules::RuleAction::Throttle(profile) = &rule.action {
            profile.validate()?;
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.adapter.bridge_url = substitute_env_vars(&config.adapter.bridge_url)?;

    if let Some(api_key) = &mut config.api.api_key {
        *api_key = substitute_env_vars(api_key)?;
    }

    config.session.bypass_list = config
        .session
        .bypass_list
        .iter()
        .map(|host| substitute_env_vars(host))
        .collect::<Result<_>>()?;

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let value = match var_name.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(var_name).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{}' not found", var_name))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use std::io::Write;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("FLOWCTL_TEST_VAR", "test_value");

        let result = substitute_env_vars("Hello ${FLOWCTL_TEST_VAR}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${FLOWCTL_MISSING_VAR:-default}").unwrap();
        assert_eq!(result, "default");

        let err = substitute_env_vars("${FLOWCTL_MISSING_VAR}").unwrap_err();
        assert!(matches!(err, ControlError::Config(ConfigError::EnvVar(_))));

        std::env::remove_var("FLOWCTL_TEST_VAR");
    }

    #[test]
    fn test_load_yaml_file() {
        let file = write_config(
            ".yaml",
            r#"
session:
  port: 9191
events:
  subscriberBuffer: 16
adapter:
  bridgeUrl: "ws://127.0.0.1:7000"
"#,
        );

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.session.port, 9191);
        assert_eq!(config.events.subscriber_buffer, 16);
        assert_eq!(config.events.retention, 500);
        assert_eq!(config.adapter.bridge_url, "ws://127.0.0.1:7000");
    }

    #[test]
    fn test_load_toml_file() {
        let file = write_config(
            ".toml",
            r#"
[session]
bindAddress = "0.0.0.0"

[breakpoints]
defaultTimeoutMs = 1500
"#,
        );

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.session.bind_address, "0.0.0.0");
        assert_eq!(config.breakpoints.default_timeout_ms, 1500);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let file = write_config(
            ".yaml",
            r#"
adapter:
  bridgeUrl: "http://127.0.0.1:7000"
"#,
        );
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ControlError::Config(ConfigError::Validation(_))));

        let file = write_config(
            ".yaml",
            r#"
throttle:
  packetLossPercent: 140
"#,
        );
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ControlError::Config(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "port=1");
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ControlError::Config(ConfigError::Parse(_))));
    }
}
