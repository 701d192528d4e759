use crate::error::{ControlError, Result};
use crate::flow::FlowRequest;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Host/path/method/URL matcher. Absent fields match anything.
///
/// `host`, `path` and `url` are globs: `*` matches any run of characters,
/// `?` a single character.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulePattern {
    pub host: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
}

impl RulePattern {
    pub fn host(host: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    pub fn url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    pub fn compile(&self) -> Result<CompiledPattern> {
        Ok(CompiledPattern {
            host: self.host.as_deref().map(|g| glob(g, true)).transpose()?,
            path: self.path.as_deref().map(|g| glob(g, false)).transpose()?,
            method: self.method.as_ref().map(|m| m.to_ascii_uppercase()),
            url: self.url.as_deref().map(|g| glob(g, false)).transpose()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    host: Option<Regex>,
    path: Option<Regex>,
    method: Option<String>,
    url: Option<Regex>,
}

impl CompiledPattern {
    pub fn matches(&self, request: &FlowRequest) -> bool {
        if let Some(method) = &self.method {
            if !request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(host) = &self.host {
            match request.host() {
                Some(h) if host.is_match(&h) => {}
                _ => return false,
            }
        }
        if let Some(path) = &self.path {
            if !path.is_match(&request.path()) {
                return false;
            }
        }
        if let Some(url) = &self.url {
            if !url.is_match(&request.url) {
                return false;
            }
        }
        true
    }
}

/// Anchored regex equivalent of a glob.
pub fn glob(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(&c.to_string())),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ControlError::InvalidRule(format!("bad pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_wildcards() {
        let re = glob("*.example.com", true).unwrap();
        assert!(re.is_match("api.example.com"));
        assert!(re.is_match("API.Example.COM"));
        assert!(!re.is_match("example.com"));
        assert!(!re.is_match("example.com.evil.net"));

        let re = glob("/v?/users", false).unwrap();
        assert!(re.is_match("/v1/users"));
        assert!(!re.is_match("/v10/users"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let re = glob("a.b+c", false).unwrap();
        assert!(re.is_match("a.b+c"));
        assert!(!re.is_match("axbbc"));
    }

    #[test]
    fn test_pattern_combines_fields() {
        let pattern = RulePattern {
            host: Some("example.com".to_string()),
            path: Some("/api/*".to_string()),
            method: Some("post".to_string()),
            url: None,
        }
        .compile()
        .unwrap();

        assert!(pattern.matches(&FlowRequest::new("POST", "https://example.com/api/users")));
        assert!(!pattern.matches(&FlowRequest::new("GET", "https://example.com/api/users")));
        assert!(!pattern.matches(&FlowRequest::new("POST", "https://example.com/health")));
        assert!(!pattern.matches(&FlowRequest::new("POST", "https://other.com/api/users")));
    }

    #[test]
    fn test_url_pattern_matches_full_url() {
        let pattern = RulePattern::url("*/api/*").compile().unwrap();
        assert!(pattern.matches(&FlowRequest::new("GET", "https://example.com/api/users?page=2")));
        assert!(!pattern.matches(&FlowRequest::new("GET", "https://example.com/static/app.js")));
    }
}
