//! Interception rules and their evaluation.
//!
//! Rules run in ascending priority (ties keep registration order). `Block` and
//! `Bypass` short-circuit; `Throttle` matches accumulate into one profile. The
//! first matching `MapRemote` or `MapLocal` rule supplies the stage's rewrite.

use crate::error::{ControlError, Result};
use crate::flow::{Flow, Headers, Stage};
use crate::throttle::ThrottleProfile;
use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub mod pattern;

pub use pattern::{CompiledPattern, RulePattern};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Bypass,
    BreakpointRequest,
    BreakpointResponse,
    Block,
    Throttle(ThrottleProfile),
    /// Sends the request to another URL.
    MapRemote {
        #[serde(rename = "targetUrl")]
        target_url: String,
    },
    /// Answers with a local file instead of the upstream response.
    MapLocal(LocalResponse),
}

impl RuleAction {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, RuleAction::Bypass | RuleAction::Block)
    }

    fn validate(&self) -> Result<()> {
        match self {
            RuleAction::Throttle(profile) => profile.validate(),
            RuleAction::MapRemote { target_url } => url::Url::parse(target_url)
                .map(|_| ())
                .map_err(|e| {
                    ControlError::InvalidRule(format!("invalid targetUrl '{}': {}", target_url, e))
                }),
            RuleAction::MapLocal(local) if local.file_path.as_os_str().is_empty() => Err(
                ControlError::InvalidRule("mapLocal rule needs a filePath".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Replacement response served from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalResponse {
    pub file_path: PathBuf,
    /// Defaults to 200
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Defaults to `Content-Type: application/octet-stream`
    #[serde(default)]
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default = "generate_rule_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pattern: RulePattern,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    /// Restricts `Block`, `Bypass` and `Throttle` to one stage. Breakpoint and
    /// map actions carry their own stage and ignore this.
    #[serde(default)]
    pub phase: Option<Stage>,
}

fn generate_rule_id() -> String {
    format!("rule_{}", uuid::Uuid::new_v4())
}

fn default_true() -> bool {
    true
}

impl Rule {
    pub fn new(pattern: RulePattern, action: RuleAction, priority: i32) -> Self {
        Self {
            id: generate_rule_id(),
            name: None,
            enabled: true,
            pattern,
            action,
            priority,
            phase: None,
        }
    }

    pub fn with_phase(mut self, phase: Stage) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn applies_at(&self, stage: Stage) -> bool {
        match self.action {
            RuleAction::BreakpointRequest | RuleAction::MapRemote { .. } => stage == Stage::Request,
            RuleAction::BreakpointResponse | RuleAction::MapLocal(_) => stage == Stage::Response,
            _ => self.phase.map_or(true, |p| p == stage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionAction {
    /// No rule matched: forward unmodified.
    Forward,
    Bypass,
    Breakpoint(Stage),
    Block,
}

/// Rewrite taken from a map rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mapping {
    Remote { target_url: String },
    Local(LocalResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: DecisionAction,
    pub throttle: Option<ThrottleProfile>,
    pub mapping: Option<Mapping>,
    /// Ids of the rules that matched, in evaluation order
    pub matched: Vec<String>,
}

impl Decision {
    pub fn forward() -> Self {
        Self {
            action: DecisionAction::Forward,
            throttle: None,
            mapping: None,
            matched: Vec::new(),
        }
    }

    fn bypass(matched: Vec<String>) -> Self {
        Self {
            action: DecisionAction::Bypass,
            throttle: None,
            mapping: None,
            matched,
        }
    }
}

struct RuleSet {
    rules: Vec<(Rule, CompiledPattern)>,
    bypass: Vec<Regex>,
}

/// Rule set held behind an atomic snapshot. An evaluation loads the snapshot
/// once, so a concurrent `set_rules` never produces a half-applied view.
pub struct RuleEngine {
    current: ArcSwap<RuleSet>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet {
                rules: Vec::new(),
                bypass: Vec::new(),
            }),
        }
    }

    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<()> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.action.validate()?;
            let pattern = rule.pattern.compile()?;
            compiled.push((rule, pattern));
        }
        // stable: equal priorities keep registration order
        compiled.sort_by_key(|(rule, _)| rule.priority);

        tracing::info!(rule_count = compiled.len(), "Rule set updated");
        let compiled = Arc::new(compiled);
        self.current.rcu(|old| RuleSet {
            rules: compiled.as_ref().clone(),
            bypass: old.bypass.clone(),
        });
        Ok(())
    }

    /// Hosts that skip interception entirely for the running session.
    pub fn set_bypass_list<'a>(&self, hosts: impl IntoIterator<Item = &'a String>) -> Result<()> {
        let bypass = hosts
            .into_iter()
            .map(|h| pattern::glob(h, true))
            .collect::<Result<Vec<_>>>()?;
        let bypass = Arc::new(bypass);
        self.current.rcu(|old| RuleSet {
            rules: old.rules.clone(),
            bypass: bypass.as_ref().clone(),
        });
        Ok(())
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.current
            .load()
            .rules
            .iter()
            .map(|(rule, _)| rule.clone())
            .collect()
    }

    pub fn evaluate(&self, flow: &Flow, stage: Stage) -> Decision {
        let set = self.current.load();

        if let Some(host) = flow.request.host() {
            if set.bypass.iter().any(|re| re.is_match(&host)) {
                tracing::debug!(flow_id = %flow.id, host = %host, "Host is on the bypass list");
                return Decision::bypass(Vec::new());
            }
        }

        let mut throttle: Option<ThrottleProfile> = None;
        let mut breakpoint = None;
        let mut mapping = None;
        let mut matched = Vec::new();

        for (rule, pattern) in set.rules.iter() {
            if !rule.enabled || !rule.applies_at(stage) || !pattern.matches(&flow.request) {
                continue;
            }
            matched.push(rule.id.clone());
            match &rule.action {
                RuleAction::Block => {
                    return Decision {
                        action: DecisionAction::Block,
                        throttle,
                        mapping: None,
                        matched,
                    };
                }
                RuleAction::Bypass => return Decision::bypass(matched),
                RuleAction::BreakpointRequest | RuleAction::BreakpointResponse => {
                    breakpoint.get_or_insert(stage);
                }
                RuleAction::Throttle(profile) => {
                    throttle = Some(match throttle {
                        Some(acc) => acc.merge(profile),
                        None => profile.clone(),
                    });
                }
                RuleAction::MapRemote { target_url } => {
                    mapping.get_or_insert_with(|| Mapping::Remote {
                        target_url: target_url.clone(),
                    });
                }
                RuleAction::MapLocal(local) => {
                    mapping.get_or_insert_with(|| Mapping::Local(local.clone()));
                }
            }
        }

        let action = breakpoint.map_or(DecisionAction::Forward, DecisionAction::Breakpoint);
        tracing::debug!(
            flow_id = %flow.id,
            ?stage,
            ?action,
            matched = matched.len(),
            "Rules evaluated"
        );
        Decision {
            action,
            throttle,
            mapping,
            matched,
        }
    }
}
