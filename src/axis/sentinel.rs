//! Sentinel — the rule-based plan validator.
//!
//! Validation is a pure function of the plan and the configured policy.
//! The information barrier is structural: [`Sentinel::validate`] takes an
//! [`ExecutionPlan`] and nothing else, and the router component wrapper
//! extracts only the `plan` field from an incoming `validate.request` —
//! user text, conversation history, memories, and gear catalogs present on
//! the payload are never even parsed.
//!
//! Rules are applied per step; the most restrictive verdict wins, and the
//! overall verdict is the most restrictive across steps.

use std::net::IpAddr;
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::axis::router::{Envelope, HandlerError, MessageHandler};
use crate::config::SentinelConfig;
use crate::ids::new_id;
use crate::types::{
    ErrorKind, ExecutionPlan, PlanStep, RiskLevel, StepValidation, ValidationResult, Verdict,
};

/// Parameter keys treated as filesystem paths.
const PATH_KEYS: [&str; 10] = [
    "path", "file", "src", "source", "dest", "destination", "dir", "directory", "input", "output",
];

/// Parameter keys treated as URLs.
const URL_KEYS: [&str; 4] = ["url", "uri", "endpoint", "href"];

/// Coarse behavior class of a step, derived from gear and action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionClass {
    DestructiveFs,
    CredentialAccess,
    Payment,
    ShellExec,
    Other,
}

fn classify(step: &PlanStep) -> ActionClass {
    let gear = step.gear.to_lowercase();
    let action = step.action.to_lowercase();

    if gear == "shell" || matches!(action.as_str(), "exec" | "execute" | "spawn") {
        return ActionClass::ShellExec;
    }
    if matches!(
        action.as_str(),
        "delete" | "remove" | "rmdir" | "truncate" | "wipe" | "format"
    ) {
        return ActionClass::DestructiveFs;
    }
    if gear == "vault"
        || gear == "credentials"
        || action.contains("credential")
        || action.contains("secret")
    {
        return ActionClass::CredentialAccess;
    }
    if matches!(gear.as_str(), "payments" | "billing")
        || matches!(action.as_str(), "pay" | "charge" | "transfer" | "refund")
    {
        return ActionClass::Payment;
    }
    ActionClass::Other
}

/// The plan validator.
pub struct Sentinel {
    config: SentinelConfig,
    workspace_root: std::path::PathBuf,
}

impl Sentinel {
    /// Build a validator over a policy config and the workspace root all
    /// filesystem parameters must stay within.
    pub fn with_workspace(config: SentinelConfig, workspace_root: std::path::PathBuf) -> Self {
        Self {
            config,
            workspace_root,
        }
    }

    /// Validate a plan. Pure: same plan and config, same result.
    pub fn validate(&self, plan: &ExecutionPlan) -> ValidationResult {
        let mut step_results = Vec::with_capacity(plan.steps.len());
        let mut overall = Verdict::Approved;
        let mut overall_risk = RiskLevel::Low;

        for step in &plan.steps {
            let result = self.validate_step(step);
            overall = overall.most_restrictive(result.verdict);
            overall_risk = overall_risk.max(result.risk_level);
            step_results.push(result);
        }

        ValidationResult {
            id: new_id(),
            plan_id: plan.id,
            verdict: overall,
            overall_risk,
            step_results,
        }
    }

    fn validate_step(&self, step: &PlanStep) -> StepValidation {
        let mut verdict = Verdict::Approved;
        let mut risk = step.risk_level;
        let mut category = "baseline".to_owned();
        let mut reasoning = "no policy rule matched".to_owned();

        let mut apply = |v: Verdict, r: RiskLevel, cat: &str, why: String| {
            let escalated = verdict.most_restrictive(v);
            if escalated != verdict || verdict == Verdict::Approved {
                category = cat.to_owned();
                reasoning = why;
            }
            verdict = escalated;
            risk = risk.max(r);
        };

        // Risk floor by action class.
        match classify(step) {
            ActionClass::ShellExec => {
                if extract_string(&step.parameters, "command").is_none_or(|c| c.is_empty()) {
                    apply(
                        Verdict::Rejected,
                        RiskLevel::Critical,
                        "action_class",
                        "unbounded shell execution: no command to review".to_owned(),
                    );
                } else {
                    apply(
                        Verdict::NeedsUserApproval,
                        RiskLevel::High,
                        "action_class",
                        "shell execution requires confirmation".to_owned(),
                    );
                }
            }
            ActionClass::Payment => {
                match extract_number(&step.parameters, "amount") {
                    None => apply(
                        Verdict::Rejected,
                        RiskLevel::Critical,
                        "action_class",
                        "unbounded payment: no numeric amount".to_owned(),
                    ),
                    Some(_) => apply(
                        Verdict::NeedsUserApproval,
                        RiskLevel::High,
                        "action_class",
                        "outbound payment requires confirmation".to_owned(),
                    ),
                }
            }
            ActionClass::DestructiveFs => apply(
                Verdict::NeedsUserApproval,
                RiskLevel::High,
                "action_class",
                "destructive filesystem action requires confirmation".to_owned(),
            ),
            ActionClass::CredentialAccess => apply(
                Verdict::NeedsUserApproval,
                RiskLevel::High,
                "action_class",
                "credential access requires confirmation".to_owned(),
            ),
            ActionClass::Other => {}
        }

        // Filesystem scope.
        for raw in collect_values(&step.parameters, &PATH_KEYS) {
            if !path_within_workspace(&self.workspace_root, &raw) {
                apply(
                    Verdict::Rejected,
                    RiskLevel::Critical,
                    "filesystem",
                    format!("path escapes the workspace: {raw}"),
                );
            }
        }

        // Network scope.
        for raw in collect_values(&step.parameters, &URL_KEYS) {
            if let Some(why) = self.url_violation(&raw) {
                apply(Verdict::Rejected, RiskLevel::Critical, "network", why);
            }
        }

        // Monetary cap.
        if let Some(amount) = extract_number(&step.parameters, "amount") {
            if amount > self.config.max_transaction_amount_usd {
                apply(
                    Verdict::Rejected,
                    RiskLevel::Critical,
                    "monetary",
                    format!(
                        "amount {amount} exceeds the {} USD cap",
                        self.config.max_transaction_amount_usd
                    ),
                );
            }
        }

        // Planner-attributed risk floor.
        if step.risk_level == RiskLevel::Critical {
            apply(
                Verdict::NeedsUserApproval,
                RiskLevel::Critical,
                "risk_level",
                "critical-risk step requires confirmation".to_owned(),
            );
        }

        debug!(step = %step.id, verdict = ?verdict, category = %category, "step validated");
        StepValidation {
            step_id: step.id.clone(),
            verdict,
            risk_level: risk,
            category,
            reasoning,
        }
    }

    fn url_violation(&self, raw: &str) -> Option<String> {
        let Ok(url) = Url::parse(raw) else {
            return Some(format!("unparseable url: {raw}"));
        };

        if !self
            .config
            .allowed_protocols
            .iter()
            .any(|p| p == url.scheme())
        {
            return Some(format!("protocol '{}' is not allowed", url.scheme()));
        }

        let Some(host) = url.host_str() else {
            return Some(format!("url has no host: {raw}"));
        };

        if is_private_host(host) {
            return Some(format!("private or loopback host: {host}"));
        }

        if !self.host_allowed(host) {
            return Some(format!("host '{host}' is not in the allowed domains"));
        }
        None
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.config.allowed_domains.iter().any(|pattern| {
            match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    host.len() > suffix.len() && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                }
                None => host == pattern,
            }
        })
    }
}

fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let Ok(ip) = bare.parse::<IpAddr>() else {
        return false;
    };
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fe80::/10 link-local, fc00::/7 unique-local.
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Is `raw` syntactically confined to the workspace root?
///
/// Absolute paths must start under the root; relative paths must never
/// traverse above their starting point.
fn path_within_workspace(root: &Path, raw: &str) -> bool {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.starts_with(root);
    }
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth = depth.saturating_sub(1);
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth = depth.saturating_add(1),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Collect string values under any of `keys`, recursively.
fn collect_values(value: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    let mut found = Vec::new();
    collect_values_into(value, keys, &mut found);
    found
}

fn collect_values_into(value: &serde_json::Value, keys: &[&str], found: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                if keys.contains(&key.as_str()) {
                    if let Some(s) = child.as_str() {
                        found.push(s.to_owned());
                    }
                }
                collect_values_into(child, keys, found);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_values_into(item, keys, found);
            }
        }
        _ => {}
    }
}

fn extract_string(parameters: &serde_json::Value, key: &str) -> Option<String> {
    parameters.get(key)?.as_str().map(str::to_owned)
}

fn extract_number(parameters: &serde_json::Value, key: &str) -> Option<f64> {
    let value = parameters.get(key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Router component exposing the validator as `validate.request`.
///
/// Extracts only the `plan` field from the payload; everything else on the
/// envelope is ignored by construction.
pub struct SentinelComponent {
    sentinel: Arc<Sentinel>,
}

impl SentinelComponent {
    /// Wrap a validator.
    pub fn new(sentinel: Arc<Sentinel>) -> Self {
        Self { sentinel }
    }
}

#[async_trait]
impl MessageHandler for SentinelComponent {
    async fn handle(&self, message: Envelope) -> Result<serde_json::Value, HandlerError> {
        let plan: ExecutionPlan = message
            .payload
            .get("plan")
            .cloned()
            .ok_or_else(|| HandlerError::new(ErrorKind::HandlerError, "missing plan"))
            .and_then(|raw| {
                serde_json::from_value(raw)
                    .map_err(|e| HandlerError::new(ErrorKind::HandlerError, format!("bad plan: {e}")))
            })?;

        let result = self.sentinel.validate(&plan);
        serde_json::to_value(result)
            .map_err(|e| HandlerError::internal(format!("serialize validation: {e}")))
    }
}
