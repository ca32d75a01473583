//! Stateless plan evaluation.
//!
//! Classification precedence: shell patterns override file patterns, which
//! override network patterns; parameter hints (`url`, `amount`, `method`)
//! override action-name heuristics within their class.

use meridian_protocol::{
    ActionType, Divergence, ExecutionPlan, ExecutionStep, PolicyConfig, RiskLevel, StepVerdict,
    ValidationResult, Verdict,
};
use serde_json::Value;
use std::path::{Component, Path};
use tracing::warn;
use uuid::Uuid;

/// Mutating HTTP methods; any of these on a URL makes the step a mutation.
const MUTATING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

/// Risk gap (in levels) at which a declared/assessed divergence is recorded.
const DIVERGENCE_THRESHOLD: i64 = 2;

/// Evaluate a plan against the configured policy. Deterministic in
/// `(plan, config)`.
pub fn evaluate(plan: &ExecutionPlan, config: &PolicyConfig) -> ValidationResult {
    if let Some(defects) = structural_defects(plan) {
        return ValidationResult {
            id: validation_id(plan),
            plan_id: plan.id.clone(),
            verdict: Verdict::NeedsRevision,
            step_verdicts: Vec::new(),
            overall_risk: RiskLevel::Low,
            reasoning: Some("plan is structurally defective".to_string()),
            suggested_revisions: defects,
            divergences: Vec::new(),
        };
    }

    let mut step_verdicts = Vec::with_capacity(plan.steps.len());
    let mut divergences = Vec::new();
    let mut classified = Vec::with_capacity(plan.steps.len());
    let mut overall_risk = RiskLevel::Low;

    for step in &plan.steps {
        let action_type = classify_step(step);
        let assessed_risk = assess_risk(action_type, step, config);
        let (verdict, reason) = apply_policies(action_type, step, config);

        let delta = assessed_risk.delta(step.risk_level);
        if delta >= DIVERGENCE_THRESHOLD {
            warn!(
                step_id = %step.id,
                declared = %step.risk_level,
                assessed = %assessed_risk,
                "declared risk diverges from sentinel assessment"
            );
            divergences.push(Divergence {
                step_id: step.id.clone(),
                declared: step.risk_level,
                assessed: assessed_risk,
                delta,
            });
        }

        overall_risk = overall_risk.max(assessed_risk);
        classified.push(action_type);
        step_verdicts.push(StepVerdict {
            step_id: step.id.clone(),
            verdict,
            action_type,
            assessed_risk,
            reason,
        });
    }

    let composite = composite_risks(&classified);
    let verdict = step_verdicts
        .iter()
        .map(|sv| sv.verdict)
        .fold(Verdict::Approved, Verdict::stricter_of);

    let reasoning = if composite.is_empty() {
        None
    } else {
        Some(format!("composite risk detected: {}", composite.join("; ")))
    };

    ValidationResult {
        id: validation_id(plan),
        plan_id: plan.id.clone(),
        verdict,
        step_verdicts,
        overall_risk,
        reasoning,
        suggested_revisions: Vec::new(),
        divergences,
    }
}

/// Deterministic result id so equal inputs produce byte-equal outputs.
fn validation_id(plan: &ExecutionPlan) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, plan.id.as_bytes()).to_string()
}

/// Structural checks that make a plan unreviewable rather than risky.
fn structural_defects(plan: &ExecutionPlan) -> Option<Vec<String>> {
    let mut defects = Vec::new();
    if plan.steps.is_empty() {
        defects.push("plan has no steps".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for step in &plan.steps {
        if step.gear.trim().is_empty() {
            defects.push(format!("step {} has a blank gear", step.id));
        }
        if step.action.trim().is_empty() {
            defects.push(format!("step {} has a blank action", step.id));
        }
        if !seen.insert(step.id.as_str()) {
            defects.push(format!("duplicate step id {}", step.id));
        }
    }
    if defects.is_empty() {
        None
    } else {
        Some(defects)
    }
}

fn param_str<'a>(step: &'a ExecutionStep, key: &str) -> Option<&'a str> {
    step.parameters.get(key).and_then(Value::as_str)
}

fn param_amount(step: &ExecutionStep) -> Option<f64> {
    match step.parameters.get("amount") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify one step into an action type.
pub fn classify_step(step: &ExecutionStep) -> ActionType {
    let gear = step.gear.to_lowercase();
    let action = step.action.to_lowercase();

    // Shell patterns take precedence over everything.
    if gear == "shell"
        || contains_any(&action, &["shell", "exec", "spawn", "terminal"])
        || step.parameters.contains_key("command")
        || step.parameters.contains_key("cmd")
    {
        return ActionType::ShellExecute;
    }

    if contains_any(&gear, &["vault", "secret", "credential"])
        || contains_any(&action, &["secret", "credential", "token", "password", "api_key"])
    {
        return ActionType::CredentialUsage;
    }

    // An amount parameter marks a financial transaction regardless of naming.
    if param_amount(step).is_some()
        || step.parameters.contains_key("currency")
        || contains_any(&action, &["charge", "refund", "payment", "transfer", "purchase"])
    {
        return ActionType::FinancialTransaction;
    }

    // File patterns override network patterns.
    let has_path = step.parameters.contains_key("path")
        || step.parameters.contains_key("file")
        || step.parameters.contains_key("directory");
    if has_path || contains_any(&gear, &["file", "fs"]) {
        if contains_any(&action, &["delete", "remove", "unlink", "rmdir", "rm"]) {
            return ActionType::DeleteFiles;
        }
        if contains_any(&action, &["write", "create", "save", "append", "move", "copy", "rename"]) {
            return ActionType::WriteFiles;
        }
        if contains_any(&action, &["read", "list", "open", "stat", "search", "cat"]) {
            return ActionType::ReadFiles;
        }
    }

    // Network: the method hint overrides the action verb.
    let has_url = param_str(step, "url").is_some();
    if has_url {
        let method = param_str(step, "method").unwrap_or("GET").to_uppercase();
        if MUTATING_METHODS.contains(&method.as_str()) {
            return ActionType::NetworkMutate;
        }
        return ActionType::NetworkGet;
    }
    if contains_any(&action, &["post", "put", "patch", "upload", "submit"]) {
        return ActionType::NetworkMutate;
    }
    if contains_any(&action, &["fetch", "download", "get", "request", "http"]) {
        return ActionType::NetworkGet;
    }

    if contains_any(&action, &["send", "email", "notify", "message", "publish"]) {
        return ActionType::SendMessage;
    }

    if contains_any(&action, &["config", "setting", "install", "uninstall", "upgrade"]) {
        return ActionType::SystemConfig;
    }

    ActionType::Unknown
}

/// Sentinel's own risk floor, independent of what the plan declared.
pub fn assess_risk(action_type: ActionType, step: &ExecutionStep, config: &PolicyConfig) -> RiskLevel {
    match action_type {
        ActionType::ShellExecute
        | ActionType::FinancialTransaction
        | ActionType::SystemConfig => RiskLevel::Critical,
        ActionType::DeleteFiles
        | ActionType::NetworkMutate
        | ActionType::SendMessage
        | ActionType::CredentialUsage => RiskLevel::High,
        ActionType::ReadFiles => {
            if path_in_workspace(step, config) {
                RiskLevel::Low
            } else {
                RiskLevel::Medium
            }
        }
        ActionType::WriteFiles => RiskLevel::Medium,
        ActionType::NetworkGet => RiskLevel::Low,
        ActionType::Unknown => RiskLevel::Medium,
    }
}

/// True when the step's path parameter is an absolute prefix of the
/// configured workspace root with no parent-directory segments.
fn path_in_workspace(step: &ExecutionStep, config: &PolicyConfig) -> bool {
    let raw = match param_str(step, "path").or_else(|| param_str(step, "file")) {
        Some(raw) => raw,
        None => return false,
    };
    let path = Path::new(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    path.is_absolute() && path.starts_with(&config.workspace_root)
}

/// Lowercased host of the step's `url` parameter, if any.
fn url_host(step: &ExecutionStep) -> Option<String> {
    let raw = param_str(step, "url")?;
    let (_, rest) = raw.split_once("://")?;
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .next_back()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// True when the URL is https and its host matches (or is a dotted-suffix
/// subdomain of) an allowlisted domain.
fn url_allowlisted(step: &ExecutionStep, config: &PolicyConfig) -> bool {
    let https = param_str(step, "url")
        .and_then(|raw| raw.split_once("://"))
        .map(|(scheme, _)| scheme.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if !https {
        return false;
    }
    let host = match url_host(step) {
        Some(host) => host,
        None => return false,
    };
    config.allowlisted_domains.iter().any(|domain| {
        let domain = domain.to_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// The scope key a memoised decision applies to: the URL host for network
/// steps, the target path for file steps, the gear otherwise.
pub fn decision_scope(action_type: ActionType, step: &ExecutionStep) -> String {
    match action_type {
        ActionType::NetworkGet | ActionType::NetworkMutate => {
            url_host(step).unwrap_or_else(|| step.gear.clone())
        }
        ActionType::ReadFiles | ActionType::WriteFiles | ActionType::DeleteFiles => param_str(
            step, "path",
        )
        .or_else(|| param_str(step, "file"))
        .map(str::to_string)
        .unwrap_or_else(|| step.gear.clone()),
        _ => step.gear.clone(),
    }
}

/// Default verdict for a classified step, before user policy.
fn default_verdict(
    action_type: ActionType,
    step: &ExecutionStep,
    config: &PolicyConfig,
) -> (Verdict, Option<String>) {
    match action_type {
        ActionType::ReadFiles | ActionType::WriteFiles => {
            if path_in_workspace(step, config) {
                (Verdict::Approved, None)
            } else {
                (
                    Verdict::NeedsUserApproval,
                    Some("path is outside the workspace root".to_string()),
                )
            }
        }
        ActionType::DeleteFiles => (
            Verdict::NeedsUserApproval,
            Some("file deletion always requires approval".to_string()),
        ),
        ActionType::NetworkGet => {
            if url_allowlisted(step, config) {
                (Verdict::Approved, None)
            } else {
                (
                    Verdict::NeedsUserApproval,
                    Some("host is not allowlisted".to_string()),
                )
            }
        }
        ActionType::NetworkMutate => (
            Verdict::NeedsUserApproval,
            Some("mutating network calls always require approval".to_string()),
        ),
        ActionType::ShellExecute
        | ActionType::CredentialUsage
        | ActionType::SendMessage
        | ActionType::SystemConfig => (
            Verdict::NeedsUserApproval,
            Some(format!("{action_type} always requires approval")),
        ),
        ActionType::FinancialTransaction => {
            let amount = param_amount(step).unwrap_or(0.0);
            if amount > config.max_transaction_amount_usd {
                (
                    Verdict::Rejected,
                    Some(format!(
                        "amount {amount} exceeds the {} USD limit",
                        config.max_transaction_amount_usd
                    )),
                )
            } else {
                (
                    Verdict::NeedsUserApproval,
                    Some("financial transactions always require approval".to_string()),
                )
            }
        }
        ActionType::Unknown => (
            Verdict::NeedsUserApproval,
            Some("unrecognized action".to_string()),
        ),
    }
}

/// Apply the default, then any user override - overrides only ever tighten.
fn apply_policies(
    action_type: ActionType,
    step: &ExecutionStep,
    config: &PolicyConfig,
) -> (Verdict, Option<String>) {
    let (default, reason) = default_verdict(action_type, step, config);
    match config.policies.get(&action_type) {
        Some(user) if user.strictness() > default.strictness() => (
            *user,
            Some(format!("user policy tightens {action_type} to {user}")),
        ),
        _ => (default, reason),
    }
}

/// Scan the classified step sequence for dangerous combinations.
fn composite_risks(classified: &[ActionType]) -> Vec<String> {
    let mut findings = Vec::new();

    let after = |from: ActionType, to: &[ActionType]| {
        classified.iter().enumerate().any(|(i, a)| {
            *a == from && classified[i + 1..].iter().any(|b| to.contains(b))
        })
    };

    if after(
        ActionType::CredentialUsage,
        &[ActionType::NetworkGet, ActionType::NetworkMutate],
    ) {
        findings.push("credential exfiltration (credential usage followed by network)".to_string());
    }
    if after(ActionType::ReadFiles, &[ActionType::SendMessage]) {
        findings.push("data leak (file read followed by send)".to_string());
    }
    if after(ActionType::ReadFiles, &[ActionType::NetworkMutate]) {
        findings.push("file exfiltration (file read followed by network mutation)".to_string());
    }
    let deletes = classified
        .iter()
        .filter(|a| **a == ActionType::DeleteFiles)
        .count();
    if deletes >= 3 {
        findings.push(format!("mass destruction ({deletes} delete steps)"));
    }

    findings
}
