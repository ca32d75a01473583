//! Core domain types.
//!
//! These are the CANONICAL definitions - use them everywhere. Database rows
//! map into these structs at the storage layer; JSON payloads on the message
//! fabric serialize them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Job lifecycle
// ============================================================================

/// Job lifecycle status. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Planning,
    Validating,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Planning,
        JobStatus::Validating,
        JobStatus::AwaitingApproval,
        JobStatus::Executing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const TERMINAL: &'static [JobStatus] =
        &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::Validating => "validating",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that require a non-null worker id on the job row.
    pub fn holds_worker(&self) -> bool {
        matches!(
            self,
            JobStatus::Planning | JobStatus::Validating | JobStatus::Executing
        )
    }

    /// The valid outgoing edges of the state machine.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[JobStatus::Planning, JobStatus::Cancelled],
            JobStatus::Planning => &[
                JobStatus::Validating,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::Validating => &[
                JobStatus::Executing,
                JobStatus::AwaitingApproval,
                JobStatus::Planning,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::AwaitingApproval => &[JobStatus::Executing, JobStatus::Cancelled],
            JobStatus::Executing => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Planning,
                JobStatus::Cancelled,
            ],
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition(&self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "planning" => Ok(JobStatus::Planning),
            "validating" => Ok(JobStatus::Validating),
            "awaiting_approval" => Ok(JobStatus::AwaitingApproval),
            "executing" => Ok(JobStatus::Executing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("invalid job status: '{s}'")),
        }
    }
}

/// Claim priority. Stored as an integer so the claim query can ORDER BY it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            3 => Priority::Critical,
            2 => Priority::High,
            0 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobSource {
    #[default]
    User,
    Schedule,
    Webhook,
    SubJob,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::User => "user",
            JobSource::Schedule => "schedule",
            JobSource::Webhook => "webhook",
            JobSource::SubJob => "sub-job",
        }
    }
}

impl FromStr for JobSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(JobSource::User),
            "schedule" => Ok(JobSource::Schedule),
            "webhook" => Ok(JobSource::Webhook),
            "sub-job" => Ok(JobSource::SubJob),
            _ => Err(format!("invalid job source: '{s}'")),
        }
    }
}

/// A job instance as stored in the primary partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub source: JobSource,
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
    pub content: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub timeout_ms: i64,
    pub revision_count: i64,
    pub replan_count: i64,
    pub worker_id: Option<String>,
    pub plan: Option<ExecutionPlan>,
    pub validation: Option<ValidationResult>,
    pub result: Option<JobResult>,
    pub error: Option<crate::error::ErrorInfo>,
    pub dedup_hash: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Options for creating a job. Required fields are non-optional; everything
/// else defaults.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub content: String,
    pub source: JobSource,
    pub priority: Priority,
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
    pub max_attempts: i64,
    pub timeout_ms: i64,
    pub metadata: HashMap<String, Value>,
}

impl CreateJob {
    pub fn user_message(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: JobSource::User,
            priority: Priority::Normal,
            conversation_id: None,
            parent_id: None,
            user_id: None,
            max_attempts: crate::defaults::DEFAULT_MAX_ATTEMPTS,
            timeout_ms: crate::defaults::DEFAULT_JOB_TIMEOUT_MS,
            metadata: HashMap::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// The final payload attached to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum JobResult {
    /// Planning answered directly; no plan was executed.
    Fast { text: String },
    /// A validated plan ran step by step.
    Full { steps: Vec<StepOutcome> },
}

/// Per-step execution outcome aggregated into a full-path result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ErrorInfo>,
    pub duration_ms: i64,
}

// ============================================================================
// Plans and validation
// ============================================================================

/// Declared risk of an action. Ordered: low < medium < high < critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn level(&self) -> i64 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    /// Signed distance in risk levels (positive when `self` exceeds `other`).
    pub fn delta(&self, other: RiskLevel) -> i64 {
        self.level() - other.level()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(format!("invalid risk level: '{s}'")),
        }
    }
}

/// A single planned action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub gear: String,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A flat ordered list of steps produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub job_id: String,
    pub steps: Vec<ExecutionStep>,
    /// Bypass the reflection pipeline for this plan.
    #[serde(default)]
    pub journal_skip: bool,
}

impl ExecutionPlan {
    pub fn new(job_id: impl Into<String>, steps: Vec<ExecutionStep>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            steps,
            journal_skip: false,
        }
    }
}

/// What the policy engine decided. Ordered by strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    NeedsUserApproval,
    NeedsRevision,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::NeedsUserApproval => "needs_user_approval",
            Verdict::NeedsRevision => "needs_revision",
            Verdict::Rejected => "rejected",
        }
    }

    /// Strictness rank used when tightening defaults and aggregating.
    /// `needs_revision` sits outside the tightening ladder (it is only
    /// produced for structurally defective plans), so it ranks above
    /// `needs_user_approval` but below `rejected`.
    pub fn strictness(&self) -> u8 {
        match self {
            Verdict::Approved => 0,
            Verdict::NeedsUserApproval => 1,
            Verdict::NeedsRevision => 2,
            Verdict::Rejected => 3,
        }
    }

    pub fn stricter_of(self, other: Verdict) -> Verdict {
        if other.strictness() > self.strictness() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The class of action a step performs, as determined by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ReadFiles,
    WriteFiles,
    DeleteFiles,
    NetworkGet,
    NetworkMutate,
    ShellExecute,
    CredentialUsage,
    FinancialTransaction,
    SendMessage,
    SystemConfig,
    Unknown,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ReadFiles => "read_files",
            ActionType::WriteFiles => "write_files",
            ActionType::DeleteFiles => "delete_files",
            ActionType::NetworkGet => "network_get",
            ActionType::NetworkMutate => "network_mutate",
            ActionType::ShellExecute => "shell_execute",
            ActionType::CredentialUsage => "credential_usage",
            ActionType::FinancialTransaction => "financial_transaction",
            ActionType::SendMessage => "send_message",
            ActionType::SystemConfig => "system_config",
            ActionType::Unknown => "unknown",
        }
    }

    /// Action types whose default verdicts user policy can never weaken.
    pub fn is_hard_floored(&self) -> bool {
        matches!(
            self,
            ActionType::DeleteFiles
                | ActionType::ShellExecute
                | ActionType::FinancialTransaction
                | ActionType::SystemConfig
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_files" => Ok(ActionType::ReadFiles),
            "write_files" => Ok(ActionType::WriteFiles),
            "delete_files" => Ok(ActionType::DeleteFiles),
            "network_get" => Ok(ActionType::NetworkGet),
            "network_mutate" => Ok(ActionType::NetworkMutate),
            "shell_execute" => Ok(ActionType::ShellExecute),
            "credential_usage" => Ok(ActionType::CredentialUsage),
            "financial_transaction" => Ok(ActionType::FinancialTransaction),
            "send_message" => Ok(ActionType::SendMessage),
            "system_config" => Ok(ActionType::SystemConfig),
            "unknown" => Ok(ActionType::Unknown),
            _ => Err(format!("invalid action type: '{s}'")),
        }
    }
}

/// Per-step validation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepVerdict {
    pub step_id: String,
    pub verdict: Verdict,
    pub action_type: ActionType,
    pub assessed_risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A step whose declared risk understates the engine's own assessment by two
/// or more levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub step_id: String,
    pub declared: RiskLevel,
    pub assessed: RiskLevel,
    pub delta: i64,
}

/// The aggregate result of validating one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: String,
    pub plan_id: String,
    pub verdict: Verdict,
    pub step_verdicts: Vec<StepVerdict>,
    pub overall_risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_revisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub divergences: Vec<Divergence>,
}

// ============================================================================
// Audit
// ============================================================================

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    User,
    Axis,
    Scout,
    Sentinel,
    Gear,
    System,
}

impl AuditActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActor::User => "user",
            AuditActor::Axis => "axis",
            AuditActor::Scout => "scout",
            AuditActor::Sentinel => "sentinel",
            AuditActor::Gear => "gear",
            AuditActor::System => "system",
        }
    }
}

impl FromStr for AuditActor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(AuditActor::User),
            "axis" => Ok(AuditActor::Axis),
            "scout" => Ok(AuditActor::Scout),
            "sentinel" => Ok(AuditActor::Sentinel),
            "gear" => Ok(AuditActor::Gear),
            "system" => Ok(AuditActor::System),
            _ => Err(format!("invalid audit actor: '{s}'")),
        }
    }
}

/// Fixed-precision RFC 3339 serialization so the canonical form of an entry
/// survives a parse/serialize roundtrip byte-identically.
pub mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// One immutable row in a monthly audit partition.
///
/// Serialized with camelCase keys; the canonical form (sorted keys, `None`
/// fields omitted, `entryHash` excluded) is what gets hashed into the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    #[serde(with = "rfc3339_micros")]
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub action: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

// ============================================================================
// Sentinel memory
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionVerdict {
    Allow,
    Deny,
}

impl DecisionVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionVerdict::Allow => "allow",
            DecisionVerdict::Deny => "deny",
        }
    }
}

impl FromStr for DecisionVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(DecisionVerdict::Allow),
            "deny" => Ok(DecisionVerdict::Deny),
            _ => Err(format!("invalid decision verdict: '{s}'")),
        }
    }
}

/// A memoised allow/deny decision in sentinel memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action_type: String,
    pub scope: String,
    pub verdict: DecisionVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

// ============================================================================
// Journal staging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(MemoryKind::Episodic),
            "semantic" => Ok(MemoryKind::Semantic),
            "procedural" => Ok(MemoryKind::Procedural),
            _ => Err(format!("invalid memory kind: '{s}'")),
        }
    }
}

/// A pending memory entry awaiting promotion by the reflection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMemory {
    pub id: String,
    pub kind: MemoryKind,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub staged_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            _ => Err(format!("invalid conversation status: '{s}'")),
        }
    }
}

/// A conversation is the serializer key: at most one non-terminal job per
/// conversation at any moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub status: ConversationStatus,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            _ => Err(format!("invalid chat role: '{s}'")),
        }
    }
}

/// One message in a conversation, as sent to the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// A gear action advertised to the planner as an available tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearCapability {
    pub gear: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
