//! Core data model: jobs, plans, validation verdicts, step outcomes, events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobSource {
    /// A direct user message.
    User,
    /// A scheduled trigger.
    Schedule,
    /// An authenticated webhook.
    Webhook,
    /// Spawned by another job.
    SubJob,
}

impl JobSource {
    /// Stable lowercase name, matching the persisted form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::SubJob => "sub-job",
        }
    }
}

impl std::str::FromStr for JobSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "schedule" => Ok(Self::Schedule),
            "webhook" => Ok(Self::Webhook),
            "sub-job" => Ok(Self::SubJob),
            other => Err(anyhow::anyhow!("unknown job source: {other}")),
        }
    }
}

/// Job lifecycle states.
///
/// Only the transitions enumerated in [`crate::axis::queue`] are legal;
/// the four terminal states are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker claim.
    Pending,
    /// A worker owns it; the planner is producing an execution plan.
    Planning,
    /// The plan is under policy validation.
    Validating,
    /// Parked until the user approves or rejects.
    AwaitingApproval,
    /// The plan is running.
    Executing,
    /// Execution settled; the outcome is being journaled.
    Reflecting,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: an unrecoverable error.
    Failed,
    /// Terminal: cancelled by the user or shutdown.
    Cancelled,
    /// Terminal: the validator or the user refused the plan.
    Rejected,
}

impl JobStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }

    /// Stable lowercase name, matching the persisted form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Reflecting => "reflecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "validating" => Ok(Self::Validating),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "reflecting" => Ok(Self::Reflecting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

/// Machine-readable error kinds surfaced on jobs, envelopes, and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The queue refused a state transition.
    IllegalTransition,
    /// An operation exceeded its budget.
    Timeout,
    /// The plan's dependency graph contains a cycle.
    CycleDetected,
    /// A step depends on an id that is not in the plan.
    UnknownDep,
    /// A step depends on itself.
    SelfDep,
    /// The presented nonce does not match the issued one.
    InvalidNonce,
    /// The nonce was already consumed.
    NonceConsumed,
    /// The nonce's TTL elapsed.
    NonceExpired,
    /// The gear's circuit breaker is open.
    CircuitOpen,
    /// A step condition evaluated false.
    ConditionFalse,
    /// The sandboxed runtime refused the step.
    SandboxDenied,
    /// Disk usage is above the pause threshold.
    DiskFull,
    /// Resident memory is above the pause threshold.
    RssHigh,
    /// Recovery gave up after too many attempts.
    ExceededAttempts,
    /// No component is registered under the envelope's recipient.
    NoHandler,
    /// A registered handler returned an error.
    HandlerError,
    /// A routed payload exceeded the hard size cap.
    MessageTooLarge,
}

impl ErrorKind {
    /// Wire code, e.g. `ILLEGAL_TRANSITION`.
    pub fn code(self) -> &'static str {
        match self {
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::Timeout => "TIMEOUT",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::UnknownDep => "UNKNOWN_DEP",
            Self::SelfDep => "SELF_DEP",
            Self::InvalidNonce => "INVALID_NONCE",
            Self::NonceConsumed => "NONCE_CONSUMED",
            Self::NonceExpired => "NONCE_EXPIRED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::ConditionFalse => "CONDITION_FALSE",
            Self::SandboxDenied => "SANDBOX_DENIED",
            Self::DiskFull => "DISK_FULL",
            Self::RssHigh => "RSS_HIGH",
            Self::ExceededAttempts => "EXCEEDED_ATTEMPTS",
            Self::NoHandler => "NO_HANDLER",
            Self::HandlerError => "HANDLER_ERROR",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A job-level error persisted on the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl JobError {
    /// Build an error from a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One unit of work: a user request being fulfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: Uuid,
    /// Conversation this job belongs to, if any.
    pub conversation_id: Option<Uuid>,
    /// Origin of the request.
    pub source: JobSource,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Plan proposed by the planner, once available.
    pub plan: Option<ExecutionPlan>,
    /// Validator verdict, once available.
    pub validation: Option<ValidationResult>,
    /// Final result payload.
    pub result: Option<serde_json::Value>,
    /// Error recorded on failure.
    pub error: Option<JobError>,
    /// Recovery attempts so far.
    pub attempts: u32,
    /// Times the validator sent the plan back for revision.
    pub revision_count: u32,
    /// Times execution fell back to replanning.
    pub replan_count: u32,
    /// Accumulated model spend.
    pub cost_usd: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When a worker first claimed it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form request metadata (original message text, channel, ...).
    pub metadata: serde_json::Value,
}

/// Risk attributed to a plan step, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only, reversible.
    Low,
    /// Writes inside the workspace.
    Medium,
    /// Outward-facing side effects.
    High,
    /// Destructive or financial side effects.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// Comparison operators usable in a step condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    /// Loose equality with numeric coercion.
    Eq,
    /// Negated loose equality.
    Neq,
    /// Strictly greater; non-numeric operands are false.
    Gt,
    /// Strictly less; non-numeric operands are false.
    Lt,
    /// Substring on strings, membership on arrays.
    Contains,
    /// The field resolves to a non-null value.
    Exists,
}

/// A guard evaluated against earlier step results before a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field path, `step:<id>.status` or `step:<id>.result.<dot.path>`.
    pub field: String,
    /// Operator.
    pub op: ConditionOp,
    /// Right-hand operand; ignored by `exists`.
    #[serde(default)]
    pub value: serde_json::Value,
}

/// One plugin action inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step id, unique within the plan.
    pub id: String,
    /// Plugin ("gear") id that owns the action.
    pub gear: String,
    /// Action name within the gear.
    pub action: String,
    /// Free-form parameters; strings may carry `$ref:step:<id>` placeholders.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Risk attributed by the planner.
    pub risk_level: RiskLevel,
    /// Ids of steps that must settle first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional guard; a false guard skips the step without failing it.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Human-readable description for the approval prompt.
    #[serde(default)]
    pub description: Option<String>,
}

impl PlanStep {
    /// `gear:action`, the form standing rules match against.
    pub fn qualified_action(&self) -> String {
        format!("{}:{}", self.gear, self.action)
    }
}

/// An ordered DAG of steps proposed by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan id.
    pub id: Uuid,
    /// Steps in planner order.
    pub steps: Vec<PlanStep>,
    /// Planner's reasoning, for the approval prompt.
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Validator verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Safe to run unattended.
    Approved,
    /// Send the plan back to the planner with feedback.
    Revise,
    /// Run only after explicit user confirmation.
    NeedsUserApproval,
    /// Refuse outright.
    Rejected,
}

impl Verdict {
    /// Restriction rank; higher wins during aggregation.
    fn rank(self) -> u8 {
        match self {
            Self::Approved => 0,
            Self::Revise => 1,
            Self::NeedsUserApproval => 2,
            Self::Rejected => 3,
        }
    }

    /// The more restrictive of two verdicts.
    pub fn most_restrictive(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Validator verdict for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepValidation {
    /// Step this verdict applies to.
    pub step_id: String,
    /// Verdict for the step.
    pub verdict: Verdict,
    /// Risk after rule application.
    pub risk_level: RiskLevel,
    /// Rule category that decided the verdict.
    pub category: String,
    /// Why the rule fired.
    pub reasoning: String,
}

/// Outcome of validating a whole plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Validation id.
    pub id: Uuid,
    /// Plan this verdict applies to.
    pub plan_id: Uuid,
    /// Most restrictive verdict across steps.
    pub verdict: Verdict,
    /// Highest risk across steps.
    pub overall_risk: RiskLevel,
    /// Per-step verdicts, in plan order.
    pub step_results: Vec<StepValidation>,
}

/// Why a step was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// A transitive dependency failed.
    DependencyFailed,
    /// The gear's circuit breaker was open.
    CircuitOpen,
    /// The step's condition evaluated false.
    ConditionFalse,
    /// The run was cancelled before the step was entered.
    Cancelled,
}

/// Settled result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step ran and produced a value.
    Completed {
        /// Value returned by the gear.
        value: serde_json::Value,
        /// Wall-clock duration.
        duration_ms: u64,
    },
    /// The step ran and failed.
    Failed {
        /// Error message from the gear or runtime.
        error: String,
        /// Wall-clock duration.
        duration_ms: u64,
    },
    /// The step never ran.
    Skipped {
        /// Why it was skipped.
        reason: SkipReason,
    },
}

impl StepOutcome {
    /// Lowercase status tag used by condition fields.
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// The completed value, if any.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// A step id paired with its settled outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id from the plan.
    pub step_id: String,
    /// Settled outcome.
    pub outcome: StepOutcome,
}

/// Aggregate status of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step completed (or was condition-skipped with no failures).
    Completed,
    /// Some steps completed, some failed.
    Partial,
    /// Nothing completed.
    Failed,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Aggregate status.
    pub status: RunStatus,
    /// Per-step results, in plan order.
    pub step_results: Vec<StepResult>,
    /// Wall-clock duration of the whole run.
    pub duration_ms: u64,
}

/// Outbound broadcast events consumed by external subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A job changed state.
    #[serde(rename = "status.update")]
    StatusUpdate {
        /// Job id.
        job_id: Uuid,
        /// New status.
        status: JobStatus,
    },
    /// A plan needs explicit user confirmation.
    #[serde(rename = "approval_required")]
    ApprovalRequired {
        /// Job id.
        job_id: Uuid,
        /// The plan under review.
        plan: ExecutionPlan,
        /// Per-step risk summaries for the prompt.
        risks: Vec<StepValidation>,
        /// Single-use token the confirmation must echo.
        nonce: String,
    },
    /// Execution progress.
    #[serde(rename = "progress")]
    Progress {
        /// Job id.
        job_id: Uuid,
        /// Settled steps over total steps, 0-100.
        percent: u8,
        /// Step that just settled, if one did.
        step: Option<String>,
        /// Optional human-readable note.
        message: Option<String>,
    },
    /// A job finished with a result.
    #[serde(rename = "result")]
    Result {
        /// Job id.
        job_id: Uuid,
        /// Result payload.
        result: serde_json::Value,
    },
    /// A job failed.
    #[serde(rename = "error")]
    Error {
        /// Job id.
        job_id: Uuid,
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The approval suggester noticed a repeated approval pattern.
    #[serde(rename = "rule_suggestion")]
    RuleSuggestion {
        /// Action category (the prefix before `:`).
        category: String,
        /// How many approvals triggered the suggestion.
        count: u32,
    },
}
