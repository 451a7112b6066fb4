//! Standing rules — persistent auto-decisions for matching actions.
//!
//! A rule pairs an action pattern (`email:send` exact, or `email:*` glob)
//! with an `approve` or `deny` verdict. When every step of a plan is
//! covered by an approve rule and none is touched by a deny rule, the
//! approval coordinator short-circuits the user prompt entirely. Rules
//! live in the policy database and may carry an expiry.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::ids::new_id;
use crate::types::ExecutionPlan;

/// Standing rule failures.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Database error.
    #[error("standing rule database error: {0}")]
    Database(String),
    /// A persisted row failed to decode.
    #[error("corrupt rule row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for RuleError {
    fn from(e: sqlx::Error) -> Self {
        RuleError::Database(e.to_string())
    }
}

/// Auto-decision carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleVerdict {
    /// Matching steps are pre-approved.
    Approve,
    /// Matching steps always require the user.
    Deny,
}

impl RuleVerdict {
    /// Persisted form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
        }
    }
}

impl std::str::FromStr for RuleVerdict {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "deny" => Ok(Self::Deny),
            other => Err(RuleError::Corrupt(format!("unknown rule verdict: {other}"))),
        }
    }
}

/// A persisted standing rule.
#[derive(Debug, Clone)]
pub struct StandingRule {
    /// Rule id.
    pub id: Uuid,
    /// Action pattern: exact `gear:action` or `prefix:*` glob.
    pub action_pattern: String,
    /// Scope label ("global", a conversation id, ...).
    pub scope: String,
    /// Auto-decision.
    pub verdict: RuleVerdict,
    /// Optional expiry; expired rules never match.
    pub expires_at: Option<DateTime<Utc>>,
    /// Times this rule auto-approved a step.
    pub approval_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Who created it ("user", "suggestion", ...).
    pub created_by: String,
}

/// Options for creating a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    /// Action pattern.
    pub action_pattern: String,
    /// Scope label.
    pub scope: String,
    /// Auto-decision.
    pub verdict: RuleVerdict,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creator label.
    pub created_by: String,
}

/// Does `pattern` cover `action`?
///
/// Exact match, or a glob whose trailing `*` matches any suffix.
pub fn pattern_matches(pattern: &str, action: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => action.starts_with(prefix),
        None => pattern == action,
    }
}

/// Store of standing rules.
pub struct StandingRules {
    pool: SqlitePool,
}

impl StandingRules {
    /// Build over the policy database.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new rule.
    pub async fn add(&self, rule: NewRule) -> Result<StandingRule, RuleError> {
        let id = new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO decisions (id, action_pattern, scope, verdict, expires_at,
                                    approval_count, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(&rule.action_pattern)
        .bind(&rule.scope)
        .bind(rule.verdict.as_str())
        .bind(rule.expires_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(&rule.created_by)
        .execute(&self.pool)
        .await?;

        info!(rule_id = %id, pattern = %rule.action_pattern, verdict = rule.verdict.as_str(), "standing rule added");
        Ok(StandingRule {
            id,
            action_pattern: rule.action_pattern,
            scope: rule.scope,
            verdict: rule.verdict,
            expires_at: rule.expires_at,
            approval_count: 0,
            created_at: now,
            created_by: rule.created_by,
        })
    }

    /// All rules, newest first.
    pub async fn list(&self) -> Result<Vec<StandingRule>, RuleError> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, action_pattern, scope, verdict, expires_at, approval_count,
                    created_at, created_by
             FROM decisions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_into_rule).collect()
    }

    /// Delete a rule. Returns whether it existed.
    pub async fn remove(&self, id: Uuid) -> Result<bool, RuleError> {
        let affected = sqlx::query("DELETE FROM decisions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// The unexpired rule deciding `action`, if any. Deny wins over approve.
    pub async fn matching(&self, action: &str) -> Result<Option<StandingRule>, RuleError> {
        let now = Utc::now();
        let live: Vec<StandingRule> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.expires_at.is_none_or(|t| t > now))
            .filter(|r| pattern_matches(&r.action_pattern, action))
            .collect();

        Ok(live
            .iter()
            .find(|r| r.verdict == RuleVerdict::Deny)
            .or_else(|| live.first())
            .cloned())
    }

    /// Whether a plan can bypass the user prompt entirely: every step is
    /// covered by an approve rule and none matches a deny rule.
    ///
    /// On bypass, each covering rule's approval count is incremented.
    pub async fn plan_bypasses_approval(&self, plan: &ExecutionPlan) -> Result<bool, RuleError> {
        if plan.steps.is_empty() {
            return Ok(false);
        }

        let mut used_rules: Vec<Uuid> = Vec::new();
        for step in &plan.steps {
            let action = step.qualified_action();
            match self.matching(&action).await? {
                Some(rule) if rule.verdict == RuleVerdict::Approve => {
                    used_rules.push(rule.id);
                }
                _ => return Ok(false),
            }
        }

        for rule_id in used_rules {
            sqlx::query(
                "UPDATE decisions SET approval_count = approval_count + 1 WHERE id = ?1",
            )
            .bind(rule_id.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(true)
    }
}

type RuleRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
);

fn row_into_rule(row: RuleRow) -> Result<StandingRule, RuleError> {
    let (id, action_pattern, scope, verdict, expires_at, approval_count, created_at, created_by) =
        row;
    let parse_time = |value: &str| -> Result<DateTime<Utc>, RuleError> {
        Ok(DateTime::parse_from_rfc3339(value)
            .map_err(|e| RuleError::Corrupt(e.to_string()))?
            .with_timezone(&Utc))
    };
    Ok(StandingRule {
        id: id.parse().map_err(|e| RuleError::Corrupt(format!("{e}")))?,
        action_pattern,
        scope,
        verdict: verdict.parse()?,
        expires_at: expires_at.as_deref().map(parse_time).transpose()?,
        approval_count: u32::try_from(approval_count)
            .map_err(|e| RuleError::Corrupt(e.to_string()))?,
        created_at: parse_time(&created_at)?,
        created_by,
    })
}
