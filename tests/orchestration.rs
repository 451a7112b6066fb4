//! End-to-end orchestration: a job created in the queue is claimed by the
//! worker pool, planned by a mock scout, validated, (optionally) gated on
//! approval, executed against mock gears, and journaled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meridian::axis::dag::StepError;
use meridian::axis::lifecycle::Lifecycle;
use meridian::axis::pipeline::StepRunner;
use meridian::axis::queue::NewJob;
use meridian::axis::router::{Envelope, HandlerError, MessageHandler};
use meridian::config::MeridianConfig;
use meridian::ids::{execution_id, new_id};
use meridian::types::{
    Event, ExecutionPlan, JobStatus, PlanStep, RiskLevel,
};

// ── Fixtures ──

fn test_config(dir: &std::path::Path) -> MeridianConfig {
    let mut config = MeridianConfig::default();
    config.paths.data_dir = dir.join("data");
    config.paths.logs_dir = dir.join("logs");
    config.paths.backups_dir = dir.join("backups");
    config.paths.workspace_root = dir.join("workspace");
    config.queue.poll_interval_ms = 10;
    config.workers.pool_size = Some(2);
    config
}

fn step(id: &str, gear: &str, action: &str, params: serde_json::Value) -> PlanStep {
    PlanStep {
        id: id.to_owned(),
        gear: gear.to_owned(),
        action: action.to_owned(),
        parameters: params,
        risk_level: RiskLevel::Low,
        depends_on: vec![],
        condition: None,
        description: None,
    }
}

fn plan_of(steps: Vec<PlanStep>) -> ExecutionPlan {
    ExecutionPlan {
        id: new_id(),
        steps,
        reasoning: Some("test plan".to_owned()),
    }
}

/// Scout returning a canned plan.
struct FixedScout {
    plan: ExecutionPlan,
}

#[async_trait]
impl MessageHandler for FixedScout {
    async fn handle(&self, _message: Envelope) -> Result<serde_json::Value, HandlerError> {
        serde_json::to_value(self.plan.clone()).map_err(|e| HandlerError::internal(e.to_string()))
    }
}

/// Journal recording reflect payloads.
struct RecordingJournal {
    reflections: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl MessageHandler for RecordingJournal {
    async fn handle(&self, message: Envelope) -> Result<serde_json::Value, HandlerError> {
        self.reflections
            .lock()
            .expect("test lock")
            .push(message.payload);
        Ok(serde_json::json!({"stored": true}))
    }
}

/// Gear runtime with canned per-step outcomes.
struct FakeGears {
    outcomes: HashMap<String, Result<serde_json::Value, String>>,
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeGears {
    fn new(outcomes: Vec<(&str, Result<serde_json::Value, String>)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: outcomes
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            invocations: Mutex::new(Vec::new()),
        })
    }

    fn invoked(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("test lock")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl StepRunner for FakeGears {
    async fn run_step(
        &self,
        _job_id: Uuid,
        step: &PlanStep,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepError> {
        self.invocations
            .lock()
            .expect("test lock")
            .push((step.id.clone(), step.parameters.clone()));
        match self.outcomes.get(&step.id) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(StepError::Failed(message.clone())),
            None => Ok(serde_json::json!({"ok": true})),
        }
    }
}

async fn start_runtime(
    dir: &std::path::Path,
    plan: ExecutionPlan,
    gears: Arc<FakeGears>,
) -> (Lifecycle, Arc<RecordingJournal>) {
    let lifecycle = Lifecycle::start(test_config(dir), gears)
        .await
        .expect("runtime starts");
    lifecycle
        .registry()
        .register("scout", Arc::new(FixedScout { plan }))
        .await;
    let journal = Arc::new(RecordingJournal {
        reflections: Mutex::new(Vec::new()),
    });
    lifecycle.registry().register("journal", journal.clone()).await;
    (lifecycle, journal)
}

async fn wait_for_status(lifecycle: &Lifecycle, job_id: Uuid, wanted: JobStatus) -> JobStatus {
    for _ in 0..500 {
        let status = lifecycle.queue().get(job_id).await.expect("get").status;
        if status == wanted || status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    lifecycle.queue().get(job_id).await.expect("get").status
}

// ── Scenarios ──

#[tokio::test]
async fn happy_path_single_low_risk_step() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let gears = FakeGears::new(vec![("s1", Ok(serde_json::json!({"content": "hi"})))]);
    let plan = plan_of(vec![step(
        "s1",
        "file-manager",
        "read",
        serde_json::json!({"path": "data/a.txt"}),
    )]);
    let (lifecycle, journal) = start_runtime(tmp.path(), plan, gears.clone()).await;

    let job = lifecycle
        .queue()
        .create_job(NewJob::default())
        .await
        .expect("create");
    let status = wait_for_status(&lifecycle, job.id, JobStatus::Completed).await;
    assert_eq!(status, JobStatus::Completed);

    // One completed execution row under the deterministic id.
    let exec_id = execution_id(job.id, "s1");
    let (row_status,): (String,) =
        sqlx::query_as("SELECT status FROM executions WHERE execution_id = ?1")
            .bind(&exec_id)
            .fetch_one(lifecycle.store().meridian())
            .await
            .expect("execution row");
    assert_eq!(row_status, "completed");

    assert_eq!(gears.invoked(), vec!["s1"]);
    assert_eq!(journal.reflections.lock().expect("test lock").len(), 1);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn approval_gate_then_execute_and_replay_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let gears = FakeGears::new(vec![]);
    let mut risky = step("s1", "email", "send", serde_json::json!({"to": "a@b.c"}));
    risky.risk_level = RiskLevel::Critical;
    let (lifecycle, _journal) = start_runtime(tmp.path(), plan_of(vec![risky]), gears.clone()).await;

    let mut events = lifecycle.router().subscribe();
    let job = lifecycle
        .queue()
        .create_job(NewJob::default())
        .await
        .expect("create");

    let status = wait_for_status(&lifecycle, job.id, JobStatus::AwaitingApproval).await;
    assert_eq!(status, JobStatus::AwaitingApproval);
    assert!(gears.invoked().is_empty(), "nothing runs before approval");

    // Fish the nonce out of the broadcast.
    let nonce = loop {
        match events.recv().await.expect("event") {
            Event::ApprovalRequired { job_id, nonce, .. } if job_id == job.id => break nonce,
            _ => continue,
        }
    };

    // First approval succeeds and the job runs to completion.
    lifecycle
        .coordinator()
        .approve(job.id, &nonce)
        .await
        .expect("first approval");
    let status = wait_for_status(&lifecycle, job.id, JobStatus::Completed).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(gears.invoked(), vec!["s1"]);

    // Replaying the consumed nonce is refused.
    let replay = lifecycle.coordinator().approve(job.id, &nonce).await;
    assert!(
        matches!(
            replay,
            Err(meridian::axis::approval::ApprovalError::NonceConsumed(_))
        ),
        "second approval must be NONCE_CONSUMED"
    );

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn failed_dependency_skips_downstream_steps() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut s2 = step("s2", "file-manager", "read", serde_json::json!({"path": "b"}));
    s2.depends_on = vec!["s1".to_owned()];
    let mut s3 = step("s3", "file-manager", "read", serde_json::json!({"path": "c"}));
    s3.depends_on = vec!["s2".to_owned()];
    let plan = plan_of(vec![
        step("s1", "file-manager", "read", serde_json::json!({"path": "a"})),
        s2,
        s3,
    ]);
    let gears = FakeGears::new(vec![("s1", Err("read failed".to_owned()))]);
    let (lifecycle, _journal) = start_runtime(tmp.path(), plan, gears.clone()).await;

    let job = lifecycle
        .queue()
        .create_job(NewJob::default())
        .await
        .expect("create");
    let status = wait_for_status(&lifecycle, job.id, JobStatus::Failed).await;
    assert_eq!(status, JobStatus::Failed);

    let done = lifecycle.queue().get(job.id).await.expect("get");
    let result = done.result.expect("run outcome stored");
    let statuses: Vec<&str> = result["step_results"]
        .as_array()
        .expect("array")
        .iter()
        .map(|r| r["outcome"]["status"].as_str().expect("status"))
        .collect();
    assert_eq!(statuses, vec!["failed", "skipped", "skipped"]);
    assert_eq!(result["status"], "failed");
    assert_eq!(gears.invoked(), vec!["s1"]);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn step_references_resolve_against_earlier_results() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut s2 = step("s2", "notifier", "post", serde_json::json!({"u": "$ref:step:s1.user.id"}));
    s2.depends_on = vec!["s1".to_owned()];
    let plan = plan_of(vec![
        step("s1", "file-manager", "read", serde_json::json!({"path": "a"})),
        s2,
    ]);
    let gears = FakeGears::new(vec![("s1", Ok(serde_json::json!({"user": {"id": 42}})))]);
    let (lifecycle, _journal) = start_runtime(tmp.path(), plan, gears.clone()).await;

    let job = lifecycle
        .queue()
        .create_job(NewJob::default())
        .await
        .expect("create");
    let status = wait_for_status(&lifecycle, job.id, JobStatus::Completed).await;
    assert_eq!(status, JobStatus::Completed);

    let invocations = gears.invocations.lock().expect("test lock");
    let (_, params) = invocations
        .iter()
        .find(|(id, _)| id == "s2")
        .expect("s2 ran");
    assert_eq!(params["u"], 42, "s2 must see the resolved value");

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn rejected_plan_never_reaches_gears() {
    let tmp = tempfile::tempdir().expect("tempdir");
    // Unbounded shell exec: rejected by the validator.
    let plan = plan_of(vec![step("s1", "shell", "exec", serde_json::json!({}))]);
    let gears = FakeGears::new(vec![]);
    let (lifecycle, _journal) = start_runtime(tmp.path(), plan, gears.clone()).await;

    let job = lifecycle
        .queue()
        .create_job(NewJob::default())
        .await
        .expect("create");
    let status = wait_for_status(&lifecycle, job.id, JobStatus::Rejected).await;
    assert_eq!(status, JobStatus::Rejected);
    assert!(gears.invoked().is_empty());

    let done = lifecycle.queue().get(job.id).await.expect("get");
    let validation = done.validation.expect("validation stored");
    assert_eq!(validation.overall_risk, RiskLevel::Critical);

    lifecycle.shutdown().await;
}
