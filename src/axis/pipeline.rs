//! Pipeline — drives one job from claim to settlement.
//!
//! The worker pool hands a freshly claimed job to [`Pipeline::process`],
//! which walks the phases: ask the planner component for a plan, have the
//! validator judge it, gate on the user where demanded, execute the plan
//! with idempotency and circuit protection wrapped around every step, and
//! finally hand the outcome to the reflection component. All phase hops
//! ride the message router; all state hops ride the job queue.
//!
//! Approval never holds a worker: the job parks and the coordinator later
//! routes an `execute.request` back to the pipeline's executor component.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::axis::approval::{ApprovalCoordinator, GateOutcome};
use crate::axis::breaker::CircuitBreaker;
use crate::axis::dag::{DagExecutor, RunOptions, StepError, StepExecutor};
use crate::axis::idempotency::{ExecutionLog, IdempotencyOutcome};
use crate::axis::queue::{JobPatch, JobQueue};
use crate::axis::router::{Envelope, HandlerError, MessageHandler, MessageRouter};
use crate::axis::worker::JobProcessor;
use crate::config::TimeoutConfig;
use crate::types::{
    ErrorKind, Event, ExecutionPlan, Job, JobError, JobStatus, PlanStep, RunOutcome, RunStatus,
    StepOutcome, ValidationResult, Verdict,
};

/// Runs one gear action. This is the boundary to the sandboxed plugin
/// runtime; the pipeline wraps it with idempotency and circuit breaking.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute `step` for `job_id`, observing `cancel`.
    async fn run_step(
        &self,
        job_id: Uuid,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepError>;
}

/// The phase driver.
pub struct Pipeline {
    queue: Arc<JobQueue>,
    router: Arc<MessageRouter>,
    dag: DagExecutor,
    execution_log: Arc<ExecutionLog>,
    breaker: Arc<CircuitBreaker>,
    coordinator: Arc<ApprovalCoordinator>,
    runner: Arc<dyn StepRunner>,
    timeouts: TimeoutConfig,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Wire a pipeline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        router: Arc<MessageRouter>,
        dag: DagExecutor,
        execution_log: Arc<ExecutionLog>,
        breaker: Arc<CircuitBreaker>,
        coordinator: Arc<ApprovalCoordinator>,
        runner: Arc<dyn StepRunner>,
        timeouts: TimeoutConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            router,
            dag,
            execution_log,
            breaker,
            coordinator,
            runner,
            timeouts,
            shutdown,
        }
    }

    /// The router component resuming approved jobs (`execute.request`).
    pub fn executor_component(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(ExecutorComponent {
            pipeline: Arc::clone(self),
        })
    }

    async fn drive(&self, mut job: Job, cancel: &CancellationToken) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                let _ = self.queue.cancel(job.id).await;
                return Ok(());
            }

            // Planning.
            let plan = match self.plan_phase(&job, cancel).await {
                Ok(plan) => plan,
                Err(error) => {
                    self.fail(job.id, JobStatus::Planning, error).await;
                    return Ok(());
                }
            };
            job = self
                .queue
                .transition(
                    job.id,
                    JobStatus::Planning,
                    JobStatus::Validating,
                    JobPatch {
                        plan: Some(plan.clone()),
                        ..JobPatch::default()
                    },
                )
                .await?;

            // Validation.
            let validation = match self.validate_phase(&plan).await {
                Ok(validation) => validation,
                Err(error) => {
                    self.fail(job.id, JobStatus::Validating, error).await;
                    return Ok(());
                }
            };

            match validation.verdict {
                Verdict::Approved => {
                    job = self
                        .queue
                        .transition(
                            job.id,
                            JobStatus::Validating,
                            JobStatus::Executing,
                            JobPatch {
                                validation: Some(validation),
                                ..JobPatch::default()
                            },
                        )
                        .await?;
                    break;
                }
                Verdict::Rejected => {
                    info!(job_id = %job.id, "plan rejected by validator");
                    self.queue
                        .transition(
                            job.id,
                            JobStatus::Validating,
                            JobStatus::Rejected,
                            JobPatch {
                                validation: Some(validation),
                                ..JobPatch::default()
                            },
                        )
                        .await?;
                    return Ok(());
                }
                Verdict::Revise => {
                    let revisions = job.revision_count.saturating_add(1);
                    if revisions > self.queue.config().max_revision_count {
                        self.fail(
                            job.id,
                            JobStatus::Validating,
                            JobError::new(
                                ErrorKind::ExceededAttempts,
                                format!("validator demanded revision {revisions} times"),
                            ),
                        )
                        .await;
                        return Ok(());
                    }
                    info!(job_id = %job.id, revisions, "validator sent the plan back");
                    job = self
                        .queue
                        .transition(
                            job.id,
                            JobStatus::Validating,
                            JobStatus::Planning,
                            JobPatch {
                                validation: Some(validation),
                                revision_count: Some(revisions),
                                ..JobPatch::default()
                            },
                        )
                        .await?;
                    continue;
                }
                Verdict::NeedsUserApproval => {
                    match self.coordinator.gate(&job, &plan, &validation).await {
                        Ok(GateOutcome::Bypassed(advanced)) => {
                            job = advanced;
                            break;
                        }
                        Ok(GateOutcome::Parked { .. }) => {
                            // Worker freed; approval resumes via the
                            // executor component.
                            return Ok(());
                        }
                        Err(error) => {
                            self.fail(
                                job.id,
                                JobStatus::Validating,
                                JobError::new(error.kind(), error.to_string()),
                            )
                            .await;
                            return Ok(());
                        }
                    }
                }
            }
        }

        self.execute_and_reflect(job.id, cancel).await
    }

    /// Run the stored plan for a job in `executing` and journal the
    /// outcome. Entered from `drive` or from an approval resume.
    pub async fn execute_and_reflect(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let job = self.queue.get(job_id).await?;
        let Some(plan) = job.plan.clone() else {
            self.fail(
                job_id,
                JobStatus::Executing,
                JobError::new(ErrorKind::HandlerError, "executing job has no plan"),
            )
            .await;
            return Ok(());
        };

        let total = plan.steps.len();
        let router = Arc::clone(&self.router);
        let options = RunOptions {
            circuit_open: Some(self.breaker.predicate()),
            on_progress: Some(Arc::new(move |settled, total_steps| {
                let percent = if total_steps == 0 {
                    100
                } else {
                    u8::try_from(settled.saturating_mul(100) / total_steps).unwrap_or(100)
                };
                router.broadcast(Event::Progress {
                    job_id,
                    percent,
                    step: None,
                    message: None,
                });
            })),
            step_timeout: Some(Duration::from_millis(self.timeouts.step_ms)),
        };

        let guarded = Arc::new(GuardedRunner {
            job_id,
            execution_log: Arc::clone(&self.execution_log),
            breaker: Arc::clone(&self.breaker),
            runner: Arc::clone(&self.runner),
        });

        let run = match self.dag.execute(&plan.steps, guarded, cancel, options).await {
            Ok(run) => run,
            Err(structural) => {
                self.fail(
                    job_id,
                    JobStatus::Executing,
                    JobError::new(structural.kind(), structural.to_string()),
                )
                .await;
                return Ok(());
            }
        };

        if cancel.is_cancelled() {
            info!(job_id = %job_id, "execution cancelled");
            let _ = self.queue.cancel(job_id).await;
            return Ok(());
        }

        let result = serde_json::to_value(&run)?;
        self.queue
            .transition(
                job_id,
                JobStatus::Executing,
                JobStatus::Reflecting,
                JobPatch {
                    result: Some(result.clone()),
                    ..JobPatch::default()
                },
            )
            .await?;

        self.reflect_phase(job_id, &plan, &run).await;

        if run.status == RunStatus::Failed {
            let failed = run
                .step_results
                .iter()
                .filter(|r| matches!(r.outcome, StepOutcome::Failed { .. }))
                .count();
            let error = JobError::new(
                ErrorKind::HandlerError,
                format!("plan execution failed: {failed} of {total} steps failed"),
            );
            self.queue
                .transition(
                    job_id,
                    JobStatus::Reflecting,
                    JobStatus::Failed,
                    JobPatch {
                        error: Some(error.clone()),
                        ..JobPatch::default()
                    },
                )
                .await?;
            self.router.broadcast(Event::Error {
                job_id,
                code: error.kind.code().to_owned(),
                message: error.message,
            });
        } else {
            self.queue
                .transition(
                    job_id,
                    JobStatus::Reflecting,
                    JobStatus::Completed,
                    JobPatch::default(),
                )
                .await?;
            self.router.broadcast(Event::Result { job_id, result });
        }
        Ok(())
    }

    async fn plan_phase(
        &self,
        job: &Job,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, JobError> {
        let request = Envelope::request(
            "pipeline",
            "scout",
            "plan.request",
            serde_json::json!({
                "job_id": job.id,
                "metadata": job.metadata,
            }),
        )
        .with_job(job.id);

        let response = self
            .router
            .dispatch_with_timeout(request, Duration::from_millis(self.timeouts.planning_ms))
            .await;

        if let Some(code) = response.error_code() {
            let kind = if code == "TIMEOUT" {
                ErrorKind::Timeout
            } else {
                ErrorKind::HandlerError
            };
            return Err(JobError::new(kind, format!("planning failed: {code}")));
        }

        serde_json::from_value(response.payload)
            .map_err(|e| JobError::new(ErrorKind::HandlerError, format!("malformed plan: {e}")))
    }

    async fn validate_phase(&self, plan: &ExecutionPlan) -> Result<ValidationResult, JobError> {
        let request = Envelope::request(
            "pipeline",
            "sentinel",
            "validate.request",
            serde_json::json!({"plan": plan}),
        );
        let response = self
            .router
            .dispatch_with_timeout(request, Duration::from_millis(self.timeouts.validation_ms))
            .await;

        if let Some(code) = response.error_code() {
            let kind = if code == "TIMEOUT" {
                ErrorKind::Timeout
            } else {
                ErrorKind::HandlerError
            };
            return Err(JobError::new(kind, format!("validation failed: {code}")));
        }

        serde_json::from_value(response.payload).map_err(|e| {
            JobError::new(ErrorKind::HandlerError, format!("malformed validation: {e}"))
        })
    }

    /// Best-effort: reflection failures are logged, never fatal.
    async fn reflect_phase(&self, job_id: Uuid, plan: &ExecutionPlan, run: &RunOutcome) {
        let request = Envelope::request(
            "pipeline",
            "journal",
            "reflect.request",
            serde_json::json!({
                "plan": plan,
                "status": run.status,
                "step_results": run.step_results,
            }),
        )
        .with_job(job_id);

        let response = self
            .router
            .dispatch_with_timeout(request, Duration::from_millis(self.timeouts.validation_ms))
            .await;
        if let Some(code) = response.error_code() {
            warn!(job_id = %job_id, code, "reflection failed");
        }
    }

    async fn fail(&self, job_id: Uuid, from: JobStatus, error: JobError) {
        warn!(job_id = %job_id, kind = error.kind.code(), message = %error.message, "job failed");
        self.router.broadcast(Event::Error {
            job_id,
            code: error.kind.code().to_owned(),
            message: error.message.clone(),
        });
        if let Err(e) = self
            .queue
            .transition(
                job_id,
                from,
                JobStatus::Failed,
                JobPatch {
                    error: Some(error),
                    ..JobPatch::default()
                },
            )
            .await
        {
            warn!(job_id = %job_id, error = %e, "could not record job failure");
        }
    }
}

#[async_trait]
impl JobProcessor for Pipeline {
    async fn process(&self, job: Job, cancel: CancellationToken) -> anyhow::Result<()> {
        let budget = Duration::from_millis(self.timeouts.job_ms);
        match tokio::time::timeout(budget, self.drive(job.clone(), &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                let current = self.queue.get(job.id).await?.status;
                if !current.is_terminal() && current != JobStatus::AwaitingApproval {
                    self.fail(
                        job.id,
                        current,
                        JobError::new(
                            ErrorKind::Timeout,
                            format!("job exceeded {}ms", budget.as_millis()),
                        ),
                    )
                    .await;
                }
                Ok(())
            }
        }
    }
}

/// Wraps the external runner with the execution log and circuit breaker.
struct GuardedRunner {
    job_id: Uuid,
    execution_log: Arc<ExecutionLog>,
    breaker: Arc<CircuitBreaker>,
    runner: Arc<dyn StepRunner>,
}

#[async_trait]
impl StepExecutor for GuardedRunner {
    async fn execute_step(
        &self,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepError> {
        let decision = self
            .execution_log
            .check(self.job_id, &step.id)
            .await
            .map_err(|e| StepError::Failed(format!("execution log: {e}")))?;

        let execution_id = match decision {
            IdempotencyOutcome::Cached { result, .. } => return Ok(result),
            IdempotencyOutcome::Execute { execution_id } => execution_id,
        };

        match self.runner.run_step(self.job_id, step, cancel).await {
            Ok(value) => {
                if let Err(e) = self.execution_log.record_completion(&execution_id, &value).await {
                    warn!(execution_id = %execution_id, error = %e, "failed to record completion");
                }
                self.breaker.record_success(&step.gear);
                Ok(value)
            }
            Err(error) => {
                if let Err(e) = self.execution_log.record_failure(&execution_id).await {
                    warn!(execution_id = %execution_id, error = %e, "failed to record failure");
                }
                self.breaker.record_failure(&step.gear);
                Err(error)
            }
        }
    }
}

/// Router component that resumes approved jobs.
struct ExecutorComponent {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl MessageHandler for ExecutorComponent {
    async fn handle(&self, message: Envelope) -> Result<serde_json::Value, HandlerError> {
        let job_id: Uuid = message
            .payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .or(message.job_id)
            .ok_or_else(|| HandlerError::internal("execute.request without job_id"))?;

        let pipeline = Arc::clone(&self.pipeline);
        let cancel = pipeline.shutdown.child_token();
        // The run outlives this dispatch; the reply only acknowledges
        // acceptance.
        tokio::spawn(async move {
            if let Err(e) = pipeline.execute_and_reflect(job_id, &cancel).await {
                warn!(job_id = %job_id, error = %e, "resumed execution failed");
            }
        });

        Ok(serde_json::json!({"accepted": true, "job_id": job_id}))
    }
}
