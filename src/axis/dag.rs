//! Plan executor — topologically scheduled, concurrency-limited step runner.
//!
//! Steps are arranged into layers with Kahn's algorithm; layers run in
//! order, steps within a layer run concurrently up to a hard cap, enforced
//! by chunking — every chunk settles before the next starts. A failing
//! step marks all transitive dependents skipped before their layer runs;
//! a false condition skips only its own step. Circuit-open gears are
//! skipped like failures. String parameters carrying `$ref:step:` markers
//! are resolved immediately before execution.
//!
//! Step errors never escape: they settle into the step's outcome. The only
//! `Err` returns are structural plan defects (self/unknown/duplicate
//! dependencies, cycles).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::axis::condition;
use crate::axis::refs::resolve_parameters;
use crate::config::DagConfig;
use crate::types::{ErrorKind, PlanStep, RunOutcome, RunStatus, SkipReason, StepOutcome, StepResult};

/// Structural plan defects.
#[derive(Debug, Error)]
pub enum DagError {
    /// A step depends on itself.
    #[error("step '{step}' depends on itself")]
    SelfDep {
        /// Offending step.
        step: String,
    },
    /// A step depends on an id not present in the plan.
    #[error("step '{step}' depends on unknown step '{dep}'")]
    UnknownDep {
        /// Offending step.
        step: String,
        /// The missing dependency id.
        dep: String,
    },
    /// Two steps share an id.
    #[error("duplicate step id '{step}'")]
    DuplicateStep {
        /// The repeated id.
        step: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving: {}", residual.join(", "))]
    CycleDetected {
        /// Steps that could not be layered, in plan order.
        residual: Vec<String>,
    },
}

impl DagError {
    /// Machine-readable kind for surfaces.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SelfDep { .. } => ErrorKind::SelfDep,
            Self::UnknownDep { .. } => ErrorKind::UnknownDep,
            Self::DuplicateStep { .. } => ErrorKind::UnknownDep,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
        }
    }
}

/// Error a step runner may return for one step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The gear reported a failure.
    #[error("{0}")]
    Failed(String),
    /// The sandboxed runtime refused the step.
    #[error("sandbox denied: {0}")]
    SandboxDenied(String),
}

/// Runs one resolved step. Injected by the pipeline; the executor knows
/// nothing about gears or idempotency.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute `step`, observing `cancel` at safe points.
    async fn execute_step(
        &self,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepError>;
}

/// Per-run knobs beyond the static config.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Returns true when the gear's circuit is open.
    pub circuit_open: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Called after each layer with (settled, total) counts.
    pub on_progress: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
    /// Per-step wall-clock budget.
    pub step_timeout: Option<Duration>,
}

/// The plan executor.
pub struct DagExecutor {
    config: DagConfig,
}

impl DagExecutor {
    /// Build an executor.
    pub fn new(config: DagConfig) -> Self {
        Self { config }
    }

    /// Execute a plan's steps to settlement.
    pub async fn execute(
        &self,
        steps: &[PlanStep],
        executor: Arc<dyn StepExecutor>,
        cancel: &CancellationToken,
        options: RunOptions,
    ) -> Result<RunOutcome, DagError> {
        let started = Instant::now();
        let layers = layer_steps(steps)?;
        let by_id: HashMap<&str, &PlanStep> =
            steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let dependents = reverse_dependencies(steps);

        let mut results: HashMap<String, StepOutcome> = HashMap::new();

        'layers: for layer in &layers {
            if cancel.is_cancelled() {
                break 'layers;
            }

            // Pre-execution gating: skip-propagated, circuit-open, and
            // condition-false steps settle before the layer runs.
            let mut runnable: Vec<PlanStep> = Vec::new();
            for id in layer {
                if results.contains_key(id) {
                    continue; // Already skipped by an earlier failure.
                }
                let step = by_id[id.as_str()];

                if let Some(circuit_open) = &options.circuit_open {
                    if circuit_open(&step.gear) {
                        warn!(step = %id, gear = %step.gear, "skipping step: circuit open");
                        results.insert(
                            id.clone(),
                            StepOutcome::Skipped {
                                reason: SkipReason::CircuitOpen,
                            },
                        );
                        propagate_skips(id, &dependents, &mut results);
                        continue;
                    }
                }

                if let Some(cond) = &step.condition {
                    if !condition::evaluate(cond, &results) {
                        debug!(step = %id, "skipping step: condition false");
                        results.insert(
                            id.clone(),
                            StepOutcome::Skipped {
                                reason: SkipReason::ConditionFalse,
                            },
                        );
                        // A false condition does not propagate; only
                        // failures do.
                        continue;
                    }
                }

                let mut resolved = step.clone();
                resolved.parameters = resolve_parameters(&step.parameters, &results);
                runnable.push(resolved);
            }

            // Concurrency cap: chunks of at most max_concurrency; every
            // chunk settles before the next starts.
            for chunk in runnable.chunks(self.config.max_concurrency.max(1)) {
                if cancel.is_cancelled() {
                    break 'layers;
                }

                let mut tasks: JoinSet<(String, StepOutcome)> = JoinSet::new();
                for step in chunk {
                    let step = step.clone();
                    let executor = Arc::clone(&executor);
                    let cancel = cancel.child_token();
                    let budget = options.step_timeout;
                    tasks.spawn(async move {
                        let outcome = run_one(&step, executor.as_ref(), &cancel, budget).await;
                        (step.id, outcome)
                    });
                }

                while let Some(joined) = tasks.join_next().await {
                    let (id, outcome) = match joined {
                        Ok(settled) => settled,
                        Err(e) => {
                            // The id is lost with the panicked task; the
                            // step settles as a cancellation skip in the
                            // final sweep.
                            warn!(error = %e, "step task panicked");
                            continue;
                        }
                    };
                    if matches!(outcome, StepOutcome::Failed { .. }) {
                        propagate_skips(&id, &dependents, &mut results);
                    }
                    results.insert(id, outcome);
                }
            }

            if let Some(on_progress) = &options.on_progress {
                on_progress(results.len(), steps.len());
            }
        }

        // Anything never entered (cancellation) settles as skipped.
        for step in steps {
            results.entry(step.id.clone()).or_insert(StepOutcome::Skipped {
                reason: SkipReason::Cancelled,
            });
        }

        let step_results: Vec<StepResult> = steps
            .iter()
            .map(|s| StepResult {
                step_id: s.id.clone(),
                outcome: results
                    .remove(&s.id)
                    .unwrap_or(StepOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    }),
            })
            .collect();

        let status = aggregate_status(&step_results);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(RunOutcome {
            status,
            step_results,
            duration_ms,
        })
    }
}

/// Validate the plan and arrange steps into Kahn layers.
fn layer_steps(steps: &[PlanStep]) -> Result<Vec<Vec<String>>, DagError> {
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if index_of.insert(step.id.as_str(), i).is_some() {
            return Err(DagError::DuplicateStep {
                step: step.id.clone(),
            });
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(DagError::SelfDep {
                    step: step.id.clone(),
                });
            }
            if !index_of.contains_key(dep.as_str()) {
                return Err(DagError::UnknownDep {
                    step: step.id.clone(),
                    dep: dep.clone(),
                });
            }
        }
    }

    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            dependents[index_of[dep.as_str()]].push(i);
        }
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0usize;

    while !current.is_empty() {
        current.sort_unstable(); // Plan order within a layer.
        let mut next: Vec<usize> = Vec::new();
        for &i in &current {
            processed = processed.saturating_add(1);
            for &d in &dependents[i] {
                in_degree[d] = in_degree[d].saturating_sub(1);
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        layers.push(current.iter().map(|&i| steps[i].id.clone()).collect());
        current = next;
    }

    if processed < steps.len() {
        let residual: Vec<String> = steps
            .iter()
            .enumerate()
            .filter(|&(i, _)| in_degree[i] > 0)
            .map(|(_, s)| s.id.clone())
            .collect();
        return Err(DagError::CycleDetected { residual });
    }

    Ok(layers)
}

/// `step id -> ids of steps that depend on it` (direct only).
fn reverse_dependencies(steps: &[PlanStep]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            map.entry(dep.clone()).or_default().push(step.id.clone());
        }
    }
    map
}

/// BFS over the reverse-dependency map, marking transitive dependents of
/// `failed_id` as skipped. Already-settled steps keep their outcome.
fn propagate_skips(
    failed_id: &str,
    dependents: &HashMap<String, Vec<String>>,
    results: &mut HashMap<String, StepOutcome>,
) {
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(failed_id);

    while let Some(id) = queue.pop_front() {
        if let Some(children) = dependents.get(id) {
            for child in children {
                if !results.contains_key(child) {
                    results.insert(
                        child.clone(),
                        StepOutcome::Skipped {
                            reason: SkipReason::DependencyFailed,
                        },
                    );
                    queue.push_back(child.as_str());
                }
            }
        }
    }
}

async fn run_one(
    step: &PlanStep,
    executor: &dyn StepExecutor,
    cancel: &CancellationToken,
    budget: Option<Duration>,
) -> StepOutcome {
    let started = Instant::now();
    debug!(step = %step.id, gear = %step.gear, action = %step.action, "executing step");

    let execution = executor.execute_step(step, cancel);
    let result = match budget {
        Some(budget) => match tokio::time::timeout(budget, execution).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(StepError::Failed(format!(
                    "step timed out after {}ms",
                    budget.as_millis()
                )))
            }
        },
        None => execution.await,
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(value) => StepOutcome::Completed { value, duration_ms },
        Err(e) => StepOutcome::Failed {
            error: e.to_string(),
            duration_ms,
        },
    }
}

/// Aggregate status over settled steps.
///
/// `Completed` when nothing failed and nothing was starved by a failure;
/// `Partial` when completions and failures mix; `Failed` only when no step
/// completed. Condition-skips alone never fail a run.
fn aggregate_status(step_results: &[StepResult]) -> RunStatus {
    let mut has_completed = false;
    let mut has_failed = false;
    let mut has_starved_skip = false;

    for result in step_results {
        match &result.outcome {
            StepOutcome::Completed { .. } => has_completed = true,
            StepOutcome::Failed { .. } => has_failed = true,
            StepOutcome::Skipped { reason } => match reason {
                SkipReason::ConditionFalse => {}
                SkipReason::DependencyFailed
                | SkipReason::CircuitOpen
                | SkipReason::Cancelled => has_starved_skip = true,
            },
        }
    }

    if has_completed && has_failed {
        RunStatus::Partial
    } else if !has_completed && (has_failed || has_starved_skip) {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}
