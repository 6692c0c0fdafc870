//! Pipeline orchestration.
//!
//! The orchestrator owns the life of one run: it validates and expands the
//! definition, then repeatedly consults the [`DependencyGate`] against a fresh
//! status snapshot, launching every ready instance as its own task.
//!
//! Writers of the status table:
//! - the orchestrator writes `running` before spawning an instance, and every
//!   `skipped`/`cancelled` transition;
//! - a worker writes its own step cursor and terminal status.
//!
//! Every decision is derived from recorded statuses, so a run reloaded from
//! the [`RunRepository`] can be resumed.

use crate::dag::DagBuilder;
use crate::gate::{DependencyGate, GateDecision};
use crate::matrix::MatrixExpander;
use crate::status::{StatusSnapshot, StatusTable};
use crate::triggers::RunRequest;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tollgate_core::events::{
    Event, JobCompletedPayload, JobStartedPayload, MatrixExpandedPayload, RunCompletedPayload,
    RunStartedPayload, StepStartedPayload,
};
use tollgate_core::ids::{InstanceId, RunId};
use tollgate_core::pipeline::{PipelineDefinition, StepDefinition};
use tollgate_core::ports::{EventBus, RunRepository};
use tollgate_core::run::{FailureReason, JobInstance, JobStatus, PipelineRun, RunStatus};
use tollgate_core::{Error, Result};
use tollgate_runner::{JobContext, JobExecutor, JobOutcome, StepObserver};
use tracing::{debug, error, info, warn};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Instances allowed to run at once across all groups.
    pub max_workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Requests cancellation of a run.
///
/// Pending instances are cancelled; running instances finish and keep their
/// outcome.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives pipeline runs to completion.
pub struct Orchestrator {
    config: OrchestratorConfig,
    executor: Arc<JobExecutor>,
    runs: Arc<dyn RunRepository>,
    events: Arc<dyn EventBus>,
    dag_builder: DagBuilder,
    matrix_expander: MatrixExpander,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<JobExecutor>,
        runs: Arc<dyn RunRepository>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            executor,
            runs,
            events,
            dag_builder: DagBuilder::new(),
            matrix_expander: MatrixExpander::new(),
        }
    }

    /// Validate a request and expand it into a pending run without storing it.
    pub fn plan(&self, request: &RunRequest) -> Result<PipelineRun> {
        let definition = &request.definition;

        for job in &definition.jobs {
            job.validate()?;
        }
        self.dag_builder.build(definition)?;

        let overrides = request.fail_fast_overrides();
        if let Some(unknown) = overrides.keys().find(|job| definition.job(job).is_none()) {
            return Err(Error::Configuration(format!(
                "trigger overrides fail_fast for unknown job '{}'",
                unknown
            )));
        }

        let mut jobs = Vec::new();
        let mut fail_fast = BTreeMap::new();
        for job in &definition.jobs {
            let expansion = self.matrix_expander.expand(job)?;
            let effective = overrides
                .get(&job.name)
                .copied()
                .unwrap_or(expansion.fail_fast);
            fail_fast.insert(job.name.clone(), effective);
            jobs.extend(expansion.instances);
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = jobs.iter().find(|i| !seen.insert(&i.id)) {
            return Err(Error::Configuration(format!(
                "instance id '{}' is produced more than once",
                duplicate.id
            )));
        }

        Ok(PipelineRun {
            id: RunId::new(),
            pipeline_name: definition.name.clone(),
            status: RunStatus::Pending,
            trigger: request.trigger.clone(),
            definition: definition.clone(),
            jobs,
            fail_fast,
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Validate, expand and store a pending run.
    ///
    /// Configuration errors surface here, before any job launches.
    pub async fn prepare(&self, request: &RunRequest) -> Result<PipelineRun> {
        let run = self.plan(request)?;
        self.runs.save(&run).await?;
        info!(
            run_id = %run.id,
            pipeline = %run.pipeline_name,
            instances = run.jobs.len(),
            "Run prepared"
        );
        Ok(run)
    }

    /// Execute a prepared run until every instance is terminal.
    pub async fn execute(&self, run: PipelineRun) -> Result<PipelineRun> {
        self.execute_with(run, CancelHandle::new()).await
    }

    /// Like [`execute`](Self::execute), observing `cancel`.
    ///
    /// A run that is already `running` is resumed.
    pub async fn execute_with(&self, run: PipelineRun, cancel: CancelHandle) -> Result<PipelineRun> {
        match run.status {
            RunStatus::Pending => self.start(run, cancel).await,
            RunStatus::Running => self.restart(run, cancel).await,
            _ => Err(Error::RunAlreadyCompleted),
        }
    }

    /// Continue a run reloaded after the host stopped.
    pub async fn resume(&self, run: PipelineRun) -> Result<PipelineRun> {
        self.resume_with(run, CancelHandle::new()).await
    }

    /// Like [`resume`](Self::resume), observing `cancel`.
    ///
    /// Instances recorded `running` were interrupted mid-job and end `failed`;
    /// they are never retried. `pending` instances are scheduled normally. A
    /// run that never started is started as by [`execute`](Self::execute).
    pub async fn resume_with(&self, run: PipelineRun, cancel: CancelHandle) -> Result<PipelineRun> {
        self.execute_with(run, cancel).await
    }

    async fn start(&self, mut run: PipelineRun, cancel: CancelHandle) -> Result<PipelineRun> {
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());

        let active = Arc::new(ActiveRun::new(run, self.runs.clone(), self.events.clone()));
        active.persist().await?;

        let run = active.table.run().await;
        info!(run_id = %run.id, pipeline = %run.pipeline_name, "Run started");
        active
            .publish(Event::RunStarted(RunStartedPayload {
                run_id: run.id,
                pipeline_name: run.pipeline_name.clone(),
                trigger: run.trigger.trigger_type,
                job_count: run.jobs.len() as u32,
                started_at: run.started_at.unwrap_or_else(Utc::now),
            }))
            .await;

        for job in &run.definition.jobs {
            active
                .publish(Event::MatrixExpanded(MatrixExpandedPayload {
                    run_id: run.id,
                    job: job.name.clone(),
                    instances: run.instances_of(&job.name).map(|i| i.id.clone()).collect(),
                    fail_fast: run.fail_fast.get(&job.name).copied().unwrap_or(true),
                    max_parallel: job.matrix.as_ref().and_then(|m| m.max_parallel),
                }))
                .await;
        }

        self.drive(active, cancel).await
    }

    async fn restart(&self, mut run: PipelineRun, cancel: CancelHandle) -> Result<PipelineRun> {
        let now = Utc::now();
        let mut interrupted = Vec::new();
        for instance in run.jobs.iter_mut().filter(|i| i.status == JobStatus::Running) {
            instance.status = JobStatus::Failed;
            instance.failure = Some(FailureReason::Interrupted);
            instance.completed_at = Some(now);
            interrupted.push(instance.clone());
        }

        run.status = RunStatus::Running;
        run.started_at.get_or_insert(now);

        info!(
            run_id = %run.id,
            interrupted = interrupted.len(),
            "Resuming run"
        );

        let active = Arc::new(ActiveRun::new(run, self.runs.clone(), self.events.clone()));
        active.persist().await?;
        for instance in &interrupted {
            warn!(run_id = %active.id, instance = %instance.id, "Instance interrupted by restart");
            active.publish_completed(instance).await;
        }

        self.drive(active, cancel).await
    }

    async fn drive(&self, active: Arc<ActiveRun>, cancel: CancelHandle) -> Result<PipelineRun> {
        let gate = DependencyGate::new(&active.definition);
        let max_workers = self.config.max_workers.max(1);
        let limits: HashMap<String, usize> = active
            .definition
            .jobs
            .iter()
            .filter_map(|job| {
                let limit = job.matrix.as_ref()?.max_parallel?;
                Some((job.name.clone(), (limit as usize).max(1)))
            })
            .collect();

        let mut cancel_rx = cancel.subscribe();
        let mut cancel_seen = false;
        let mut tasks: JoinSet<InstanceId> = JoinSet::new();

        loop {
            if !cancel_seen && cancel.is_cancelled() {
                cancel_seen = true;
                info!(run_id = %active.id, "Cancellation requested");
                active.table.update(|run| run.cancel_requested = true).await;
            }

            let launched = active.advance(&gate, max_workers, &limits).await?;
            for instance in launched {
                tasks.spawn(run_instance(active.clone(), self.executor.clone(), instance));
            }

            if tasks.is_empty() {
                if active.table.snapshot().await.all_terminal() {
                    break;
                }
                return Err(Error::Internal(format!(
                    "run {} has pending instances but nothing can start",
                    active.id
                )));
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok(instance) => debug!(run_id = %active.id, instance = %instance, "Worker finished"),
                    Err(e) => error!(run_id = %active.id, error = %e, "Worker task failed"),
                },
                _ = cancel_rx.changed(), if !cancel_seen => {}
            }
        }

        active.complete().await
    }
}

/// State shared between the orchestrator loop and its workers.
struct ActiveRun {
    id: RunId,
    definition: Arc<PipelineDefinition>,
    table: StatusTable,
    runs: Arc<dyn RunRepository>,
    events: Arc<dyn EventBus>,
    save_lock: Mutex<()>,
}

impl ActiveRun {
    fn new(run: PipelineRun, runs: Arc<dyn RunRepository>, events: Arc<dyn EventBus>) -> Self {
        Self {
            id: run.id,
            definition: Arc::new(run.definition.clone()),
            table: StatusTable::new(run),
            runs,
            events,
            save_lock: Mutex::new(()),
        }
    }

    /// Store the latest state of the run.
    async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let run = self.table.run().await;
        self.runs.save(&run).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(run_id = %self.id, error = %e, "Failed to persist run");
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.events.publish(event).await {
            warn!(run_id = %self.id, error = %e, "Failed to publish event");
        }
    }

    async fn publish_completed(&self, instance: &JobInstance) {
        self.publish(Event::JobCompleted(JobCompletedPayload {
            run_id: self.id,
            instance_id: instance.id.clone(),
            status: instance.status,
            failure: instance.failure.clone(),
            completed_at: instance.completed_at.unwrap_or_else(Utc::now),
        }))
        .await;
    }

    /// Resolve pending instances that can no longer run, then mark ready
    /// instances `running` within the concurrency limits.
    ///
    /// Cancellation and fail-fast cancel pending instances; a gate that can
    /// never open skips them. Resolution repeats until nothing changes so
    /// skips propagate through chains of dependents. Both passes run under
    /// one write lock.
    async fn advance(
        &self,
        gate: &DependencyGate,
        max_workers: usize,
        limits: &HashMap<String, usize>,
    ) -> Result<Vec<JobInstance>> {
        let now = Utc::now();
        let mut resolved: Vec<JobInstance> = Vec::new();
        let mut launched: Vec<JobInstance> = Vec::new();

        self.table
            .update(|run| {
                loop {
                    let snapshot = StatusSnapshot::from_run(run);
                    let cancel_all = run.cancel_requested;
                    let failed_groups = failed_fail_fast_groups(run);

                    let mut changed = false;
                    for instance in run.jobs.iter_mut().filter(|i| i.status == JobStatus::Pending) {
                        let next = if cancel_all || failed_groups.contains(&instance.job) {
                            JobStatus::Cancelled
                        } else if gate.can_start(instance, &snapshot) == GateDecision::NeverEligible {
                            JobStatus::Skipped
                        } else {
                            continue;
                        };
                        instance.status = next;
                        instance.completed_at = Some(now);
                        resolved.push(instance.clone());
                        changed = true;
                    }

                    if !changed {
                        break;
                    }
                }

                let snapshot = StatusSnapshot::from_run(run);
                let mut running = snapshot.running();
                let mut group_running: HashMap<String, usize> = HashMap::new();

                for instance in run.jobs.iter_mut().filter(|i| i.status == JobStatus::Pending) {
                    if running >= max_workers {
                        break;
                    }
                    if gate.can_start(instance, &snapshot) != GateDecision::Ready {
                        continue;
                    }

                    let in_group = group_running
                        .entry(instance.job.clone())
                        .or_insert_with(|| snapshot.running_in(&instance.job));
                    if limits.get(&instance.job).is_some_and(|limit| *in_group >= *limit) {
                        continue;
                    }

                    instance.status = JobStatus::Running;
                    instance.started_at = Some(now);
                    instance.step_cursor = None;
                    instance.failure = None;
                    running += 1;
                    *in_group += 1;
                    launched.push(instance.clone());
                }
            })
            .await;

        if resolved.is_empty() && launched.is_empty() {
            return Ok(launched);
        }

        self.persist().await?;
        for instance in &resolved {
            info!(run_id = %self.id, instance = %instance.id, status = %instance.status, "Instance resolved without running");
            self.publish_completed(instance).await;
        }
        for instance in &launched {
            let step_count = self
                .definition
                .job(&instance.job)
                .map(|j| j.steps.len())
                .unwrap_or_default();
            info!(run_id = %self.id, instance = %instance.id, "Instance started");
            self.publish(Event::JobStarted(JobStartedPayload {
                run_id: self.id,
                instance_id: instance.id.clone(),
                step_count: step_count as u32,
                started_at: now,
            }))
            .await;
        }
        Ok(launched)
    }

    /// Record a worker's terminal outcome.
    async fn finish(&self, id: &InstanceId, outcome: JobOutcome) {
        let now = Utc::now();
        let updated = self
            .table
            .update_instance(id, |instance| {
                instance.status = outcome.status;
                instance.failure = outcome.failure.clone();
                instance.completed_at = Some(now);
            })
            .await;

        let Some(run) = updated else {
            error!(run_id = %self.id, instance = %id, "Finished instance is not part of the run");
            return;
        };

        self.persist_logged().await;
        if let Some(instance) = run.instance(id) {
            match &instance.failure {
                Some(reason) => warn!(run_id = %self.id, instance = %id, reason = reason.code(), "Instance failed"),
                None => info!(run_id = %self.id, instance = %id, status = %instance.status, "Instance finished"),
            }
            self.publish_completed(instance).await;
        }
    }

    async fn complete(&self) -> Result<PipelineRun> {
        let run = self
            .table
            .update(|run| {
                run.status = run.final_status();
                run.completed_at = Some(Utc::now());
            })
            .await;
        self.persist().await?;

        let count = |status: JobStatus| run.jobs.iter().filter(|i| i.status == status).count() as u32;
        info!(
            run_id = %run.id,
            status = %run.status,
            duration_ms = run.duration_ms().unwrap_or_default(),
            "Run completed"
        );
        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: run.id,
            pipeline_name: run.pipeline_name.clone(),
            status: run.status,
            duration_ms: run.duration_ms().unwrap_or_default(),
            jobs_succeeded: count(JobStatus::Succeeded),
            jobs_failed: count(JobStatus::Failed),
            jobs_skipped: count(JobStatus::Skipped),
            jobs_cancelled: count(JobStatus::Cancelled),
            completed_at: run.completed_at.unwrap_or_else(Utc::now),
        }))
        .await;

        Ok(run)
    }
}

/// Matrix groups with fail-fast on and at least one failed instance.
fn failed_fail_fast_groups(run: &PipelineRun) -> HashSet<String> {
    run.jobs
        .iter()
        .filter(|i| i.status == JobStatus::Failed)
        .filter(|i| run.fail_fast.get(&i.job).copied().unwrap_or(true))
        .map(|i| i.job.clone())
        .collect()
}

/// Records step progress of one instance.
struct ProgressObserver {
    active: Arc<ActiveRun>,
    instance_id: InstanceId,
}

#[async_trait]
impl StepObserver for ProgressObserver {
    async fn step_started(&self, index: usize, step: &StepDefinition) {
        self.active
            .table
            .update_instance(&self.instance_id, |instance| instance.step_cursor = Some(index))
            .await;
        self.active.persist_logged().await;
        self.active
            .publish(Event::StepStarted(StepStartedPayload {
                run_id: self.active.id,
                instance_id: self.instance_id.clone(),
                step_index: index as u32,
                step_name: step.name.clone(),
            }))
            .await;
    }
}

fn infrastructure_failure(message: String) -> JobOutcome {
    JobOutcome {
        status: JobStatus::Failed,
        failure: Some(FailureReason::Infrastructure { message }),
        steps: vec![],
    }
}

/// Worker task: execute one instance and record its outcome.
async fn run_instance(
    active: Arc<ActiveRun>,
    executor: Arc<JobExecutor>,
    instance: JobInstance,
) -> InstanceId {
    let outcome = match active.definition.job(&instance.job).cloned() {
        Some(job) => {
            let mut variables = active.definition.variables.clone();
            variables.extend(job.variables.clone());

            let ctx = JobContext {
                run_id: active.id,
                instance_id: instance.id.clone(),
                variables,
                matrix: instance.matrix.clone(),
            };
            let observer = ProgressObserver {
                active: active.clone(),
                instance_id: instance.id.clone(),
            };

            let task = tokio::spawn(async move { executor.execute(&job, &ctx, &observer).await });
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => infrastructure_failure(format!("job task aborted: {}", e)),
            }
        }
        None => infrastructure_failure(format!("unknown job '{}'", instance.job)),
    };

    active.finish(&instance.id, outcome).await;
    instance.id
}
