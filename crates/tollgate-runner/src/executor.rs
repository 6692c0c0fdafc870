//! Job execution shim.
//!
//! Runs one job instance's steps strictly in order and turns their results
//! into a terminal [`JobOutcome`]. The executor never retries and never
//! interprets what a step does; it only records success or failure.

use crate::runner::{OutputLine, OutputStream, StepContext, StepRunner};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tollgate_core::ids::{InstanceId, RunId};
use tollgate_core::interpolation::InterpolationContext;
use tollgate_core::pipeline::{JobDefinition, StepDefinition};
use tollgate_core::run::{ExitSignal, FailureReason, JobStatus};
use tollgate_secrets::SecretManager;
use tracing::{error, info, warn};

/// Per-instance inputs to the executor.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    /// Pipeline variables overlaid with job variables.
    pub variables: HashMap<String, String>,
    pub matrix: BTreeMap<String, String>,
}

/// Receives progress while an instance executes.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn step_started(&self, index: usize, step: &StepDefinition);
}

/// Observer that ignores progress.
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn step_started(&self, _index: usize, _step: &StepDefinition) {}
}

/// What happened to one step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    /// `None` when the step could not be started.
    pub exit: Option<ExitSignal>,
    pub duration_ms: u64,
}

/// Terminal result of executing one instance.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// `Succeeded` or `Failed`.
    pub status: JobStatus,
    /// First failure, if any.
    pub failure: Option<FailureReason>,
    pub steps: Vec<StepRecord>,
}

/// Executes job instances by dispatching steps to runners.
pub struct JobExecutor {
    runners: Vec<Arc<dyn StepRunner>>,
    secrets: Arc<SecretManager>,
    workspace: PathBuf,
}

impl JobExecutor {
    pub fn new(
        runners: Vec<Arc<dyn StepRunner>>,
        secrets: Arc<SecretManager>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runners,
            secrets,
            workspace: workspace.into(),
        }
    }

    fn runner_for(&self, step: &StepDefinition) -> Option<&Arc<dyn StepRunner>> {
        self.runners.iter().find(|r| r.can_handle(step))
    }

    /// Execute every step of `job` for one instance.
    pub async fn execute(
        &self,
        job: &JobDefinition,
        ctx: &JobContext,
        observer: &dyn StepObserver,
    ) -> JobOutcome {
        let mut records = Vec::with_capacity(job.steps.len());
        let mut failure: Option<FailureReason> = None;

        for (index, step) in job.steps.iter().enumerate() {
            observer.step_started(index, step).await;

            let secrets = match self.secrets.resolve_all(&step.secrets).await {
                Ok(secrets) => secrets,
                Err(e) => {
                    error!(instance = %ctx.instance_id, step = %step.name, error = %e, "Secret resolution failed");
                    records.push(StepRecord {
                        index,
                        name: step.name.clone(),
                        exit: None,
                        duration_ms: 0,
                    });
                    failure.get_or_insert(FailureReason::Infrastructure {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            let mut interp = InterpolationContext::new();
            interp.variables = ctx.variables.clone();
            interp.matrix = ctx.matrix.clone();
            interp.secrets = secrets.clone();

            let step_ctx = self.step_context(&job.name, step, ctx, &interp, secrets);

            let Some(runner) = self.runner_for(&step_ctx.step) else {
                let message = format!("No runner can execute step '{}'", step.name);
                error!(instance = %ctx.instance_id, step = %step.name, "{}", message);
                records.push(StepRecord {
                    index,
                    name: step.name.clone(),
                    exit: None,
                    duration_ms: 0,
                });
                failure.get_or_insert(FailureReason::Infrastructure { message });
                break;
            };

            info!(instance = %ctx.instance_id, step = %step.name, index, "Step started");

            let (tx, rx) = mpsc::channel(256);
            let (result, ()) = tokio::join!(
                runner.execute(&step_ctx, tx),
                forward_output(rx, &ctx.instance_id, &step.name, &interp)
            );

            match result {
                Ok(res) if res.success() => {
                    info!(instance = %ctx.instance_id, step = %step.name, duration_ms = res.duration_ms, "Step succeeded");
                    records.push(StepRecord {
                        index,
                        name: step.name.clone(),
                        exit: Some(res.exit),
                        duration_ms: res.duration_ms,
                    });
                }
                Ok(res) => {
                    warn!(instance = %ctx.instance_id, step = %step.name, exit = %res.exit, "Step failed");
                    records.push(StepRecord {
                        index,
                        name: step.name.clone(),
                        exit: Some(res.exit),
                        duration_ms: res.duration_ms,
                    });
                    failure.get_or_insert(FailureReason::StepFailed {
                        step: step.name.clone(),
                        index,
                        exit: res.exit,
                    });
                    if !job.continue_on_error {
                        break;
                    }
                }
                Err(e) => {
                    error!(instance = %ctx.instance_id, step = %step.name, error = %e, "Step could not be started");
                    records.push(StepRecord {
                        index,
                        name: step.name.clone(),
                        exit: None,
                        duration_ms: 0,
                    });
                    failure.get_or_insert(FailureReason::Infrastructure {
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        let status = if failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };

        JobOutcome {
            status,
            failure,
            steps: records,
        }
    }

    fn step_context(
        &self,
        job: &str,
        step: &StepDefinition,
        ctx: &JobContext,
        interp: &InterpolationContext,
        secrets: HashMap<String, String>,
    ) -> StepContext {
        let mut resolved = step.clone();
        resolved.run = step.run.as_deref().map(|r| interp.interpolate(r));
        resolved.with = step
            .with
            .iter()
            .map(|(k, v)| (k.clone(), interp.interpolate(v)))
            .collect();

        let mut env: HashMap<String, String> = ctx.variables.clone();
        env.extend(
            step.env
                .iter()
                .map(|(k, v)| (k.clone(), interp.interpolate(v))),
        );
        env.insert("TOLLGATE_RUN_ID".to_string(), ctx.run_id.to_string());
        env.insert("TOLLGATE_JOB".to_string(), job.to_string());
        env.insert("TOLLGATE_INSTANCE".to_string(), ctx.instance_id.to_string());

        let workspace = match &step.working_directory {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        };

        StepContext {
            workspace,
            env,
            secrets,
            step: resolved,
        }
    }
}

/// Log step output with secrets masked.
async fn forward_output(
    mut rx: mpsc::Receiver<OutputLine>,
    instance: &InstanceId,
    step: &str,
    interp: &InterpolationContext,
) {
    while let Some(line) = rx.recv().await {
        let content = interp.mask_secrets(&line.content);
        match line.stream {
            OutputStream::Stdout => info!(target: "tollgate::output", instance = %instance, step, "{}", content),
            OutputStream::Stderr => warn!(target: "tollgate::output", instance = %instance, step, "{}", content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StepResult;
    use crate::shell::ShellRunner;
    use std::sync::Mutex;
    use tollgate_core::Result;

    /// Runner that replays scripted exit signals and records commands.
    struct ScriptedRunner {
        exits: Mutex<Vec<Result<ExitSignal>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(exits: Vec<Result<ExitSignal>>) -> Self {
            Self {
                exits: Mutex::new(exits),
                seen: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn execute(
            &self,
            ctx: &StepContext,
            _output_tx: mpsc::Sender<OutputLine>,
        ) -> Result<StepResult> {
            self.seen
                .lock()
                .unwrap()
                .push(ctx.step.run.clone().unwrap_or_default());
            let exit = self.exits.lock().unwrap().remove(0)?;
            Ok(StepResult {
                exit,
                duration_ms: 1,
            })
        }

        fn can_handle(&self, _step: &StepDefinition) -> bool {
            true
        }
    }

    fn job(commands: &[&str]) -> JobDefinition {
        JobDefinition {
            name: "test".to_string(),
            display_name: None,
            needs: vec![],
            run_always: false,
            continue_on_error: false,
            variables: Default::default(),
            matrix: None,
            steps: commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| StepDefinition {
                    name: format!("step-{}", i),
                    run: Some(cmd.to_string()),
                    uses: None,
                    with: Default::default(),
                    env: Default::default(),
                    secrets: vec![],
                    shell: "sh".to_string(),
                    working_directory: None,
                    timeout_minutes: 1,
                })
                .collect(),
        }
    }

    fn context() -> JobContext {
        JobContext {
            run_id: RunId::new(),
            instance_id: InstanceId::new("test (3.9, latest)"),
            variables: HashMap::new(),
            matrix: BTreeMap::from([("deps".to_string(), "numpy==1.21".to_string())]),
        }
    }

    fn executor(runner: Arc<dyn StepRunner>) -> JobExecutor {
        JobExecutor::new(vec![runner], Arc::new(SecretManager::default()), std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Ok(ExitSignal::Code(0)),
            Ok(ExitSignal::Code(1)),
            Ok(ExitSignal::Code(0)),
        ]));
        let outcome = executor(runner.clone())
            .execute(&job(&["a", "b", "c"]), &context(), &NoopObserver)
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(
            outcome.failure,
            Some(FailureReason::StepFailed {
                step: "step-1".to_string(),
                index: 1,
                exit: ExitSignal::Code(1),
            })
        );
        assert_eq!(*runner.seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_remaining_steps_but_fails() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Ok(ExitSignal::Timeout),
            Ok(ExitSignal::Code(0)),
        ]));
        let mut job = job(&["flaky", "report"]);
        job.continue_on_error = true;

        let outcome = executor(runner).execute(&job, &context(), &NoopObserver).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.steps.len(), 2);
        assert!(matches!(
            outcome.failure,
            Some(FailureReason::StepFailed {
                exit: ExitSignal::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_runner_error_is_infrastructure_failure() {
        let runner = Arc::new(ScriptedRunner::new(vec![Err(
            tollgate_core::Error::Infrastructure("no shell".to_string()),
        )]));
        let outcome = executor(runner)
            .execute(&job(&["a", "b"]), &context(), &NoopObserver)
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.failure.as_ref().map(|f| f.code()), Some("infrastructure"));
    }

    #[tokio::test]
    async fn test_matrix_value_passed_verbatim() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(ExitSignal::Code(0))]));
        let outcome = executor(runner.clone())
            .execute(
                &job(&["pip install ${{ matrix.deps }}"]),
                &context(),
                &NoopObserver,
            )
            .await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(*runner.seen.lock().unwrap(), vec!["pip install numpy==1.21"]);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_running() {
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let mut job = job(&["twine upload dist/*"]);
        job.steps[0].secrets.push(tollgate_core::pipeline::SecretReference {
            name: "TWINE_PASSWORD".to_string(),
            key: Some("TOLLGATE_TEST_UNSET_PYPI_PASSWORD".to_string()),
            provider: Some("missing".to_string()),
            required: true,
        });

        let outcome = executor(runner.clone())
            .execute(&job, &context(), &NoopObserver)
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure.as_ref().map(|f| f.code()), Some("infrastructure"));
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shell_steps_end_to_end() {
        let runner: Arc<dyn StepRunner> = Arc::new(ShellRunner::default());
        let outcome = executor(runner)
            .execute(&job(&["true", "exit 7", "true"]), &context(), &NoopObserver)
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.steps[1].exit, Some(ExitSignal::Code(7)));
        assert_eq!(outcome.steps.len(), 2);
    }
}
