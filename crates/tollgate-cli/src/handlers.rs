//! Command handlers.

use crate::commands::{EventKind, TriggerArgs};
use crate::config::CliConfig;
use anyhow::{Context, bail};
use console::style;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tollgate_core::events::Event;
use tollgate_core::ids::RunId;
use tollgate_core::pipeline::PipelineDefinition;
use tollgate_core::ports::{EventBus, EventStream, RunRepository};
use tollgate_core::run::{JobInstance, JobStatus, PipelineRun};
use tollgate_runner::{ActionRunner, JobExecutor, RunnerConfig, ShellRunner, StepRunner};
use tollgate_scheduler::{
    BroadcastEventBus, CancelHandle, JsonRunStore, Orchestrator, OrchestratorConfig, RunRequest,
    TriggerEvent, TriggerMatcher,
};
use tollgate_secrets::{EnvProvider, FileProvider, SecretManager};
use tracing::{debug, warn};

const TEMPLATE: &str = include_str!("../templates/python-package.yaml");

const PRINTER_DRAIN: std::time::Duration = std::time::Duration::from_secs(5);

/// Write the bundled pipeline.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, TEMPLATE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let definition = load_definition(path)?;
    let run = planner()
        .plan(&RunRequest::manual(definition, None))
        .context("Pipeline is invalid")?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        run.pipeline_name
    );
    println!("  Triggers: {}", run.definition.triggers.len());
    println!("  Jobs: {} ({} instances)", run.definition.jobs.len(), run.jobs.len());
    for job in &run.definition.jobs {
        let instances = run.instances_of(&job.name).count();
        let needs = if job.needs.is_empty() {
            String::new()
        } else {
            format!(" needs [{}]", job.needs.join(", "))
        };
        println!(
            "    - {} ({} steps, {} instances){}",
            job.name,
            job.steps.len(),
            instances,
            style(needs).dim()
        );
    }

    Ok(())
}

/// Show the runs an event would start.
pub fn plan(path: &Path, trigger: &TriggerArgs) -> anyhow::Result<()> {
    let definition = load_definition(path)?;
    let event = trigger_event(trigger)?;
    let requests = TriggerMatcher::new().evaluate(std::slice::from_ref(&definition), &event);

    if requests.is_empty() {
        println!("{} No trigger of \"{}\" matches", style("!").yellow(), definition.name);
        return Ok(());
    }

    let planner = planner();
    for request in &requests {
        let run = planner.plan(request)?;
        let trigger = request
            .trigger_index
            .map(|idx| format!("trigger #{}", idx + 1))
            .unwrap_or_else(|| "manual".to_string());
        println!(
            "{} {} via {}",
            style("▶").cyan(),
            style(&run.pipeline_name).bold(),
            trigger
        );
        for job in &run.definition.jobs {
            let fail_fast = run.fail_fast.get(&job.name).copied().unwrap_or(true);
            let limit = job
                .matrix
                .as_ref()
                .and_then(|m| m.max_parallel)
                .map(|n| format!(", max_parallel {}", n))
                .unwrap_or_default();
            println!(
                "  {} {}",
                style(&job.name).bold(),
                style(format!("(fail_fast {}{})", fail_fast, limit)).dim()
            );
            for instance in run.instances_of(&job.name) {
                println!("    - {}", instance.id);
            }
        }
    }

    Ok(())
}

/// Run every pipeline the event starts, one after another.
pub async fn run(config: &CliConfig, path: &Path, trigger: &TriggerArgs) -> anyhow::Result<()> {
    let definition = load_definition(path)?;
    let event = trigger_event(trigger)?;
    let requests = TriggerMatcher::new().evaluate(std::slice::from_ref(&definition), &event);

    if requests.is_empty() {
        println!("{} No trigger of \"{}\" matches", style("!").yellow(), definition.name);
        return Ok(());
    }

    let engine = Engine::build(config).await?;
    let mut unsuccessful = Vec::new();

    for request in &requests {
        let run = engine.orchestrator.prepare(request).await?;
        println!(
            "{} Run {} of {} ({} instances)",
            style("▶").cyan(),
            style(run.id).bold(),
            run.pipeline_name,
            run.jobs.len()
        );

        let finished = engine.drive(run, false).await?;
        print_summary(&finished);
        if !finished.status.is_success() {
            unsuccessful.push(finished.id);
        }
    }

    if !unsuccessful.is_empty() {
        bail!("{} run(s) did not succeed", unsuccessful.len());
    }
    Ok(())
}

/// Show one stored run, or list recent runs.
pub async fn status(config: &CliConfig, run_id: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let store = JsonRunStore::new(&config.state_dir);

    let Some(run_id) = run_id else {
        let runs = store.list(limit).await?;
        if runs.is_empty() {
            println!("No runs in {}", store.root_dir().display());
            return Ok(());
        }
        for run in runs {
            println!(
                "{}  {} {}  {}",
                run.id,
                style_run_status(&run),
                run.pipeline_name,
                style(run.queued_at.format("%Y-%m-%d %H:%M:%S")).dim()
            );
        }
        return Ok(());
    };

    let run = load_run(&store, run_id).await?;
    println!(
        "{} {} ({})",
        style(run.id).bold(),
        run.pipeline_name,
        style_run_status(&run)
    );
    if let Some(ms) = run.duration_ms() {
        println!("  Duration: {:.1}s", ms as f64 / 1000.0);
    }
    for instance in &run.jobs {
        print_instance(instance);
    }
    Ok(())
}

/// Resume a run left `running` by a stopped host.
pub async fn resume(config: &CliConfig, run_id: &str) -> anyhow::Result<()> {
    let engine = Engine::build(config).await?;
    let run = load_run(engine.runs.as_ref(), run_id).await?;

    if run.status.is_terminal() {
        println!("{} Run {} already {}", style("!").yellow(), run.id, run.status);
        return Ok(());
    }

    println!("{} Resuming {} of {}", style("▶").cyan(), style(run.id).bold(), run.pipeline_name);
    let finished = engine.drive(run, true).await?;
    print_summary(&finished);

    if !finished.status.is_success() {
        bail!("Run {} {}", finished.id, finished.status);
    }
    Ok(())
}

/// Print the pipeline JSON schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("{}", style("Configuration").bold());
    println!("  State dir: {}", config.state_dir.display());
    println!("  Max workers: {}", config.max_workers);
    println!("  Step timeout: {}m", config.step_timeout_minutes);
    println!("  Actions dir: {}", config.actions_dir.display());
    println!(
        "  Secrets file: {}",
        config
            .secrets_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!(
        "  Secret env prefix: {}",
        config.secret_env_prefix.as_deref().unwrap_or("(none)")
    );
    println!("  Log format: {:?}", config.log_format);
    println!();
    println!("  Config file: {}", CliConfig::config_path()?.display());
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

/// Orchestrator wired to local adapters.
struct Engine {
    orchestrator: Orchestrator,
    runs: Arc<JsonRunStore>,
    events: Arc<BroadcastEventBus>,
}

impl Engine {
    async fn build(config: &CliConfig) -> anyhow::Result<Self> {
        let mut secrets = SecretManager::default();
        secrets.register_provider(Arc::new(EnvProvider::new(config.secret_env_prefix.clone())));
        if let Some(path) = &config.secrets_file {
            let provider = FileProvider::load_from_file(path)
                .await
                .with_context(|| format!("loading secrets from {}", path.display()))?;
            secrets.register_provider(Arc::new(provider));
        }

        let runner_config = RunnerConfig {
            timeout_seconds: Some(config.step_timeout_minutes * 60),
        };
        let runners: Vec<Arc<dyn StepRunner>> = vec![
            Arc::new(ShellRunner::new(runner_config.clone())),
            Arc::new(ActionRunner::new(&config.actions_dir, runner_config)),
        ];
        let workspace = std::env::current_dir()?;
        let executor = Arc::new(JobExecutor::new(runners, Arc::new(secrets), workspace));

        let runs = Arc::new(JsonRunStore::new(&config.state_dir));
        debug!(
            state_dir = %config.state_dir.display(),
            max_workers = config.max_workers,
            "Engine ready"
        );
        let events = Arc::new(BroadcastEventBus::default());
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                max_workers: config.max_workers.max(1),
            },
            executor,
            runs.clone(),
            events.clone(),
        );

        Ok(Self {
            orchestrator,
            runs,
            events,
        })
    }

    /// Execute or resume a run, printing progress. Ctrl-C cancels pending work.
    async fn drive(&self, run: PipelineRun, resume: bool) -> anyhow::Result<PipelineRun> {
        let printer = self.print_events(run.id).await?;

        let cancel = CancelHandle::new();
        let on_interrupt = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{} Cancelling: pending jobs will not start, running jobs finish",
                    style("!").yellow()
                );
                on_interrupt.cancel();
            }
        });

        let result = if resume {
            self.orchestrator.resume_with(run, cancel).await
        } else {
            self.orchestrator.execute_with(run, cancel).await
        };

        interrupt.abort();
        match result {
            Ok(run) => {
                finish_printer(printer).await;
                Ok(run)
            }
            Err(e) => {
                printer.abort();
                Err(e.into())
            }
        }
    }

    async fn print_events(&self, run_id: RunId) -> anyhow::Result<JoinHandle<()>> {
        let stream = self.events.subscribe().await?;
        Ok(tokio::spawn(follow_run(stream, run_id, print_event)))
    }
}

/// Pass one run's events to `on_event` until its `RunCompleted` arrives.
async fn follow_run<F>(mut stream: EventStream, run_id: RunId, mut on_event: F)
where
    F: FnMut(&Event),
{
    while let Some(event) = stream.next().await {
        if event.run_id() != run_id {
            continue;
        }
        on_event(&event);
        if matches!(event, Event::RunCompleted(_)) {
            break;
        }
    }
}

/// Let the printer catch up with events already published for a finished run.
async fn finish_printer(mut printer: JoinHandle<()>) {
    match tokio::time::timeout(PRINTER_DRAIN, &mut printer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Event printer failed"),
        Err(_) => {
            debug!("Event printer did not see the run complete");
            printer.abort();
        }
    }
}

/// Orchestrator used only for planning; nothing is executed or stored.
fn planner() -> Orchestrator {
    let executor = JobExecutor::new(Vec::new(), Arc::new(SecretManager::default()), ".");
    Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(executor),
        Arc::new(tollgate_scheduler::MemoryRunStore::new()),
        Arc::new(BroadcastEventBus::default()),
    )
}

fn load_definition(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    PipelineDefinition::from_yaml(&content).with_context(|| format!("parsing {}", path.display()))
}

async fn load_run(store: &dyn RunRepository, run_id: &str) -> anyhow::Result<PipelineRun> {
    let id: RunId = run_id
        .parse()
        .with_context(|| format!("Invalid run id: {}", run_id))?;
    store
        .get(id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))
}

fn trigger_event(args: &TriggerArgs) -> anyhow::Result<TriggerEvent> {
    Ok(match args.event {
        EventKind::Push => TriggerEvent::Push {
            branch: args
                .branch
                .clone()
                .context("--branch is required for push events")?,
        },
        EventKind::Release => TriggerEvent::Release {
            action: args.action.into(),
        },
        EventKind::Manual => TriggerEvent::Manual {
            actor: args.actor.clone(),
        },
    })
}

fn print_event(event: &Event) {
    match event {
        Event::JobStarted(p) => {
            println!("  {} {}", style("▶").cyan(), p.instance_id);
        }
        Event::StepStarted(p) => {
            println!(
                "    {} {}",
                style(format!("[{}]", p.step_index + 1)).dim(),
                p.step_name
            );
        }
        Event::JobCompleted(p) => {
            let marker = status_marker(p.status);
            match &p.failure {
                Some(failure) => println!(
                    "  {} {} {}",
                    marker,
                    p.instance_id,
                    style(format!("({})", failure.code())).dim()
                ),
                None => println!("  {} {} {}", marker, p.instance_id, style(p.status).dim()),
            }
        }
        Event::RunStarted(_) | Event::MatrixExpanded(_) | Event::RunCompleted(_) => {}
    }
}

fn print_summary(run: &PipelineRun) {
    let count = |status: JobStatus| run.jobs.iter().filter(|j| j.status == status).count();
    let duration = run
        .duration_ms()
        .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!(
        "{} Run {} {}{}: {} succeeded, {} failed, {} skipped, {} cancelled",
        if run.status.is_success() {
            style("✓").green()
        } else {
            style("✗").red()
        },
        run.id,
        style_run_status(run),
        duration,
        count(JobStatus::Succeeded),
        count(JobStatus::Failed),
        count(JobStatus::Skipped),
        count(JobStatus::Cancelled),
    );
}

fn print_instance(instance: &JobInstance) {
    let detail = match (&instance.failure, instance.step_cursor) {
        (Some(failure), _) => failure.code().to_string(),
        (None, Some(step)) if instance.status == JobStatus::Running => format!("step {}", step + 1),
        _ => String::new(),
    };
    println!(
        "  {} {:<28} {:<10} {}",
        status_marker(instance.status),
        instance.id.as_str(),
        instance.status.to_string(),
        style(detail).dim()
    );
}

fn status_marker(status: JobStatus) -> console::StyledObject<&'static str> {
    match status {
        JobStatus::Succeeded => style("✓").green(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Skipped => style("-").dim(),
        JobStatus::Cancelled => style("○").yellow(),
        JobStatus::Running => style("▶").cyan(),
        JobStatus::Pending => style("·").dim(),
    }
}

fn style_run_status(run: &PipelineRun) -> console::StyledObject<String> {
    let text = run.status.to_string();
    if run.status.is_success() {
        style(text).green()
    } else if run.status.is_terminal() {
        style(text).red()
    } else {
        style(text).yellow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ReleaseArg;

    fn trigger(event: EventKind, branch: Option<&str>) -> TriggerArgs {
        TriggerArgs {
            event,
            branch: branch.map(str::to_string),
            action: ReleaseArg::Created,
            actor: None,
        }
    }

    #[test]
    fn test_template_plans_eight_instances() {
        let definition = PipelineDefinition::from_yaml(TEMPLATE).unwrap();
        let run = planner()
            .plan(&RunRequest::manual(definition, Some("dev".to_string())))
            .unwrap();

        assert_eq!(run.jobs.len(), 8);
        assert_eq!(run.jobs[0].id.as_str(), "test (3.8, latest)");
        assert_eq!(run.jobs[7].id.as_str(), "publish");
    }

    #[test]
    fn test_template_push_to_master_disables_fail_fast() {
        let definition = PipelineDefinition::from_yaml(TEMPLATE).unwrap();
        let event = trigger_event(&trigger(EventKind::Push, Some("master"))).unwrap();
        let requests = TriggerMatcher::new().evaluate(std::slice::from_ref(&definition), &event);
        assert_eq!(requests.len(), 1);

        let run = planner().plan(&requests[0]).unwrap();
        assert_eq!(run.fail_fast.get("test"), Some(&false));

        let other = trigger_event(&trigger(EventKind::Push, Some("feature/x"))).unwrap();
        assert!(
            TriggerMatcher::new()
                .evaluate(std::slice::from_ref(&definition), &other)
                .is_empty()
        );
    }

    #[test]
    fn test_push_requires_branch() {
        assert!(trigger_event(&trigger(EventKind::Push, None)).is_err());
        assert!(matches!(
            trigger_event(&trigger(EventKind::Release, None)).unwrap(),
            TriggerEvent::Release { .. }
        ));
    }

    #[test]
    fn test_init_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.yaml");
        std::fs::write(&path, "name: mine\njobs: []\n").unwrap();

        init(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: mine\njobs: []\n");

        init(&path, true).unwrap();
        validate(&path).unwrap();
    }

    fn step_started(run_id: RunId, step_name: &str) -> Event {
        Event::StepStarted(tollgate_core::events::StepStartedPayload {
            run_id,
            instance_id: tollgate_core::InstanceId::new("test"),
            step_index: 0,
            step_name: step_name.to_string(),
        })
    }

    fn run_completed(run_id: RunId) -> Event {
        Event::RunCompleted(tollgate_core::events::RunCompletedPayload {
            run_id,
            pipeline_name: "python-package".to_string(),
            status: tollgate_core::run::RunStatus::Succeeded,
            duration_ms: 10,
            jobs_succeeded: 1,
            jobs_failed: 0,
            jobs_skipped: 0,
            jobs_cancelled: 0,
            completed_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_follow_run_stops_after_its_completion() {
        let bus = BroadcastEventBus::default();
        let stream = bus.subscribe().await.unwrap();
        let mine = RunId::new();
        let other = RunId::new();

        for event in [
            step_started(mine, "checkout"),
            step_started(other, "lint"),
            step_started(mine, "pytest"),
            run_completed(mine),
            step_started(mine, "late"),
        ] {
            bus.publish(event).await.unwrap();
        }

        let mut seen = Vec::new();
        let follow = follow_run(stream, mine, |event| seen.push(event.clone()));
        tokio::time::timeout(std::time::Duration::from_secs(5), follow)
            .await
            .unwrap();

        let names: Vec<_> = seen
            .iter()
            .filter_map(|event| match event {
                Event::StepStarted(p) => Some(p.step_name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["checkout", "pytest"]);
        assert!(matches!(seen.last(), Some(Event::RunCompleted(_))));
    }

    #[tokio::test]
    async fn test_status_of_unknown_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig {
            state_dir: dir.path().to_path_buf(),
            ..CliConfig::default()
        };

        assert!(status(&config, None, 10).await.is_ok());
        assert!(status(&config, Some("not-a-run"), 10).await.is_err());
        let missing = RunId::new().to_string();
        assert!(status(&config, Some(&missing), 10).await.is_err());
    }
}
