//! Shell-based step execution on the host.

use crate::process::run_to_completion;
use crate::runner::{OutputLine, RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tollgate_core::Result;
use tollgate_core::pipeline::StepDefinition;
use tracing::info;

/// Shell runner for executing `run` steps on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let script = ctx.step.run.as_ref().ok_or_else(|| {
            tollgate_core::Error::Infrastructure(format!(
                "Step '{}' has no command to run",
                ctx.step.name
            ))
        })?;

        info!(
            step = %ctx.step.name,
            shell = %ctx.step.shell,
            workspace = %ctx.workspace.display(),
            "Executing shell command"
        );

        let mut command = Command::new(&ctx.step.shell);
        command
            .arg("-c")
            .arg(script)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .envs(&ctx.secrets);

        run_to_completion(command, self.config.timeout_for(&ctx.step), output_tx).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.run.is_some() && step.uses.is_none()
    }
}
