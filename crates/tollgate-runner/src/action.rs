//! Named external actions (`uses:` steps).
//!
//! An action reference `owner/name@ref` resolves to an executable under the
//! actions directory: `<dir>/owner/name` or `<dir>/owner/name/run`. Inputs
//! from `with:` are passed verbatim as `INPUT_<NAME>` environment variables;
//! the runner never looks inside them.

use crate::process::run_to_completion;
use crate::runner::{OutputLine, RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::mpsc;
use tollgate_core::Result;
use tollgate_core::pipeline::StepDefinition;
use tracing::info;

/// Runner for `uses:` steps.
pub struct ActionRunner {
    actions_dir: PathBuf,
    config: RunnerConfig,
}

impl ActionRunner {
    pub fn new(actions_dir: impl Into<PathBuf>, config: RunnerConfig) -> Self {
        Self {
            actions_dir: actions_dir.into(),
            config,
        }
    }

    /// Locate the executable for an action reference.
    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let (name, _) = split_reference(reference);
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return None;
        }

        let base = self.actions_dir.join(name);
        [base.join("run"), base]
            .into_iter()
            .find(|candidate| candidate.is_file())
    }
}

/// Split `owner/name@ref` into name and optional ref.
fn split_reference(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once('@') {
        Some((name, version)) => (name, Some(version)),
        None => (reference, None),
    }
}

/// `python-version` -> `INPUT_PYTHON_VERSION`.
fn input_env_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("INPUT_{}", normalized)
}

fn input_env(with: &std::collections::BTreeMap<String, String>) -> HashMap<String, String> {
    with.iter()
        .map(|(k, v)| (input_env_name(k), v.clone()))
        .collect()
}

#[async_trait]
impl StepRunner for ActionRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let reference = ctx.step.uses.as_deref().ok_or_else(|| {
            tollgate_core::Error::Infrastructure(format!(
                "Step '{}' does not reference an action",
                ctx.step.name
            ))
        })?;

        let executable = self.resolve(reference).ok_or_else(|| {
            tollgate_core::Error::Infrastructure(format!(
                "Action '{}' not found under {}",
                reference,
                self.actions_dir.display()
            ))
        })?;

        info!(
            step = %ctx.step.name,
            action = %reference,
            executable = %executable.display(),
            "Executing action"
        );

        let (_, version) = split_reference(reference);
        let mut command = Command::new(&executable);
        command
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .envs(input_env(&ctx.step.with))
            .env("TOLLGATE_ACTION_REF", version.unwrap_or(""))
            .envs(&ctx.secrets);

        run_to_completion(command, self.config.timeout_for(&ctx.step), output_tx).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.uses.is_some() && step.run.is_none()
    }
}
