//! Core runner trait and types.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tollgate_core::Result;
use tollgate_core::pipeline::StepDefinition;
use tollgate_core::run::ExitSignal;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit: ExitSignal,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(&self) -> bool {
        self.exit == ExitSignal::Code(0)
    }
}

/// Context for step execution.
///
/// `step` has already been interpolated; `secrets` are exposed to the process
/// as environment variables and must not be logged.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub step: StepDefinition,
}

/// Trait for step execution.
///
/// `Ok` means the external work ran and reported an exit signal (success or
/// not). `Err` means the work could not be started at all.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;

    /// Check if this runner can handle the given step.
    fn can_handle(&self, step: &StepDefinition) -> bool;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound applied on top of each step's own `timeout_minutes`.
    pub timeout_seconds: Option<u64>,
}

impl RunnerConfig {
    /// Effective timeout for a step.
    pub fn timeout_for(&self, step: &StepDefinition) -> Duration {
        let step_secs = u64::from(step.timeout_minutes) * 60;
        let secs = match self.timeout_seconds {
            Some(cap) => step_secs.min(cap),
            None => step_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Some(3600), // 1 hour default
        }
    }
}
