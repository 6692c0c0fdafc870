//! Run and execution types.
//!
//! A [`PipelineRun`] holds everything needed to reconstruct scheduling
//! decisions: the status recorded per [`JobInstance`] is the only state the
//! gate consults, so a run reloaded from storage can be resumed.

use crate::ids::{InstanceId, RunId};
use crate::pipeline::{PipelineDefinition, ReleaseAction, TriggerType};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub trigger: TriggerInfo,
    /// Definition the run was prepared from; resuming needs nothing else.
    pub definition: PipelineDefinition,
    /// Instances in expansion order: job declaration order, then matrix order.
    pub jobs: Vec<JobInstance>,
    /// Effective fail-fast value per matrix group (job name).
    #[serde(default)]
    pub fail_fast: BTreeMap<String, bool>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn instance(&self, id: &InstanceId) -> Option<&JobInstance> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn instance_mut(&mut self, id: &InstanceId) -> Option<&mut JobInstance> {
        self.jobs.iter_mut().find(|j| &j.id == id)
    }

    /// Instances expanded from one job template.
    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a JobInstance> {
        self.jobs.iter().filter(move |j| j.job == job)
    }

    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Aggregate status once every instance is terminal.
    pub fn final_status(&self) -> RunStatus {
        if self.cancel_requested {
            RunStatus::Cancelled
        } else if self.jobs.iter().any(|j| j.status == JobStatus::Failed) {
            RunStatus::Failed
        } else if self.jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    /// Branch for pushes.
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub release_action: Option<ReleaseAction>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: InstanceId,
    /// Name of the job template this instance was expanded from.
    pub job: String,
    #[serde(default)]
    pub matrix: BTreeMap<String, String>,
    pub status: JobStatus,
    /// Index of the step currently or last executed.
    #[serde(default)]
    pub step_cursor: Option<usize>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn new(id: InstanceId, job: impl Into<String>, matrix: BTreeMap<String, String>) -> Self {
        Self {
            id,
            job: job.into(),
            matrix,
            status: JobStatus::Pending,
            step_cursor: None,
            failure: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why an instance ended `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// An external action reported failure.
    StepFailed {
        step: String,
        index: usize,
        exit: ExitSignal,
    },
    /// The execution environment could not run the work.
    Infrastructure { message: String },
    /// The host stopped while the instance was running.
    Interrupted,
}

impl FailureReason {
    /// Short machine-readable code for status displays.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::StepFailed { .. } => "step_failed",
            FailureReason::Infrastructure { .. } => "infrastructure",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitSignal {
    Code(i32),
    Timeout,
    Terminated,
}

impl std::fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitSignal::Code(code) => write!(f, "exit code {}", code),
            ExitSignal::Timeout => f.write_str("timeout"),
            ExitSignal::Terminated => f.write_str("terminated by signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(statuses: &[JobStatus]) -> PipelineRun {
        PipelineRun {
            id: RunId::new(),
            pipeline_name: "package".to_string(),
            status: RunStatus::Running,
            trigger: TriggerInfo {
                trigger_type: TriggerType::Manual,
                git_ref: None,
                release_action: None,
                triggered_by: None,
            },
            definition: PipelineDefinition::from_yaml(
                "name: package\njobs:\n  - name: job\n    steps:\n      - name: run\n        run: 'true'\n",
            )
            .unwrap(),
            jobs: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    let mut job =
                        JobInstance::new(InstanceId::new(format!("job-{}", i)), "job", BTreeMap::new());
                    job.status = *status;
                    job
                })
                .collect(),
            fail_fast: BTreeMap::new(),
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_final_status_failed_wins_over_cancelled() {
        let run = run_with(&[JobStatus::Succeeded, JobStatus::Failed, JobStatus::Cancelled]);
        assert_eq!(run.final_status(), RunStatus::Failed);
    }

    #[test]
    fn test_final_status_skipped_counts_as_success() {
        let run = run_with(&[JobStatus::Succeeded, JobStatus::Skipped]);
        assert_eq!(run.final_status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_final_status_external_cancel() {
        let mut run = run_with(&[JobStatus::Failed, JobStatus::Cancelled]);
        run.cancel_requested = true;
        assert_eq!(run.final_status(), RunStatus::Cancelled);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Skipped.is_success());
    }

    #[test]
    fn test_failure_reason_serialization() {
        let reason = FailureReason::StepFailed {
            step: "pytest".to_string(),
            index: 3,
            exit: ExitSignal::Code(2),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "step_failed");
        assert_eq!(json["exit"]["kind"], "code");
        assert_eq!(json["exit"]["value"], 2);
    }
}
