//! Run lifecycle events.

use crate::ids::{InstanceId, RunId};
use crate::pipeline::TriggerType;
use crate::run::{FailureReason, JobStatus, RunStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),

    // Matrix
    MatrixExpanded(MatrixExpandedPayload),

    // Job lifecycle
    JobStarted(JobStartedPayload),
    StepStarted(StepStartedPayload),
    JobCompleted(JobCompletedPayload),
}

impl Event {
    /// Returns the subject this event is published under.
    pub fn subject(&self) -> String {
        match self {
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::MatrixExpanded(p) => format!("run.{}.matrix.{}.expanded", p.run_id, p.job),
            Event::JobStarted(p) => format!("run.{}.job.{}.started", p.run_id, p.instance_id),
            Event::StepStarted(p) => format!("run.{}.job.{}.step", p.run_id, p.instance_id),
            Event::JobCompleted(p) => format!("run.{}.job.{}.completed", p.run_id, p.instance_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::MatrixExpanded(p) => p.run_id,
            Event::JobStarted(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::JobCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub trigger: TriggerType,
    pub job_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub jobs_skipped: u32,
    pub jobs_cancelled: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixExpandedPayload {
    pub run_id: RunId,
    pub job: String,
    pub instances: Vec<InstanceId>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub step_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub step_index: u32,
    pub step_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub status: JobStatus,
    pub failure: Option<FailureReason>,
    pub completed_at: DateTime<Utc>,
}
