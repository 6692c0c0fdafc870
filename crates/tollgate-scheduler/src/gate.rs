//! Dependency gate.
//!
//! Decides, from a status snapshot alone, whether a pending instance may
//! start. A prerequisite is a job template; the gate looks at every instance
//! expanded from it.

use crate::status::StatusSnapshot;
use std::collections::HashMap;
use tollgate_core::pipeline::PipelineDefinition;
use tollgate_core::run::{JobInstance, JobStatus};

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Every prerequisite instance is terminal and acceptable.
    Ready,
    /// Some prerequisite instance has not finished yet.
    Blocked,
    /// A prerequisite ended badly; the instance can never run.
    NeverEligible,
}

#[derive(Debug, Clone)]
struct GateRule {
    needs: Vec<String>,
    run_always: bool,
}

/// Gate rules for every job of one definition.
#[derive(Debug, Clone)]
pub struct DependencyGate {
    rules: HashMap<String, GateRule>,
}

impl DependencyGate {
    pub fn new(definition: &PipelineDefinition) -> Self {
        let rules = definition
            .jobs
            .iter()
            .map(|job| {
                (
                    job.name.clone(),
                    GateRule {
                        needs: job.needs.clone(),
                        run_always: job.run_always,
                    },
                )
            })
            .collect();
        Self { rules }
    }

    pub fn can_start(&self, instance: &JobInstance, snapshot: &StatusSnapshot) -> GateDecision {
        let Some(rule) = self.rules.get(&instance.job) else {
            return GateDecision::Ready;
        };
        if rule.needs.is_empty() {
            return GateDecision::Ready;
        }

        let prerequisites: Vec<JobStatus> = rule
            .needs
            .iter()
            .flat_map(|job| snapshot.job_statuses(job).iter().copied())
            .collect();

        if !rule.run_always
            && prerequisites
                .iter()
                .any(|s| s.is_terminal() && !s.is_success())
        {
            return GateDecision::NeverEligible;
        }

        if prerequisites.iter().any(|s| !s.is_terminal()) {
            return GateDecision::Blocked;
        }

        GateDecision::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tollgate_core::ids::{InstanceId, RunId};
    use tollgate_core::pipeline::TriggerType;
    use tollgate_core::run::{PipelineRun, RunStatus, TriggerInfo};

    const DEFINITION: &str = r#"
name: package
jobs:
  - name: test
    steps: [{ name: run, run: pytest }]
  - name: format
    steps: [{ name: run, run: black --check . }]
  - name: publish
    needs: [test, format]
    steps: [{ name: run, run: twine upload dist/* }]
  - name: report
    needs: [test]
    run_always: true
    steps: [{ name: run, run: coverage report }]
"#;

    fn setup(test: &[JobStatus], format: JobStatus) -> (DependencyGate, PipelineRun) {
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        let mut jobs: Vec<JobInstance> = test
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut instance = JobInstance::new(
                    InstanceId::new(format!("test ({})", i)),
                    "test",
                    BTreeMap::new(),
                );
                instance.status = *status;
                instance
            })
            .collect();
        let mut fmt = JobInstance::new(InstanceId::new("format"), "format", BTreeMap::new());
        fmt.status = format;
        jobs.push(fmt);
        jobs.push(JobInstance::new(InstanceId::new("publish"), "publish", BTreeMap::new()));
        jobs.push(JobInstance::new(InstanceId::new("report"), "report", BTreeMap::new()));

        let run = PipelineRun {
            id: RunId::new(),
            pipeline_name: definition.name.clone(),
            status: RunStatus::Running,
            trigger: TriggerInfo {
                trigger_type: TriggerType::Manual,
                git_ref: None,
                release_action: None,
                triggered_by: None,
            },
            definition: definition.clone(),
            jobs,
            fail_fast: BTreeMap::new(),
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        (DependencyGate::new(&definition), run)
    }

    fn decide(gate: &DependencyGate, run: &PipelineRun, id: &str) -> GateDecision {
        let snapshot = StatusSnapshot::from_run(run);
        gate.can_start(run.instance(&InstanceId::new(id)).unwrap(), &snapshot)
    }

    #[test]
    fn test_no_prerequisites_is_ready() {
        let (gate, run) = setup(&[JobStatus::Pending], JobStatus::Pending);
        assert_eq!(decide(&gate, &run, "format"), GateDecision::Ready);
    }

    #[test]
    fn test_blocked_until_every_instance_terminal() {
        let (gate, run) = setup(
            &[JobStatus::Succeeded, JobStatus::Running, JobStatus::Succeeded],
            JobStatus::Succeeded,
        );
        assert_eq!(decide(&gate, &run, "publish"), GateDecision::Blocked);
        assert_eq!(decide(&gate, &run, "report"), GateDecision::Blocked);
    }

    #[test]
    fn test_ready_when_all_succeeded() {
        let (gate, run) = setup(&[JobStatus::Succeeded; 6], JobStatus::Succeeded);
        assert_eq!(decide(&gate, &run, "publish"), GateDecision::Ready);
    }

    #[test]
    fn test_one_failed_instance_makes_dependent_never_eligible() {
        let (gate, run) = setup(
            &[JobStatus::Succeeded, JobStatus::Failed, JobStatus::Pending],
            JobStatus::Succeeded,
        );
        assert_eq!(decide(&gate, &run, "publish"), GateDecision::NeverEligible);
    }

    #[test]
    fn test_skipped_and_cancelled_prerequisites_propagate() {
        let (gate, run) = setup(&[JobStatus::Succeeded], JobStatus::Skipped);
        assert_eq!(decide(&gate, &run, "publish"), GateDecision::NeverEligible);

        let (gate, run) = setup(&[JobStatus::Cancelled], JobStatus::Succeeded);
        assert_eq!(decide(&gate, &run, "publish"), GateDecision::NeverEligible);
    }

    #[test]
    fn test_run_always_waits_then_runs_despite_failure() {
        let (gate, run) = setup(&[JobStatus::Failed, JobStatus::Running], JobStatus::Pending);
        assert_eq!(decide(&gate, &run, "report"), GateDecision::Blocked);

        let (gate, run) = setup(&[JobStatus::Failed, JobStatus::Cancelled], JobStatus::Pending);
        assert_eq!(decide(&gate, &run, "report"), GateDecision::Ready);
    }
}
