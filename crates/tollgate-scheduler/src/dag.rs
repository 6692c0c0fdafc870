//! DAG resolution for job prerequisites.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use thiserror::Error;
use tollgate_core::pipeline::PipelineDefinition;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in job prerequisites involving '{0}'")]
    CycleDetected(String),
    #[error("Job '{job}' needs unknown job '{prerequisite}'")]
    UnknownDependency { job: String, prerequisite: String },
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("Empty pipeline")]
    EmptyPipeline,
}

impl From<DagError> for tollgate_core::Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected(job) => tollgate_core::Error::DependencyCycle(job),
            DagError::UnknownDependency { job, prerequisite } => {
                tollgate_core::Error::UnknownPrerequisite { job, prerequisite }
            }
            other => tollgate_core::Error::Configuration(other.to_string()),
        }
    }
}

/// Directed acyclic graph of job templates; edges point from a prerequisite
/// to the job that needs it.
#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<String, ()>,
}

impl PipelineDag {
    /// Jobs in an order where every prerequisite precedes its dependents.
    pub fn topological_order(&self) -> Result<Vec<&str>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx).map(String::as_str))
                    .collect()
            })
            .map_err(|cycle| {
                DagError::CycleDetected(
                    self.graph
                        .node_weight(cycle.node_id())
                        .cloned()
                        .unwrap_or_default(),
                )
            })
    }
}

/// Builder for constructing pipeline DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a pipeline definition.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<PipelineDag, DagError> {
        if pipeline.jobs.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for job in &pipeline.jobs {
            let idx = graph.add_node(job.name.clone());
            if name_to_index.insert(job.name.clone(), idx).is_some() {
                return Err(DagError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &pipeline.jobs {
            let job_idx = name_to_index[&job.name];
            for prerequisite in &job.needs {
                let dep_idx =
                    name_to_index
                        .get(prerequisite)
                        .ok_or_else(|| DagError::UnknownDependency {
                            job: job.name.clone(),
                            prerequisite: prerequisite.clone(),
                        })?;
                graph.add_edge(*dep_idx, job_idx, ());
            }
        }

        let dag = PipelineDag { graph };

        // Verify no cycles
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::pipeline::{JobDefinition, StepDefinition};

    fn make_job(name: &str, needs: Vec<&str>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            display_name: None,
            needs: needs.iter().map(|s| s.to_string()).collect(),
            run_always: false,
            continue_on_error: false,
            variables: Default::default(),
            matrix: None,
            steps: vec![StepDefinition {
                name: "run".to_string(),
                run: Some("echo test".to_string()),
                uses: None,
                with: Default::default(),
                env: Default::default(),
                secrets: vec![],
                shell: "bash".to_string(),
                working_directory: None,
                timeout_minutes: 30,
            }],
        }
    }

    fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            version: "1".to_string(),
            name: "test".to_string(),
            description: None,
            triggers: vec![],
            variables: Default::default(),
            jobs,
        }
    }

    #[test]
    fn test_fan_in_dag() {
        let dag = DagBuilder::new()
            .build(&pipeline(vec![
                make_job("test", vec![]),
                make_job("format", vec![]),
                make_job("publish", vec!["test", "format"]),
            ]))
            .unwrap();

        let order = dag.topological_order().unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&"publish"));
    }

    #[test]
    fn test_unknown_prerequisite() {
        let err = DagBuilder::new()
            .build(&pipeline(vec![make_job("publish", vec!["lint"])]))
            .unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));

        let core: tollgate_core::Error = err.into();
        assert!(matches!(
            core,
            tollgate_core::Error::UnknownPrerequisite { ref prerequisite, .. } if prerequisite == "lint"
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let err = DagBuilder::new()
            .build(&pipeline(vec![
                make_job("a", vec!["b"]),
                make_job("b", vec!["a"]),
            ]))
            .unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(_)));
        assert!(tollgate_core::Error::from(err).is_configuration());
    }

    #[test]
    fn test_empty_and_duplicate() {
        assert!(matches!(
            DagBuilder::new().build(&pipeline(vec![])),
            Err(DagError::EmptyPipeline)
        ));
        assert!(matches!(
            DagBuilder::new().build(&pipeline(vec![make_job("a", vec![]), make_job("a", vec![])])),
            Err(DagError::DuplicateJob(_))
        ));
    }
}
