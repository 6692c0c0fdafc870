//! Matrix expansion for parallel job generation.

use std::collections::{BTreeMap, HashSet};
use tollgate_core::ids::InstanceId;
use tollgate_core::pipeline::{JobDefinition, MatrixConfig};
use tollgate_core::run::JobInstance;
use tollgate_core::{Error, Result};

/// Result of matrix expansion.
///
/// A job without a matrix still forms a group of one.
#[derive(Debug, Clone)]
pub struct MatrixExpansion {
    pub job: String,
    /// Pending instances, first axis varying slowest.
    pub instances: Vec<JobInstance>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

impl MatrixExpansion {
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.id.clone()).collect()
    }
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job's matrix configuration into individual instances.
    ///
    /// Pure: expanding the same job twice yields identical ids in identical
    /// order.
    pub fn expand(&self, job: &JobDefinition) -> Result<MatrixExpansion> {
        let Some(matrix) = job.matrix.as_ref().filter(|m| !m.axes.is_empty()) else {
            return Ok(MatrixExpansion {
                job: job.name.clone(),
                instances: vec![JobInstance::new(
                    InstanceId::new(&job.name),
                    &job.name,
                    BTreeMap::new(),
                )],
                fail_fast: job.matrix.as_ref().is_none_or(|m| m.fail_fast),
                max_parallel: job.matrix.as_ref().and_then(|m| m.max_parallel),
            });
        };

        self.validate(&job.name, matrix)?;

        let mut combinations = self.generate_combinations(matrix);

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        if combinations.is_empty() {
            return Err(Error::Configuration(format!(
                "matrix of job '{}' excludes every combination",
                job.name
            )));
        }

        let instances = combinations
            .into_iter()
            .map(|combo| {
                let id = InstanceId::for_matrix(&job.name, combo.iter().map(|(_, v)| *v));
                let values = combo
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                JobInstance::new(id, &job.name, values)
            })
            .collect();

        Ok(MatrixExpansion {
            job: job.name.clone(),
            instances,
            fail_fast: matrix.fail_fast,
            max_parallel: matrix.max_parallel,
        })
    }

    fn validate(&self, job: &str, matrix: &MatrixConfig) -> Result<()> {
        if matrix.max_parallel == Some(0) {
            return Err(Error::Configuration(format!(
                "matrix of job '{}' sets max_parallel to 0",
                job
            )));
        }

        let mut names = HashSet::new();
        for axis in &matrix.axes {
            if axis.values.is_empty() {
                return Err(Error::EmptyMatrixAxis {
                    job: job.to_string(),
                    axis: axis.name.clone(),
                });
            }
            if !names.insert(axis.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "matrix of job '{}' declares axis '{}' twice",
                    job, axis.name
                )));
            }
        }

        for exclude in &matrix.exclude {
            if let Some(unknown) = exclude.keys().find(|k| !names.contains(k.as_str())) {
                return Err(Error::Configuration(format!(
                    "matrix exclude of job '{}' names unknown axis '{}'",
                    job, unknown
                )));
            }
        }

        Ok(())
    }

    /// Cross product in declaration order; the first axis varies slowest.
    fn generate_combinations<'a>(&self, matrix: &'a MatrixConfig) -> Vec<Vec<(&'a str, &'a str)>> {
        let mut result: Vec<Vec<(&str, &str)>> = vec![Vec::new()];

        for axis in &matrix.axes {
            let mut new_result = Vec::with_capacity(result.len() * axis.values.len());

            for combo in &result {
                for value in &axis.values {
                    let mut new_combo = combo.clone();
                    new_combo.push((axis.name.as_str(), value.as_str()));
                    new_result.push(new_combo);
                }
            }

            result = new_result;
        }

        result
    }

    fn matches_exclude(&self, combo: &[(&str, &str)], exclude: &BTreeMap<String, String>) -> bool {
        exclude.iter().all(|(key, value)| {
            combo
                .iter()
                .any(|(axis, v)| *axis == key.as_str() && *v == value.as_str())
        })
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
