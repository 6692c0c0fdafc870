//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! A single definition describes the shape of every run it can produce;
//! triggers only choose when a run starts and may override fail-fast per job.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a definition from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Look up a job template by name.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(flatten)]
    pub on: TriggerPredicate,
    #[serde(default)]
    pub overrides: TriggerOverrides,
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> TriggerType {
        match self.on {
            TriggerPredicate::Push { .. } => TriggerType::Push,
            TriggerPredicate::Release { .. } => TriggerType::Release,
            TriggerPredicate::Manual {} => TriggerType::Manual,
        }
    }

    /// Fail-fast override this trigger applies to a job, if any.
    pub fn fail_fast_for(&self, job: &str) -> Option<bool> {
        self.overrides.fail_fast.get(job).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerPredicate {
    Push {
        #[serde(default)]
        branches: Vec<String>,
    },
    Release {
        #[serde(default = "default_release_types")]
        types: Vec<ReleaseAction>,
    },
    Manual {},
}

fn default_release_types() -> Vec<ReleaseAction> {
    vec![ReleaseAction::Created]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    Release,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Created,
    Published,
    Prereleased,
    Released,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TriggerOverrides {
    /// Job name -> fail-fast value used for runs started by this trigger.
    #[serde(default)]
    pub fail_fast: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Jobs whose every instance must be terminal before this one starts.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Start once prerequisites are terminal, whatever their outcome.
    #[serde(default)]
    pub run_always: bool,
    /// Keep running later steps after a failed step.
    ///
    /// This does not mask the failure: the instance still ends `failed`, with
    /// the first failing step recorded as its failure reason, so the gate
    /// treats it like any other failed prerequisite.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    /// Check the job's own declarations (steps, matrix shape).
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("job name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::Configuration(format!(
                "job '{}' has no steps",
                self.name
            )));
        }
        for step in &self.steps {
            match (&step.run, &step.uses) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(Error::Configuration(format!(
                        "step '{}' of job '{}' must declare exactly one of `run` or `uses`",
                        step.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    /// Shell command.
    #[serde(default)]
    pub run: Option<String>,
    /// Named external action.
    #[serde(default)]
    pub uses: Option<String>,
    /// Opaque action inputs.
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretReference>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_minutes: u32,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_step_timeout() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    /// Environment variable the value is exposed as.
    pub name: String,
    /// Key in the provider, defaults to `name`.
    #[serde(default)]
    pub key: Option<String>,
    /// Provider name, defaults to the manager's default provider.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    /// Axes in declaration order; the first axis varies slowest.
    pub axes: Vec<MatrixAxis>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixAxis {
    pub name: String,
    #[serde(deserialize_with = "scalar_strings")]
    #[schemars(with = "Vec<String>")]
    pub values: Vec<String>,
}

/// Accept bare YAML scalars (`3.10`, `true`) as opaque strings.
fn scalar_strings<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    let raw = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|s| match s {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
name: package
triggers:
  - type: push
    branches: [master]
    overrides:
      fail_fast:
        test: false
  - type: release
jobs:
  - name: test
    matrix:
      axes:
        - name: python-version
          values: ["3.9", "3.10", 3.11]
        - name: deps
          values: ["latest", "minimum"]
    steps:
      - name: install
        run: pip install ${{ matrix.deps }}
  - name: publish
    needs: [test]
    steps:
      - name: upload
        uses: pypa/publish
        with:
          repository: pypi
        secrets:
          - name: TWINE_PASSWORD
            key: PYPI_PASSWORD
"#;

    #[test]
    fn test_parse_definition() {
        let def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert_eq!(def.version, "1");
        assert_eq!(def.jobs.len(), 2);

        let test = def.job("test").unwrap();
        let matrix = test.matrix.as_ref().unwrap();
        assert_eq!(matrix.axes[0].values, vec!["3.9", "3.10", "3.11"]);
        assert!(matrix.fail_fast);

        let publish = def.job("publish").unwrap();
        assert_eq!(publish.needs, vec!["test"]);
        assert!(!publish.run_always);
        assert_eq!(publish.steps[0].secrets[0].key.as_deref(), Some("PYPI_PASSWORD"));
    }

    #[test]
    fn test_parse_triggers() {
        let def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert_eq!(def.triggers[0].trigger_type(), TriggerType::Push);
        assert_eq!(def.triggers[0].fail_fast_for("test"), Some(false));
        assert_eq!(def.triggers[0].fail_fast_for("publish"), None);

        match &def.triggers[1].on {
            TriggerPredicate::Release { types } => {
                assert_eq!(types, &vec![ReleaseAction::Created])
            }
            other => panic!("unexpected trigger {:?}", other),
        }
    }

    #[test]
    fn test_step_needs_exactly_one_action() {
        let mut def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert!(def.jobs[0].validate().is_ok());

        def.jobs[0].steps[0].uses = Some("actions/setup".to_string());
        let err = def.jobs[0].validate().unwrap_err();
        assert!(err.is_configuration());
    }
}
