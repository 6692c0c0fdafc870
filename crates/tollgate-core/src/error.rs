//! Error types for Tollgate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors, all fatal before any job launches
    #[error("Invalid pipeline definition: {0}")]
    Configuration(String),

    #[error("Job '{job}' needs unknown job '{prerequisite}'")]
    UnknownPrerequisite { job: String, prerequisite: String },

    #[error("Dependency cycle detected involving job '{0}'")]
    DependencyCycle(String),

    #[error("Matrix axis '{axis}' of job '{job}' has no values")]
    EmptyMatrixAxis { job: String, axis: String },

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already completed")]
    RunAlreadyCompleted,

    // Execution environment could not start the work
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for malformed definitions (bad axes, bad gates, cycles).
    ///
    /// These are detected before a run reaches `Running`.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::UnknownPrerequisite { .. }
                | Error::DependencyCycle(_)
                | Error::EmptyMatrixAxis { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}
