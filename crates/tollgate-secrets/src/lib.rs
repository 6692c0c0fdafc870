//! Secret resolution for Tollgate.
//!
//! Secrets are fetched only when a step is about to run and handed to the
//! runner as environment variables. Nothing here writes them anywhere.

pub mod manager;
pub mod providers;

pub use manager::{SecretManager, SecretManagerConfig};
pub use providers::{EnvProvider, FileProvider};
