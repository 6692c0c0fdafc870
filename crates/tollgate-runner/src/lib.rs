//! Step execution engine for Tollgate.
//!
//! The [`JobExecutor`] runs one job instance's steps in order and reports a
//! terminal outcome. The actual work is delegated to [`StepRunner`]s: shell
//! commands and named external actions.

pub mod action;
pub mod executor;
mod process;
pub mod runner;
pub mod shell;

pub use action::ActionRunner;
pub use executor::{JobContext, JobExecutor, JobOutcome, NoopObserver, StepObserver, StepRecord};
pub use runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;
