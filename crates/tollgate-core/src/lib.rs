//! Tollgate Core
//!
//! Core domain types, traits, and error handling for Tollgate.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: pipeline definitions, run state, events
//! and the ports the scheduler talks to.

pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod secrets;

pub use error::{Error, Result};
pub use ids::*;
