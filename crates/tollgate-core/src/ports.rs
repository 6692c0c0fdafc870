//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::events::Event;
use crate::ids::RunId;
use crate::run::PipelineRun;
use crate::secrets::SecretValue;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to every event published after this call.
    async fn subscribe(&self) -> Result<EventStream>;
}

/// Repository for pipeline runs.
///
/// Runs are saved after every status transition, so the latest saved copy is
/// always enough to resume scheduling.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace a run.
    async fn save(&self, run: &PipelineRun) -> Result<()>;

    /// Get a run by ID.
    async fn get(&self, id: RunId) -> Result<Option<PipelineRun>>;

    /// List runs, most recently queued first.
    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>>;
}

/// Secret provider for retrieving secrets from various backends.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by key.
    async fn get(&self, key: &str) -> Result<SecretValue>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}
