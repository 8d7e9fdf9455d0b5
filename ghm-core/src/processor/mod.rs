//! Event processors
//!
//! An event processor receives every condition the watcher dispatches,
//! tagged with the transition the watcher computed, and is responsible for
//! turning it into whatever its destination needs. Processors are built from
//! configuration through the [`ProcessorRegistry`].

mod platform_connector;
mod registry;

pub use platform_connector::{
    OngoingPolicy, PlatformConnectorProcessor, PlatformConnectorSettings, PLATFORM_CONNECTOR,
};
pub use registry::{Constructor, ProcessorContext, ProcessorRegistry, ProcessorSpec};

use async_trait::async_trait;
use thiserror::Error;

use crate::condition::{HealthCondition, LifecycleState};
use crate::connector::TransmissionError;

/// What happened to a dispatched condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// An event was delivered
    Delivered,
    /// State was updated; policy says not to report it
    Suppressed,
    /// Nothing to report (e.g. a clear for a condition never tracked)
    Ignored,
}

/// Processing failure, isolated to one condition
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Transmission failed: {0}")]
    Transmission(#[from] TransmissionError),

    #[error("{0}")]
    Other(String),
}

/// Event processor trait
///
/// Processors are shared between the watcher and their worker task, so they
/// must be thread-safe. Conditions are handed over one at a time, in
/// dispatch order.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Name used in logs and metric labels
    fn name(&self) -> &str;

    /// Handle one condition and its reported transition
    async fn process(
        &self,
        condition: &HealthCondition,
        transition: LifecycleState,
    ) -> Result<ProcessOutcome, ProcessError>;

    /// Conditions this processor currently tracks as active
    async fn tracked_conditions(&self) -> Vec<HealthCondition> {
        Vec::new()
    }
}
