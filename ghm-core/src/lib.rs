//! GHM Core Library
//!
//! Core pipeline for the GPU Health Monitor.
//! This crate polls a diagnostic source, diffs snapshots into lifecycle
//! transitions, categorizes conditions and forwards health events to the
//! platform connector while keeping a durable per-condition state.

pub mod categorization;
pub mod condition;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod source;
pub mod state_store;
pub mod watcher;
pub mod wire;

// Re-export common types
pub use categorization::{CategorizationTables, Category};
pub use condition::{ConditionDiff, ConditionKey, HealthCondition, LifecycleState};
pub use connector::{ConnectorClient, ConnectorConfig, TransmissionError};
pub use error::ConfigError;
pub use metrics::MetricsRegistry;
pub use processor::{EventProcessor, ProcessorContext, ProcessorRegistry, ProcessorSpec};
pub use source::{DiagnosticSource, SourceError, SourceKind};
pub use state_store::{PersistedStateRecord, StateStore};
pub use watcher::{Watcher, WatcherConfig};
