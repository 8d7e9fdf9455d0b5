//! Diagnostic source trait and common types
//!
//! A diagnostic source reports the complete set of conditions currently
//! raised for the node's GPUs. Every query is a fresh snapshot; sources keep
//! no notion of what was reported before.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::condition::HealthCondition;
use crate::wire::WireError;

/// Query failure; always transient from the watcher's point of view
#[derive(Debug, Error)]
pub enum SourceError {
    /// Address could not be resolved
    #[error("Failed to resolve {target}: {reason}")]
    Resolve { target: String, reason: String },

    /// Connection refused or reset
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation timed out
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// The peer sent something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(#[from] WireError),

    /// A local command failed
    #[error("Command failed: {0}")]
    Command(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Short label used as the `reason` metric label
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Resolve { .. } => "resolve",
            SourceError::Connect { .. } => "connect",
            SourceError::Timeout(..) => "timeout",
            SourceError::Protocol(_) => "protocol",
            SourceError::Command(_) => "command",
            SourceError::Io(_) => "io",
            SourceError::Other(_) => "other",
        }
    }
}

/// Diagnostic source trait
///
/// Implementations must be thread-safe and must not block indefinitely;
/// the watcher bounds every query with its own timeout as well.
#[async_trait]
pub trait DiagnosticSource: Send + Sync {
    /// Return every condition currently raised
    async fn query(&self) -> Result<Vec<HealthCondition>, SourceError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// One failed health check as reported by a diagnostics engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIncident {
    pub device_id: String,
    pub system: String,
    pub code: String,
    pub message: String,
    pub serial: Option<String>,
}

/// Fold incidents into one condition per device + code.
///
/// A health watch can report the same code several times for one GPU (one
/// incident per failing field); the messages are joined with `"; "`.
/// Conditions keep the order in which their key was first seen.
pub fn aggregate_incidents(
    node_name: &str,
    incidents: impl IntoIterator<Item = RawIncident>,
) -> Vec<HealthCondition> {
    let mut conditions: Vec<HealthCondition> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for incident in incidents {
        let key = (incident.device_id.clone(), incident.code.clone());
        match index.get(&key) {
            Some(&i) => {
                let condition = &mut conditions[i];
                if !incident.message.is_empty() {
                    if !condition.raw_message.is_empty() {
                        condition.raw_message.push_str("; ");
                    }
                    condition.raw_message.push_str(&incident.message);
                }
                if condition.serial.is_none() {
                    condition.serial = incident.serial;
                }
            }
            None => {
                let mut condition = HealthCondition::new(
                    node_name,
                    incident.device_id,
                    incident.code,
                    incident.system,
                    incident.message,
                );
                condition.serial = incident.serial;
                index.insert(key, conditions.len());
                conditions.push(condition);
            }
        }
    }

    conditions
}
