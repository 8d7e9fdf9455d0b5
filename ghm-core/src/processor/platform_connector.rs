//! Platform connector processor
//!
//! Categorizes each condition, reconciles the watcher's transition against
//! the durable state store, persists the outcome and only then hands the
//! resulting event to the connector. Persisting first means a crash can at
//! worst lose one delivery; it can never replay a NEW that was already sent.
//!
//! A NEW is stored as pending until the connector acknowledges it. While it
//! is pending, every later observation of the condition re-sends it as NEW,
//! whatever the ONGOING policy, so a failed or abandoned delivery is
//! recovered on the next poll.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::registry::ProcessorContext;
use super::{EventProcessor, ProcessError, ProcessOutcome};
use crate::categorization::CategorizationTables;
use crate::condition::{HealthCondition, LifecycleState};
use crate::connector::{ConnectorClient, ConnectorConfig, TransmissionError};
use crate::error::ConfigError;
use crate::lifecycle::{reconcile, StoreAction};
use crate::metrics::MetricsRegistry;
use crate::state_store::{PersistedStateRecord, StateStore};
use crate::wire::HealthEvent;

/// Registry tag and default instance name
pub const PLATFORM_CONNECTOR: &str = "platform_connector";

/// What to do with conditions that are still present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OngoingPolicy {
    /// Report state changes only
    #[default]
    Suppress,
    /// Report every poll
    Emit,
}

/// Settings for one platform connector processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConnectorSettings {
    /// Instance name, used in logs and metric labels
    #[serde(default = "default_name")]
    pub name: String,

    /// Connector transport
    #[serde(flatten)]
    pub connector: ConnectorConfig,

    /// State file; derived from the global state file when unset
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// ONGOING reporting policy
    #[serde(default)]
    pub ongoing: OngoingPolicy,

    /// Timeout for state file reads and writes
    #[serde(default = "default_state_io_timeout", with = "humantime_serde")]
    pub state_io_timeout: Duration,
}

fn default_name() -> String {
    PLATFORM_CONNECTOR.to_string()
}

fn default_state_io_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for PlatformConnectorSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            connector: ConnectorConfig::default(),
            state_file: None,
            ongoing: OngoingPolicy::default(),
            state_io_timeout: default_state_io_timeout(),
        }
    }
}

impl PlatformConnectorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = |field: &str| format!("processors.{}.{}", self.name, field);

        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("processors.name", "must not be empty"));
        }
        if self.connector.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(key("socket_path"), "must not be empty"));
        }
        if self.connector.max_attempts == 0 {
            return Err(ConfigError::invalid(key("max_attempts"), "must be at least 1"));
        }
        if self.connector.connect_timeout.is_zero() || self.connector.io_timeout.is_zero() {
            return Err(ConfigError::invalid(key("io_timeout"), "timeouts must be positive"));
        }
        if self.state_io_timeout.is_zero() {
            return Err(ConfigError::invalid(key("state_io_timeout"), "must be positive"));
        }
        Ok(())
    }
}

/// Registry constructor
pub(super) fn construct<'a>(
    ctx: &'a ProcessorContext,
    settings: serde_json::Value,
) -> BoxFuture<'a, Result<Arc<dyn EventProcessor>, ConfigError>> {
    async move {
        let settings: PlatformConnectorSettings = serde_json::from_value(settings)
            .map_err(|e| ConfigError::invalid(format!("processors.{}", PLATFORM_CONNECTOR), e.to_string()))?;
        settings.validate()?;

        let processor = PlatformConnectorProcessor::new(ctx, settings).await;
        Ok(Arc::new(processor) as Arc<dyn EventProcessor>)
    }
    .boxed()
}

/// Connector-backed event processor
pub struct PlatformConnectorProcessor {
    name: String,
    node_name: String,
    tables: Arc<CategorizationTables>,
    client: ConnectorClient,
    store: Mutex<StateStore>,
    ongoing: OngoingPolicy,
    /// Codes already reported as missing from the mapping table
    unknown_codes: std::sync::Mutex<HashSet<String>>,
    metrics: MetricsRegistry,
}

impl PlatformConnectorProcessor {
    /// Create the processor, loading its state file
    pub async fn new(ctx: &ProcessorContext, settings: PlatformConnectorSettings) -> Self {
        let state_file = settings
            .state_file
            .clone()
            .unwrap_or_else(|| ctx.state_file_for(&settings.name));
        let store = StateStore::open(state_file, settings.state_io_timeout).await;

        info!(
            processor = %settings.name,
            socket = ?settings.connector.socket_path,
            state_file = ?store.path(),
            tracked = store.len(),
            ongoing = ?settings.ongoing,
            "Platform connector processor ready"
        );
        ctx.metrics.set_tracked_conditions(&settings.name, store.len());

        Self {
            client: ConnectorClient::new(settings.connector, ctx.shutdown.clone()),
            name: settings.name,
            node_name: ctx.node_name.clone(),
            tables: Arc::clone(&ctx.tables),
            store: Mutex::new(store),
            ongoing: settings.ongoing,
            unknown_codes: std::sync::Mutex::new(HashSet::new()),
            metrics: ctx.metrics,
        }
    }

    fn note_unknown_code(&self, code: &str) {
        let mut seen = match self.unknown_codes.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        if seen.insert(code.to_string()) {
            warn!(processor = %self.name, code = code, "Error code not in mapping table, reporting as UNKNOWN");
            self.metrics.inc_unknown_code();
        }
    }

    /// Reconcile and persist; returns the state to report, if any
    async fn update_store(
        &self,
        condition: &HealthCondition,
        transition: LifecycleState,
    ) -> Option<LifecycleState> {
        let key = condition.key();
        let mut store = self.store.lock().await;
        let previous = store.get(&key).cloned();
        let lifecycle = reconcile(previous.as_ref().map(|r| r.lifecycle_state), transition);

        if lifecycle.overridden {
            debug!(
                processor = %self.name,
                condition = %key,
                reported = %transition,
                stored = ?lifecycle.from,
                emit = ?lifecycle.emit,
                "Reported transition overridden by stored state"
            );
        }

        let mut emit = lifecycle.emit;
        let unacknowledged = previous.as_ref().and_then(|r| r.pending);
        if emit == Some(LifecycleState::Ongoing) && unacknowledged == Some(LifecycleState::New) {
            debug!(processor = %self.name, condition = %key, "Re-sending unacknowledged NEW");
            emit = Some(LifecycleState::New);
        }

        let result = match lifecycle.store {
            StoreAction::Put(state) => {
                let pending = emit.filter(|s| *s == LifecycleState::New);
                if lifecycle.changed() || pending != unacknowledged {
                    let mut record =
                        PersistedStateRecord::observe(previous.as_ref(), condition, state);
                    record.pending = pending;
                    store.put(record).await
                } else {
                    store.touch(&key, condition.observed_at);
                    Ok(())
                }
            }
            StoreAction::Delete => store.delete(&key).await.map(|_| ()),
            StoreAction::Keep => Ok(()),
        };

        // Delivery still goes ahead; the next successful write catches up
        if let Err(e) = result {
            error!(processor = %self.name, condition = %key, error = %e, "Failed to persist condition state");
        }

        self.metrics.set_tracked_conditions(&self.name, store.len());
        emit
    }

    /// Forget the pending marker of an acknowledged event
    async fn settle(&self, condition: &HealthCondition) {
        let key = condition.key();
        let mut store = self.store.lock().await;
        if let Err(e) = store.settle(&key).await {
            // Worst case the NEW is sent once more
            warn!(processor = %self.name, condition = %key, error = %e, "Failed to persist delivery acknowledgement");
        }
    }
}

#[async_trait]
impl EventProcessor for PlatformConnectorProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        condition: &HealthCondition,
        transition: LifecycleState,
    ) -> Result<ProcessOutcome, ProcessError> {
        let category = self
            .tables
            .categorize(&condition.error_code, &condition.system);
        if !category.known {
            self.note_unknown_code(&condition.error_code);
        }

        let Some(state) = self.update_store(condition, transition).await else {
            debug!(processor = %self.name, condition = %condition.key(), "Clear for untracked condition ignored");
            return Ok(ProcessOutcome::Ignored);
        };

        if state == LifecycleState::Ongoing && self.ongoing == OngoingPolicy::Suppress {
            return Ok(ProcessOutcome::Suppressed);
        }

        let event = HealthEvent::new(condition, &category, state);
        match self.client.send(vec![event]).await {
            Ok(_) => {
                info!(
                    processor = %self.name,
                    device = %condition.device_id,
                    code = %condition.error_code,
                    error_name = %category.error_name,
                    severity = %category.severity_class,
                    action = %category.recommended_action,
                    state = %state,
                    "Health event delivered"
                );
                self.metrics
                    .inc_event_emitted(&self.name, state, category.severity_class);
                if state == LifecycleState::New {
                    self.settle(condition).await;
                }
                Ok(ProcessOutcome::Delivered)
            }
            Err(TransmissionError::Cancelled) => {
                warn!(processor = %self.name, condition = %condition.key(), "Delivery abandoned on shutdown");
                Err(TransmissionError::Cancelled.into())
            }
            Err(e) => {
                error!(
                    processor = %self.name,
                    device = %condition.device_id,
                    code = %condition.error_code,
                    state = %state,
                    error = %e,
                    "Dropping health event"
                );
                self.metrics.inc_transmission_failure(&self.name);
                Err(e.into())
            }
        }
    }

    async fn tracked_conditions(&self) -> Vec<HealthCondition> {
        let store = self.store.lock().await;
        store
            .records()
            .filter(|r| r.lifecycle_state.is_active())
            .map(|r| r.to_condition(&self.node_name))
            .collect()
    }
}
