//! Mock diagnostic source for testing

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DiagnosticSource, SourceError};
use crate::condition::HealthCondition;

/// Scripted in-memory source
pub struct MockSource {
    node_name: String,
    conditions: RwLock<Vec<HealthCondition>>,
    /// Configurable failure simulation
    pub fail_query: AtomicBool,
    /// Simulated query latency
    delay: RwLock<Duration>,
    queries: AtomicUsize,
}

impl MockSource {
    /// Create a source reporting no conditions
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            conditions: RwLock::new(Vec::new()),
            fail_query: AtomicBool::new(false),
            delay: RwLock::new(Duration::ZERO),
            queries: AtomicUsize::new(0),
        }
    }

    /// Replace the reported snapshot
    pub async fn set_conditions(&self, conditions: Vec<HealthCondition>) {
        *self.conditions.write().await = conditions;
    }

    /// Raise a condition on a device
    pub async fn add(&self, device_id: &str, error_code: &str, system: &str) {
        let condition = HealthCondition::new(
            self.node_name.as_str(),
            device_id,
            error_code,
            system,
            format!("Mock condition {} on GPU {}", error_code, device_id),
        );
        self.conditions.write().await.push(condition);
    }

    /// Drop a condition from the snapshot
    pub async fn remove(&self, device_id: &str, error_code: &str) {
        self.conditions
            .write()
            .await
            .retain(|c| !(c.device_id == device_id && c.error_code == error_code));
    }

    /// Report a healthy node
    pub async fn clear(&self) {
        self.conditions.write().await.clear();
    }

    /// Set whether queries should fail
    pub fn set_fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    /// Set simulated query latency
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    /// Number of queries served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticSource for MockSource {
    async fn query(&self) -> Result<Vec<HealthCondition>, SourceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_query.load(Ordering::SeqCst) {
            return Err(SourceError::Other("Mock query failure".to_string()));
        }

        // Fresh snapshot each poll
        let now = chrono::Utc::now();
        Ok(self
            .conditions
            .read()
            .await
            .iter()
            .cloned()
            .map(|mut c| {
                c.observed_at = now;
                c
            })
            .collect())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
