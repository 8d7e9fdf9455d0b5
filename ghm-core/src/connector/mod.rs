//! Connector client
//!
//! Delivers framed [`HealthEventBatch`]es to the platform connector over a
//! Unix domain socket. Each attempt opens a fresh connection; connect, write
//! and acknowledgement read are all bounded by timeouts. Failed attempts are
//! retried with capped exponential backoff until the attempt ceiling is hit.

pub mod mock;

pub use mock::MockConnector;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{self, Ack, HealthEvent, HealthEventBatch, WireError};

/// Connector transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unix socket the connector listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Connect timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for writing a batch and reading its ack
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Attempts per batch, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/platform-connector.sock")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Failure to deliver a batch
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("Failed to connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Connector accepted {accepted} of {sent} events")]
    Rejected { sent: usize, accepted: usize },

    #[error("Giving up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<TransmissionError>,
    },

    #[error("Shutdown requested")]
    Cancelled,
}

/// Client for the connector socket
pub struct ConnectorClient {
    config: ConnectorConfig,
    shutdown: CancellationToken,
}

impl ConnectorClient {
    pub fn new(config: ConnectorConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Deliver `events` in one batch, retrying until acknowledged.
    ///
    /// A pending retry delay is abandoned on shutdown; an attempt already in
    /// flight still runs to completion or its timeout.
    pub async fn send(&self, events: Vec<HealthEvent>) -> Result<usize, TransmissionError> {
        let batch = HealthEventBatch::new(events);
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;

        let mut attempt = 1;
        loop {
            let err = match self.attempt(&batch).await {
                Ok(accepted) => {
                    debug!(
                        socket = ?self.config.socket_path,
                        attempt = attempt,
                        accepted = accepted,
                        "Batch delivered"
                    );
                    return Ok(accepted);
                }
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(TransmissionError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            warn!(
                socket = ?self.config.socket_path,
                attempt = attempt,
                retry_in = ?backoff,
                error = %err,
                "Connector delivery failed, retrying"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransmissionError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(self.config.max_backoff);
            attempt += 1;
        }
    }

    async fn attempt(&self, batch: &HealthEventBatch) -> Result<usize, TransmissionError> {
        let path = &self.config.socket_path;

        let mut stream = tokio::time::timeout(self.config.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| TransmissionError::Timeout("connect", self.config.connect_timeout))?
            .map_err(|source| TransmissionError::Connect {
                path: path.clone(),
                source,
            })?;

        tokio::time::timeout(self.config.io_timeout, wire::write_frame(&mut stream, batch))
            .await
            .map_err(|_| TransmissionError::Timeout("write", self.config.io_timeout))??;

        let ack: Ack = tokio::time::timeout(self.config.io_timeout, wire::read_frame(&mut stream))
            .await
            .map_err(|_| TransmissionError::Timeout("ack", self.config.io_timeout))??;
        wire::check_version(&ack)?;

        let sent = batch.events.len();
        if ack.accepted != sent {
            return Err(TransmissionError::Rejected {
                sent,
                accepted: ack.accepted,
            });
        }
        Ok(ack.accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorization::Category;
    use crate::condition::{HealthCondition, LifecycleState};

    fn fast_config(socket_path: PathBuf) -> ConnectorConfig {
        ConnectorConfig {
            socket_path,
            connect_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(500),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn event(code: &str) -> HealthEvent {
        let condition = HealthCondition::new("node-a", "0", code, "XID", "msg");
        let category = Category {
            error_name: "Xid79",
            recommended_action: "Reset GPU",
            severity_class: "Fatal",
            known: true,
        };
        HealthEvent::new(&condition, &category, LifecycleState::New)
    }

    #[test]
    fn test_config_defaults() {
        let config: ConnectorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/var/run/platform-connector.sock"));
        assert_eq!(config.max_attempts, 5);

        let config: ConnectorConfig =
            serde_json::from_str(r#"{"io_timeout": "750ms", "max_attempts": 2}"#).unwrap();
        assert_eq!(config.io_timeout, Duration::from_millis(750));
        assert_eq!(config.max_attempts, 2);
    }

    #[tokio::test]
    async fn test_send_acknowledged() {
        let connector = MockConnector::start().await.unwrap();
        let client = ConnectorClient::new(
            fast_config(connector.socket_path()),
            CancellationToken::new(),
        );

        let accepted = client.send(vec![event("79"), event("48")]).await.unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(connector.events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_absent_connector_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let client = ConnectorClient::new(
            fast_config(dir.path().join("missing.sock")),
            CancellationToken::new(),
        );

        match client.send(vec![event("79")]).await.unwrap_err() {
            TransmissionError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TransmissionError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_is_failure() {
        let connector = MockConnector::start().await.unwrap();
        connector.reject_codes(["79"]).await;
        let client = ConnectorClient::new(
            fast_config(connector.socket_path()),
            CancellationToken::new(),
        );

        let err = client.send(vec![event("79")]).await.unwrap_err();
        assert!(matches!(err, TransmissionError::Exhausted { attempts: 3, .. }));
        assert_eq!(connector.batches_received(), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path().join("missing.sock"));
        config.initial_backoff = Duration::from_secs(30);
        config.max_backoff = Duration::from_secs(30);

        let shutdown = CancellationToken::new();
        let client = ConnectorClient::new(config, shutdown.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let started = std::time::Instant::now();
        let err = client.send(vec![event("79")]).await.unwrap_err();
        assert!(matches!(err, TransmissionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        cancel.await.unwrap();
    }
}
