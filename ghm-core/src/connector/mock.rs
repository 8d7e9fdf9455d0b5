//! Mock connector for testing
//!
//! Listens on a Unix socket in a private temporary directory, records every
//! event it receives and acknowledges batches. Error codes can be marked as
//! rejected, in which case batches containing them are acknowledged with
//! `accepted: 0`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::wire::{self, Ack, HealthEvent, HealthEventBatch, WireError};

#[derive(Default)]
struct Shared {
    events: RwLock<Vec<HealthEvent>>,
    rejected_codes: RwLock<HashSet<String>>,
    batches: AtomicUsize,
}

/// In-process connector listening on a temporary socket
pub struct MockConnector {
    dir: TempDir,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockConnector {
    /// Bind a fresh socket and start accepting connections
    pub async fn start() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let listener = UnixListener::bind(dir.path().join("connector.sock"))?;
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &shared).await {
                        debug!(error = %e, "Mock connector connection closed");
                    }
                });
            }
        });

        Ok(Self { dir, shared, task })
    }

    pub fn socket_path(&self) -> std::path::PathBuf {
        self.dir.path().join("connector.sock")
    }

    /// Directory holding the socket; usable for sibling test files
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Reject every batch that contains one of `codes`
    pub async fn reject_codes<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rejected = self.shared.rejected_codes.write().await;
        rejected.extend(codes.into_iter().map(Into::into));
    }

    /// Accept everything again
    pub async fn accept_all(&self) {
        self.shared.rejected_codes.write().await.clear();
    }

    /// Events from acknowledged batches, in arrival order
    pub async fn events(&self) -> Vec<HealthEvent> {
        self.shared.events.read().await.clone()
    }

    /// Number of batches received, acknowledged or not
    pub fn batches_received(&self) -> usize {
        self.shared.batches.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) {
        self.shared.events.write().await.clear();
    }
}

impl Drop for MockConnector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: UnixStream, shared: &Shared) -> Result<(), WireError> {
    loop {
        let batch: HealthEventBatch = wire::read_frame(&mut stream).await?;
        shared.batches.fetch_add(1, Ordering::SeqCst);

        let rejected = {
            let codes = shared.rejected_codes.read().await;
            batch.events.iter().any(|e| codes.contains(&e.error_code))
        };

        let accepted = if rejected {
            0
        } else {
            let accepted = batch.events.len();
            shared.events.write().await.extend(batch.events);
            accepted
        };

        wire::write_frame(&mut stream, &Ack::new(accepted)).await?;
    }
}
