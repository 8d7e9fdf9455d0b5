//! Remote diagnostics service source
//!
//! Queries a GPU diagnostics daemon over TCP using the same length-prefixed
//! JSON framing as the connector. The daemon answers with the incidents its
//! health watches currently raise; passing incidents are dropped and the rest
//! are folded into one condition per GPU + error code.
//!
//! Where the daemon lives is decided by an [`AddressResolver`]: plain DNS for
//! a direct `host:port`, or cluster service discovery (see `ghm-k8s`).
//! Resolved addresses are cached until a query fails.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{aggregate_incidents, DiagnosticSource, RawIncident, SourceError};
use crate::condition::HealthCondition;
use crate::wire::{self, Versioned, WIRE_VERSION};

/// Turns a configured target into socket addresses
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self) -> Result<Vec<SocketAddr>, SourceError>;

    /// Configured target, for logs and errors
    fn target(&self) -> String;
}

/// Resolves `host:port` through the system resolver
pub struct DnsResolver {
    target: String,
}

impl DnsResolver {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self) -> Result<Vec<SocketAddr>, SourceError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(self.target.as_str())
            .await
            .map_err(|e| SourceError::Resolve {
                target: self.target.clone(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(SourceError::Resolve {
                target: self.target.clone(),
                reason: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// Outcome of one health watch check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthResult {
    Pass,
    Warn,
    Fail,
}

/// Incident as sent by the diagnostics daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireIncident {
    /// Health watch that raised it (PCIE, NVLINK, MEM, ...)
    pub system: String,
    pub health: HealthResult,
    /// Diagnostic error code
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// GPU index
    pub entity_id: u32,
    #[serde(default)]
    pub serial: Option<String>,
}

impl From<WireIncident> for RawIncident {
    fn from(incident: WireIncident) -> Self {
        RawIncident {
            device_id: incident.entity_id.to_string(),
            system: incident.system,
            code: incident.code,
            message: incident.message,
            serial: incident.serial,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthQuery {
    pub version: u32,
    pub query: String,
}

impl HealthQuery {
    pub fn health() -> Self {
        Self {
            version: WIRE_VERSION,
            query: "health".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub version: u32,
    #[serde(default)]
    pub incidents: Vec<WireIncident>,
}

impl Versioned for HealthResponse {
    fn version(&self) -> u32 {
        self.version
    }
}

/// Source backed by a remote diagnostics daemon
pub struct RemoteSource {
    node_name: String,
    resolver: Arc<dyn AddressResolver>,
    cached: Mutex<Option<Vec<SocketAddr>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl RemoteSource {
    pub fn new(
        node_name: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            resolver,
            cached: Mutex::new(None),
            connect_timeout,
            io_timeout,
        }
    }

    async fn addresses(&self) -> Result<Vec<SocketAddr>, SourceError> {
        let mut cached = self.cached.lock().await;
        if let Some(addrs) = cached.as_ref() {
            return Ok(addrs.clone());
        }

        let addrs = tokio::time::timeout(self.connect_timeout, self.resolver.resolve())
            .await
            .map_err(|_| SourceError::Timeout("resolve", self.connect_timeout))??;
        debug!(service = %self.resolver.target(), addrs = ?addrs, "Resolved diagnostics service");
        *cached = Some(addrs.clone());
        Ok(addrs)
    }

    async fn connect(&self, addrs: &[SocketAddr]) -> Result<TcpStream, SourceError> {
        let mut last = None;
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    trace!(addr = %addr, error = %e, "Connect failed");
                    last = Some(SourceError::Connect {
                        target: addr.to_string(),
                        source: e,
                    });
                }
                Err(_) => last = Some(SourceError::Timeout("connect", self.connect_timeout)),
            }
        }
        Err(last.unwrap_or_else(|| SourceError::Resolve {
            target: self.resolver.target(),
            reason: "no addresses".to_string(),
        }))
    }

    async fn fetch(&self) -> Result<Vec<WireIncident>, SourceError> {
        let addrs = self.addresses().await?;
        let mut stream = self.connect(&addrs).await?;

        tokio::time::timeout(
            self.io_timeout,
            wire::write_frame(&mut stream, &HealthQuery::health()),
        )
        .await
        .map_err(|_| SourceError::Timeout("request", self.io_timeout))??;

        let response: HealthResponse =
            tokio::time::timeout(self.io_timeout, wire::read_frame(&mut stream))
                .await
                .map_err(|_| SourceError::Timeout("response", self.io_timeout))??;
        wire::check_version(&response)?;

        Ok(response.incidents)
    }
}

#[async_trait]
impl DiagnosticSource for RemoteSource {
    async fn query(&self) -> Result<Vec<HealthCondition>, SourceError> {
        let incidents = match self.fetch().await {
            Ok(incidents) => incidents,
            Err(e) => {
                // Force a fresh lookup next time; the service may have moved
                if self.cached.lock().await.take().is_some() {
                    warn!(service = %self.resolver.target(), "Dropping cached diagnostics address");
                }
                return Err(e);
            }
        };

        let failing = incidents
            .into_iter()
            .filter(|i| i.health != HealthResult::Pass)
            .map(RawIncident::from);
        Ok(aggregate_incidents(&self.node_name, failing))
    }

    fn describe(&self) -> String {
        format!("remote({})", self.resolver.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct CountingResolver {
        addr: std::sync::Mutex<SocketAddr>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AddressResolver for CountingResolver {
        async fn resolve(&self) -> Result<Vec<SocketAddr>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![*self.addr.lock().unwrap()])
        }

        fn target(&self) -> String {
            "test".to_string()
        }
    }

    fn incident(entity_id: u32, code: &str, health: HealthResult, message: &str) -> WireIncident {
        WireIncident {
            system: "PCIE".to_string(),
            health,
            code: code.to_string(),
            message: message.to_string(),
            entity_id,
            serial: Some(format!("SN{}", entity_id)),
        }
    }

    /// Serve `responses` one connection at a time
    async fn serve(responses: Vec<HealthResponse>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let query: HealthQuery = wire::read_frame(&mut stream).await.unwrap();
                assert_eq!(query.query, "health");
                wire::write_frame(&mut stream, &response).await.unwrap();
            }
        });
        addr
    }

    fn source(resolver: Arc<dyn AddressResolver>) -> RemoteSource {
        RemoteSource::new(
            "node-a",
            resolver,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_query_filters_and_aggregates() {
        let addr = serve(vec![HealthResponse {
            version: WIRE_VERSION,
            incidents: vec![
                incident(1, "DCGM_FR_PCI_REPLAY_RATE", HealthResult::Warn, "replays on link 0"),
                incident(2, "DCGM_FR_PCI_REPLAY_RATE", HealthResult::Pass, "ok"),
                incident(1, "DCGM_FR_PCI_REPLAY_RATE", HealthResult::Fail, "replays on link 1"),
            ],
        }])
        .await;

        let source = source(Arc::new(DnsResolver::new(addr.to_string())));
        let conditions = source.query().await.unwrap();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].device_id, "1");
        assert_eq!(conditions[0].system, "PCIE");
        assert_eq!(conditions[0].raw_message, "replays on link 0; replays on link 1");
        assert_eq!(conditions[0].serial.as_deref(), Some("SN1"));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_protocol_error() {
        let addr = serve(vec![HealthResponse {
            version: 7,
            incidents: Vec::new(),
        }])
        .await;

        let source = source(Arc::new(DnsResolver::new(addr.to_string())));
        let err = source.query().await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[tokio::test]
    async fn test_addresses_cached_until_failure() {
        let healthy = || HealthResponse {
            version: WIRE_VERSION,
            incidents: Vec::new(),
        };
        let addr = serve(vec![healthy(), healthy()]).await;
        let resolver = Arc::new(CountingResolver {
            addr: std::sync::Mutex::new(addr),
            calls: AtomicUsize::new(0),
        });
        let source = source(resolver.clone());

        source.query().await.unwrap();
        source.query().await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // Listener is gone after two connections
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(source.query().await.is_err());

        let moved = serve(vec![healthy()]).await;
        *resolver.addr.lock().unwrap() = moved;
        source.query().await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let source = source(Arc::new(DnsResolver::new("not a host")));
        let err = source.query().await.unwrap_err();
        assert_eq!(err.kind(), "resolve");
        assert_eq!(source.describe(), "remote(not a host)");
    }
}
