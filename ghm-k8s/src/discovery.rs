//! Cluster service discovery
//!
//! Resolves the diagnostics daemon through its Kubernetes Service instead of
//! cluster DNS: the Service's ClusterIP is read from the API server. The
//! target is written `service.namespace[:port]`; a trailing
//! `.svc[.cluster.local]` is accepted and ignored. Without a port the
//! Service's first port is used.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ghm_core::source::{AddressResolver, SourceError};
use k8s_openapi::api::core::v1::Service;
use tracing::debug;

use crate::client::K8sClient;

/// Service reference parsed from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub name: String,
    pub namespace: String,
    pub port: Option<u16>,
}

impl ServiceTarget {
    /// Parse `service.namespace[.svc[.cluster.local]][:port]`
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in service target: {}", target))?;
                (host, Some(port))
            }
            None => (target, None),
        };

        let host = host
            .strip_suffix(".svc.cluster.local")
            .or_else(|| host.strip_suffix(".svc"))
            .unwrap_or(host);

        let (name, namespace) = host
            .split_once('.')
            .ok_or_else(|| anyhow!("Service target must be service.namespace[:port]: {}", target))?;
        if name.is_empty() || namespace.is_empty() || namespace.contains('.') {
            bail!("Service target must be service.namespace[:port]: {}", target);
        }

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}.{}:{}", self.name, self.namespace, port),
            None => write!(f, "{}.{}", self.name, self.namespace),
        }
    }
}

/// Socket address of a Service's ClusterIP
pub fn service_address(service: &Service, port: Option<u16>) -> Result<SocketAddr> {
    let spec = service.spec.as_ref().context("Service has no spec")?;

    let cluster_ip = match spec.cluster_ip.as_deref() {
        None | Some("") => bail!("Service has no ClusterIP"),
        Some("None") => bail!("Service is headless"),
        Some(ip) => ip
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid ClusterIP: {}", ip))?,
    };

    let port = match port {
        Some(port) => port,
        None => {
            let first = spec
                .ports
                .as_ref()
                .and_then(|ports| ports.first())
                .context("Service exposes no ports and the target names none")?;
            u16::try_from(first.port).with_context(|| format!("Invalid service port: {}", first.port))?
        }
    };

    Ok(SocketAddr::new(cluster_ip, port))
}

/// Resolves a [`ServiceTarget`] through the Kubernetes API
pub struct ServiceResolver {
    client: K8sClient,
    target: ServiceTarget,
}

impl ServiceResolver {
    pub fn new(client: K8sClient, target: ServiceTarget) -> Self {
        Self { client, target }
    }

    async fn lookup(&self) -> Result<SocketAddr> {
        let service = self
            .client
            .get_service(&self.target.name, &self.target.namespace)
            .await?;
        let addr = service_address(&service, self.target.port)?;
        debug!(service = %self.target, addr = %addr, "Discovered diagnostics service");
        Ok(addr)
    }
}

#[async_trait]
impl AddressResolver for ServiceResolver {
    async fn resolve(&self) -> Result<Vec<SocketAddr>, SourceError> {
        self.lookup()
            .await
            .map(|addr| vec![addr])
            .map_err(|e| SourceError::Resolve {
                target: self.target.to_string(),
                reason: format!("{:#}", e),
            })
    }

    fn target(&self) -> String {
        self.target.to_string()
    }
}
