//! Kubernetes Client wrapper
//!
//! Provides a simplified interface to the Kubernetes API.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info};

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client using in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Get services API for a namespace
    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Get a service by name
    pub async fn get_service(&self, name: &str, namespace: &str) -> Result<Service> {
        debug!(service = name, namespace = namespace, "Looking up service");
        self.services(namespace)
            .get(name)
            .await
            .with_context(|| format!("Failed to get service: {}/{}", namespace, name))
    }

    /// Check that services in `namespace` can be read
    pub async fn health_check(&self, namespace: &str) -> Result<()> {
        let _ = self
            .services(namespace)
            .list(&ListParams::default().limit(1))
            .await
            .with_context(|| format!("Failed to list services in namespace: {}", namespace))?;
        Ok(())
    }
}
