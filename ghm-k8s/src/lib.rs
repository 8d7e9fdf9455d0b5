//! GHM Kubernetes Integration
//!
//! Provides the Kubernetes client and cluster service discovery for the
//! diagnostic source.

pub mod client;
pub mod discovery;

pub use client::K8sClient;
pub use discovery::{service_address, ServiceResolver, ServiceTarget};
