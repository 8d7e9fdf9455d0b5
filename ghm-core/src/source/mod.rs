//! Diagnostic source layer
//!
//! Provides the condition snapshots the watcher polls.

mod interface;
mod mock;
mod remote;
mod xid_log;

pub use interface::*;
pub use mock::MockSource;
pub use remote::{
    AddressResolver, DnsResolver, HealthQuery, HealthResponse, HealthResult, RemoteSource,
    WireIncident,
};
pub use xid_log::{parse_xid_log, xid_summary, GpuSlot, PciTopology, XidLogSource, XID_SYSTEM};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Remote diagnostics daemon
    #[default]
    Remote,
    /// NVIDIA XIDs from the kernel log
    XidLog,
    /// In-memory source, reports nothing unless scripted
    Mock,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Remote => write!(f, "remote"),
            SourceKind::XidLog => write!(f, "xid_log"),
            SourceKind::Mock => write!(f, "mock"),
        }
    }
}
