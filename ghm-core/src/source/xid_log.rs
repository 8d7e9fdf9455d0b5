//! Kernel log XID source
//!
//! Scans the kernel ring buffer for NVIDIA XID reports and raises one
//! condition per GPU + XID code. The PCI address in each report is mapped to
//! a GPU index and serial through NVML; when NVML is unavailable the PCI
//! address itself is used as the device id.
//!
//! Format: `NVRM: Xid (PCI:0000:3b:00): 79, pid=..., GPU has fallen off the bus.`
//!
//! The whole ring buffer is re-read on every poll, so an XID stays active for
//! as long as its report is still in the buffer. It clears when the buffer
//! wraps or is emptied (`dmesg -C`), not when the GPU recovers: a CLEARED from
//! this source means the report aged out, and the GPU may still be faulty.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use nvml_wrapper::Nvml;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, trace, warn};

use super::{aggregate_incidents, DiagnosticSource, RawIncident, SourceError};
use crate::condition::HealthCondition;

/// Group reported for XID conditions
pub const XID_SYSTEM: &str = "XID";

static XID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"NVRM: Xid \(PCI:([^)]+)\): (\d+),(?: pid=[^,]*,)?([^\r\n]*)")
        .expect("XID pattern is valid")
});

/// GPU identity behind a PCI bus id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSlot {
    pub index: u32,
    pub serial: Option<String>,
}

/// PCI bus id → GPU slot
#[derive(Debug, Clone, Default)]
pub struct PciTopology {
    slots: HashMap<String, GpuSlot>,
}

impl PciTopology {
    /// Read the mapping from NVML
    pub fn from_nvml() -> Result<Self, SourceError> {
        let nvml = Nvml::init().map_err(|e| SourceError::Other(format!("NVML init: {}", e)))?;
        let count = nvml
            .device_count()
            .map_err(|e| SourceError::Other(e.to_string()))?;

        let mut topology = Self::default();
        for index in 0..count {
            let device = nvml
                .device_by_index(index)
                .map_err(|e| SourceError::Other(e.to_string()))?;
            let bus_id = device
                .pci_info()
                .map_err(|e| SourceError::Other(e.to_string()))?
                .bus_id;
            topology.insert(&bus_id, index, device.serial().ok());
        }

        info!(gpus = topology.len(), "Loaded GPU PCI topology");
        Ok(topology)
    }

    /// Read the mapping from NVML, or fall back to raw PCI addresses
    pub fn from_nvml_or_empty() -> Self {
        Self::from_nvml().unwrap_or_else(|e| {
            warn!(error = %e, "NVML unavailable, reporting XIDs by PCI address");
            Self::default()
        })
    }

    pub fn insert(&mut self, bus_id: &str, index: u32, serial: Option<String>) {
        self.slots
            .insert(normalize_bus_id(bus_id), GpuSlot { index, serial });
    }

    pub fn lookup(&self, bus_id: &str) -> Option<&GpuSlot> {
        self.slots.get(&normalize_bus_id(bus_id))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Reduce NVML (`00000000:3B:00.0`) and kernel (`0000:3b:00`) forms to `3b:00`
fn normalize_bus_id(bus_id: &str) -> String {
    let lower = bus_id.trim().to_ascii_lowercase();
    let parts: Vec<&str> = lower.split(':').collect();
    let tail = if parts.len() >= 2 {
        &parts[parts.len() - 2..]
    } else {
        &parts[..]
    };
    let joined = tail.join(":");
    match joined.split_once('.') {
        Some((head, _)) => head.to_string(),
        None => joined,
    }
}

/// Parse kernel log text into one incident per GPU + XID
pub fn parse_xid_log(text: &str, topology: &PciTopology) -> Vec<RawIncident> {
    let mut seen = HashSet::new();
    let mut incidents = Vec::new();

    for cap in XID_PATTERN.captures_iter(text) {
        let bus_id = &cap[1];
        let Ok(code) = cap[2].parse::<u32>() else {
            continue;
        };

        let (device_id, serial) = match topology.lookup(bus_id) {
            Some(slot) => (slot.index.to_string(), slot.serial.clone()),
            None => (bus_id.to_string(), None),
        };

        if !seen.insert((device_id.clone(), code)) {
            continue;
        }

        incidents.push(RawIncident {
            device_id,
            system: XID_SYSTEM.to_string(),
            code: code.to_string(),
            message: xid_message(code, &cap[3]),
            serial,
        });
    }

    incidents
}

/// Short summaries for common XIDs, used when a report carries no text
static XID_SUMMARIES: &[(u32, &str)] = &[
    (13, "graphics engine exception"),
    (31, "MMU fault, GPU memory page fault"),
    (43, "GPU stopped processing"),
    (45, "channel preempted for cleanup"),
    (48, "double bit ECC error"),
    (63, "ECC page retirement or row remap recorded"),
    (64, "ECC page retirement or row remap failed"),
    (74, "NVLink error"),
    (79, "GPU fallen off the bus"),
    (92, "high single-bit ECC error rate"),
    (94, "contained ECC error"),
    (95, "uncontained ECC error"),
];

/// Summary of a well-known XID
pub fn xid_summary(code: u32) -> Option<&'static str> {
    XID_SUMMARIES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, summary)| *summary)
}

fn xid_message(code: u32, driver_text: &str) -> String {
    let text = driver_text.trim().trim_end_matches('.');
    if !text.is_empty() {
        return format!("XID {}: {}", code, text);
    }
    match xid_summary(code) {
        Some(summary) => format!("XID {}: {}", code, summary),
        None => format!("XID {}", code),
    }
}

/// Source reading XIDs from the kernel log
pub struct XidLogSource {
    node_name: String,
    topology: PciTopology,
    command: Vec<String>,
    timeout: Duration,
}

impl XidLogSource {
    pub fn new(node_name: impl Into<String>, topology: PciTopology, timeout: Duration) -> Self {
        Self {
            node_name: node_name.into(),
            topology,
            command: vec!["dmesg".to_string()],
            timeout,
        }
    }

    /// Use a different command to dump the kernel log
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.command = command;
        }
        self
    }

    async fn read_log(&self) -> Result<String, SourceError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SourceError::Command("empty kernel log command".to_string()))?;

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SourceError::Timeout("kernel log read", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DiagnosticSource for XidLogSource {
    async fn query(&self) -> Result<Vec<HealthCondition>, SourceError> {
        let log = self.read_log().await?;
        let incidents = parse_xid_log(&log, &self.topology);
        trace!(count = incidents.len(), "Found XID errors");
        if !incidents.is_empty() {
            debug!(count = incidents.len(), "XID conditions present in kernel log");
        }
        Ok(aggregate_incidents(&self.node_name, incidents))
    }

    fn describe(&self) -> String {
        format!("xid_log({})", self.command.join(" "))
    }
}
