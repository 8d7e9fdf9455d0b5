//! Connector wire format
//!
//! Every message is one frame: a 4-byte big-endian payload length followed by
//! a UTF-8 JSON payload. Payloads carry a `version` field; a peer speaking a
//! different version is rejected instead of guessed at.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::categorization::Category;
use crate::condition::{HealthCondition, LifecycleState};

/// Protocol version spoken by this build
pub const WIRE_VERSION: u32 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Agent name stamped on every event
pub const AGENT_NAME: &str = "gpu-health-monitor";

/// Component class stamped on every event
pub const COMPONENT_CLASS: &str = "GPU";

/// Framing and payload errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("Peer speaks protocol version {got}, expected {WIRE_VERSION}")]
    VersionMismatch { got: u32 },
}

/// Health event as delivered to the connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub node_name: String,
    pub device_id: String,
    pub error_code: String,
    pub error_name: String,
    pub recommended_action: String,
    pub severity_class: String,
    pub lifecycle_state: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub component_class: String,
    /// Health-watch group that raised the condition
    pub check_name: String,
    pub message: String,
    /// Only a CLEARED event reports the component healthy again
    pub is_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl HealthEvent {
    pub fn new(condition: &HealthCondition, category: &Category<'_>, state: LifecycleState) -> Self {
        Self {
            node_name: condition.node_name.clone(),
            device_id: condition.device_id.clone(),
            error_code: condition.error_code.clone(),
            error_name: category.error_name.to_string(),
            recommended_action: category.recommended_action.to_string(),
            severity_class: category.severity_class.to_string(),
            lifecycle_state: state,
            timestamp: condition.observed_at,
            agent: AGENT_NAME.to_string(),
            component_class: COMPONENT_CLASS.to_string(),
            check_name: condition.system.clone(),
            message: condition.raw_message.clone(),
            is_healthy: state == LifecycleState::Cleared,
            serial: condition.serial.clone(),
        }
    }
}

/// Batch of events sent in one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEventBatch {
    pub version: u32,
    pub events: Vec<HealthEvent>,
}

impl HealthEventBatch {
    pub fn new(events: Vec<HealthEvent>) -> Self {
        Self {
            version: WIRE_VERSION,
            events,
        }
    }
}

/// Connector acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub version: u32,
    pub accepted: usize,
}

impl Ack {
    pub fn new(accepted: usize) -> Self {
        Self {
            version: WIRE_VERSION,
            accepted,
        }
    }
}

/// Payloads that carry a protocol version
pub trait Versioned {
    fn version(&self) -> u32;
}

impl Versioned for HealthEventBatch {
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for Ack {
    fn version(&self) -> u32 {
        self.version
    }
}

/// Reject payloads from a peer with a different protocol version
pub fn check_version<T: Versioned>(payload: &T) -> Result<(), WireError> {
    match payload.version() {
        WIRE_VERSION => Ok(()),
        got => Err(WireError::VersionMismatch { got }),
    }
}

/// Serialize `payload` and write it as one frame
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(payload)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode its payload
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
