//! Wire message types for the push transfer protocol.
//!
//! JSON text frames over one persistent connection. Every client message
//! carries a `uuid` correlation id; the server echoes it on the response.
//!
//! Client -> server:
//!   {uuid, type: "command", command, params}
//!   {uuid, type: "transfer", kind: "action", transferID, action}
//!   {uuid, type: "transfer", kind: "step", transferID, step, action, data?}
//!
//! Server -> client:
//!   {uuid, data?, error?}

use bytes::Bytes;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use uuid::Uuid;

use crate::config::{RestoreOptions, Strategy};

/// Path appended to the base URL to reach the push endpoint
pub const TRANSFER_PATH: &str = "/transfer/runner/push";

/// Flush threshold for a batch (1MB)
pub const DEFAULT_BATCH_SIZE: usize = 1024 * 1024;

/// Read size when draining an asset byte source (64KB)
pub const ASSET_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Steps and actions
// =============================================================================

/// Named sub-channel inside a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Entities,
    Links,
    Configuration,
    Assets,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Entities, Step::Links, Step::Configuration, Step::Assets];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Entities => "entities",
            Step::Links => "links",
            Step::Configuration => "configuration",
            Step::Assets => "assets",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Start,
    Stream,
    End,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Start => "start",
            StepAction::Stream => "stream",
            StepAction::End => "end",
        }
    }
}

/// Session-scoped verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferAction {
    Bootstrap,
    GetMetadata,
    GetSchemas,
    BeforeTransfer,
    Rollback,
    Close,
}

impl TransferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAction::Bootstrap => "bootstrap",
            TransferAction::GetMetadata => "getMetadata",
            TransferAction::GetSchemas => "getSchemas",
            TransferAction::BeforeTransfer => "beforeTransfer",
            TransferAction::Rollback => "rollback",
            TransferAction::Close => "close",
        }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Push,
    Pull,
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitOptions {
    pub strategy: Strategy,
    pub restore: RestoreOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitParams {
    pub options: InitOptions,
    pub transfer: TransferKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndParams {
    #[serde(rename = "transferID")]
    pub transfer_id: String,
}

/// Session-level command. Serializes as its params.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Command {
    Init(InitParams),
    End(EndParams),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init(_) => "init",
            Command::End(_) => "end",
        }
    }
}

/// Response payload of `init`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitResponse {
    #[serde(rename = "transferID", default)]
    pub transfer_id: Option<String>,
}

// =============================================================================
// Envelopes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMessageKind {
    Action,
    Step,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage<'a> {
    Command {
        uuid: Uuid,
        command: &'static str,
        params: &'a Command,
    },
    Transfer {
        uuid: Uuid,
        kind: TransferMessageKind,
        #[serde(rename = "transferID")]
        transfer_id: &'a str,
        action: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<Step>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<&'a RawValue>,
    },
}

/// Response frame from the server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl ServerMessage {
    pub fn decode(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

// =============================================================================
// Asset sub-events
// =============================================================================

/// File stats sent with an asset's `start` sub-event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStats {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetStart {
    pub filename: String,
    pub filepath: String,
    pub stats: AssetStats,
}

/// One sub-event of an asset sub-stream inside the `assets` step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AssetEvent {
    Start {
        #[serde(rename = "assetID")]
        asset_id: Uuid,
        data: AssetStart,
    },
    Stream {
        #[serde(rename = "assetID")]
        asset_id: Uuid,
        #[serde(serialize_with = "serialize_buffer")]
        data: Bytes,
    },
    End {
        #[serde(rename = "assetID")]
        asset_id: Uuid,
    },
}

impl AssetEvent {
    pub fn asset_id(&self) -> Uuid {
        match self {
            AssetEvent::Start { asset_id, .. }
            | AssetEvent::Stream { asset_id, .. }
            | AssetEvent::End { asset_id } => *asset_id,
        }
    }

    /// Raw data bytes carried by this event. Only `stream` carries any.
    pub fn data_len(&self) -> usize {
        match self {
            AssetEvent::Stream { data, .. } => data.len(),
            _ => 0,
        }
    }
}

/// Chunk bytes go out in the shape the remote decodes into a byte buffer.
fn serialize_buffer<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    let mut buffer = serializer.serialize_struct("Buffer", 2)?;
    buffer.serialize_field("type", "Buffer")?;
    buffer.serialize_field("data", data.as_ref())?;
    buffer.end()
}

// =============================================================================
// Tests
// =============================================================================
