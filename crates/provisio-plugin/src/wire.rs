//! Driver RPC frames.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! → {"id":1,"method":"machine.create","params":{"record_id":7,"params":{}}}
//! ← {"id":1,"result":{"detail":null}}
//! ← {"id":1,"error":{"message":"vm already exists"}}
//! ```
//!
//! Calls on one connection are strictly sequential; the response `id` must
//! match the request it answers.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

use crate::error::{PluginError, PluginResult};

pub mod methods {
    pub const MACHINE_INIT: &str = "machine.init";
    pub const MACHINE_CREATE: &str = "machine.create";
    pub const MACHINE_INSTALL_ROBOT: &str = "machine.install_robot";
    pub const MACHINE_HEALTH_CHECK: &str = "machine.health_check";
    pub const MACHINE_DONE: &str = "machine.done";

    pub const CHAIN_INIT: &str = "chain.init";
    pub const CHAIN_CREATE: &str = "chain.create";
    pub const CHAIN_INSTALL: &str = "chain.install";
    pub const CHAIN_HEALTH_CHECK: &str = "chain.health_check";
    pub const CHAIN_DONE: &str = "chain.done";

    /// Ask the plugin to stop serving and exit.
    pub const DRIVER_EXIT: &str = "driver.exit";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn fault(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcFault {
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Call payloads
// ---------------------------------------------------------------------------

/// Arguments to `*.init`: the requested resource name and free-form
/// driver parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Initial description of a resource, returned by `*.init` and persisted by
/// the caller before any further phase runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Arguments to every phase after init: the store-assigned record id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub record_id: i64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReply {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest {
    pub record_id: i64,
    pub attempt: u32,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReply {
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize `frame` as one line and flush it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> PluginResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next non-blank line as a frame. `None` on end of stream.
pub async fn read_frame<R, T>(lines: &mut Lines<R>) -> PluginResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        match lines.next_line().await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => {
                let frame = serde_json::from_str(&line).map_err(|err| {
                    PluginError::Protocol(format!("malformed frame {line:?}: {err}"))
                })?;
                return Ok(Some(frame));
            }
        }
    }
}

pub(crate) fn to_params<T: Serialize>(value: &T) -> PluginResult<Value> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn from_params<T: DeserializeOwned>(method: &str, value: Value) -> PluginResult<T> {
    serde_json::from_value(value)
        .map_err(|err| PluginError::Protocol(format!("bad payload for {method}: {err}")))
}
