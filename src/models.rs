//! Data models exchanged with the editor outside the RPC envelope.
//!
//! These use serde so they can be written as JSON (CLI, config files) and
//! converted to msgpack values for the wire. Conversion goes through
//! `serde_json::Value`, which keeps structs as maps and unit variants as
//! strings.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Method the client info is announced with.
pub const SET_CLIENT_INFO_METHOD: &str = "nvim_set_client_info";

/// Semantic version of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prerelease: String,
}

impl Version {
    /// Version of this crate.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            prerelease: env!("CARGO_PKG_VERSION_PRE").to_string(),
        }
    }
}

/// Kind of client, as understood by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Remote client connected over a socket or stdio.
    Remote,
    /// Generic msgpack-RPC peer.
    Msgpack,
    Ui,
    Embedder,
    /// Plugin host process.
    Host,
    Plugin,
}

/// Description of one method the client serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Whether the method is a notification (no response expected).
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nargs: Option<u32>,
}

/// Self-description announced to the editor right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: Version,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ClientInfo {
    /// Client info for this crate, e.g. `editor-rpc-client`.
    pub fn for_kind(kind: &str, client_type: ClientType) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("license".to_string(), env!("CARGO_PKG_LICENSE").to_string());
        Self {
            name: format!("{}-{}", env!("CARGO_PKG_NAME"), kind),
            version: Version::current(),
            client_type,
            methods: BTreeMap::new(),
            attributes,
        }
    }

    /// Register a served method.
    pub fn with_method(mut self, name: &str, is_async: bool, nargs: Option<u32>) -> Self {
        self.methods
            .insert(name.to_string(), MethodSpec { is_async, nargs });
        self
    }

    /// Positional arguments for `SET_CLIENT_INFO_METHOD`:
    /// `[name, version, type, methods, attributes]`.
    pub fn to_args(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::from(self.name.as_str()),
            to_wire(&self.version).context("Failed to encode client version")?,
            to_wire(&self.client_type).context("Failed to encode client type")?,
            to_wire(&self.methods).context("Failed to encode client methods")?,
            to_wire(&self.attributes).context("Failed to encode client attributes")?,
        ])
    }
}

/// Convert any serializable value to a msgpack value via its JSON form.
pub fn to_wire<T: Serialize + ?Sized>(item: &T) -> Result<Value> {
    let json = serde_json::to_value(item).context("Failed to serialize to JSON")?;
    json_to_wire(&json)
}

/// Convert a JSON value to a msgpack value.
pub fn json_to_wire(json: &serde_json::Value) -> Result<Value> {
    rmpv::ext::to_value(json).context("Failed to convert JSON to msgpack")
}

/// Convert a msgpack value to JSON. Fails on maps with array or map keys.
pub fn wire_to_json(value: &Value) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("Failed to convert msgpack to JSON")
}
