//! Service and node descriptions
//!
//! These are the values the registry replicates. They are plain data:
//! serialized to JSON for the wire and for the durable store.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Meta key holding the PEM-encoded certificate of a service
pub const META_CERTIFICATE: &str = "certificate";

/// Transport protocol offered by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Grpc,
    Http,
    WebSocket,
    Tcp,
    Udp,
}

/// One network endpoint implementing a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the owning service's node list
    pub id: String,
    /// Connection string (host:port or equivalent)
    pub address: String,
    pub protocol: Protocol,
}

impl Node {
    /// Create a node
    pub fn new(id: impl Into<String>, address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            protocol,
        }
    }
}

/// One registered service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    /// Service kind, used for type-filtered queries
    #[serde(rename = "type")]
    pub service_type: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ServiceInfo {
    /// Create a service with no nodes and no meta
    pub fn new(id: impl Into<String>, service_type: u32) -> Self {
        Self {
            id: id.into(),
            service_type,
            nodes: Vec::new(),
            meta: HashMap::new(),
        }
    }

    /// Add a node
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set a meta entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Attach a PEM certificate
    pub fn with_certificate(self, pem: impl Into<String>) -> Self {
        self.with_meta(META_CERTIFICATE, pem)
    }

    /// PEM certificate, if one is attached
    pub fn certificate(&self) -> Option<&str> {
        self.meta.get(META_CERTIFICATE).map(String::as_str)
    }

    /// Find a node by id
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Drop every node whose id is listed
    ///
    /// Unknown and duplicate ids are ignored. Returns the number of nodes removed.
    pub fn remove_nodes<S: AsRef<str>>(&mut self, node_ids: &[S]) -> usize {
        let before = self.nodes.len();
        self.nodes
            .retain(|node| !node_ids.iter().any(|id| id.as_ref() == node.id));
        before - self.nodes.len()
    }

    /// Connection details for the first node offering `protocol`
    pub fn connection_info(&self, protocol: Protocol) -> Option<ConnectionInfo> {
        self.nodes
            .iter()
            .find(|n| n.protocol == protocol)
            .map(|n| ConnectionInfo {
                address: n.address.clone(),
                certificate: self
                    .certificate()
                    .map(|pem| Bytes::copy_from_slice(pem.as_bytes())),
            })
    }

    /// Serialize to the JSON payload carried by Register/Update messages
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a payload produced by [`ServiceInfo::encode`]
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::MalformedPayload(e.to_string()))
    }
}

/// Where and how to reach a service over one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: String,
    /// PEM certificate bytes, when the service publishes one
    pub certificate: Option<Bytes>,
}
