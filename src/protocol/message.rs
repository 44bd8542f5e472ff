//! Registry sync messages
//!
//! [`SyncMessage`] is the envelope that crosses a connection: a type name,
//! the service id and an opaque payload. [`RegistryMessage`] is the decoded
//! form the registry works with. Decoding happens once, where the message
//! enters the registry, and every later step matches on the enum.
//!
//! Payload by type:
//!
//! ```text
//! Register / Update  -> JSON-encoded ServiceInfo
//! DeRegister         -> empty
//! DeRegisterNode     -> node ids joined with '|'
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{Event, EventType, ServiceInfo};

/// Separator between node ids in a DeRegisterNode payload
pub const NODE_ID_SEPARATOR: &str = "|";

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    /// Message type name (see [`EventType::as_str`])
    pub kind: String,
    /// Service id
    pub id: String,
    /// Type-dependent payload
    pub encoded: Bytes,
}

impl SyncMessage {
    /// Create an envelope
    pub fn new(kind: impl Into<String>, id: impl Into<String>, encoded: Bytes) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            encoded,
        }
    }
}

/// Decoded registry message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMessage {
    /// A service appeared
    Register(ServiceInfo),
    /// A service changed
    Update(ServiceInfo),
    /// A service went away
    Deregister { id: String },
    /// Some nodes of a service went away
    DeregisterNode { id: String, nodes: Vec<String> },
}

impl RegistryMessage {
    /// Service the message is about
    pub fn service_id(&self) -> &str {
        match self {
            RegistryMessage::Register(info) | RegistryMessage::Update(info) => &info.id,
            RegistryMessage::Deregister { id } | RegistryMessage::DeregisterNode { id, .. } => id,
        }
    }

    /// Wire type of the message
    pub fn event_type(&self) -> EventType {
        match self {
            RegistryMessage::Register(_) => EventType::Register,
            RegistryMessage::Update(_) => EventType::Update,
            RegistryMessage::Deregister { .. } => EventType::Deregister,
            RegistryMessage::DeregisterNode { .. } => EventType::DeregisterNode,
        }
    }

    /// Decode an envelope
    ///
    /// Unknown types yield [`Error::Unsupported`]; bad payloads, or a
    /// Register/Update whose payload names a different service than the
    /// envelope, yield [`Error::MalformedPayload`].
    pub fn decode(msg: &SyncMessage) -> Result<Self> {
        let kind: EventType = msg.kind.parse()?;

        match kind {
            EventType::Register | EventType::Update => {
                let info = ServiceInfo::decode(&msg.encoded)?;
                if info.id != msg.id {
                    return Err(Error::MalformedPayload(format!(
                        "envelope id {} does not match service id {}",
                        msg.id, info.id
                    )));
                }
                if kind == EventType::Register {
                    Ok(RegistryMessage::Register(info))
                } else {
                    Ok(RegistryMessage::Update(info))
                }
            }
            EventType::Deregister => Ok(RegistryMessage::Deregister { id: msg.id.clone() }),
            EventType::DeregisterNode => Ok(RegistryMessage::DeregisterNode {
                id: msg.id.clone(),
                nodes: decode_node_ids(&msg.encoded)?,
            }),
        }
    }

    /// Encode into an envelope
    pub fn encode(&self) -> Result<SyncMessage> {
        let encoded = match self {
            RegistryMessage::Register(info) | RegistryMessage::Update(info) => info.encode()?,
            RegistryMessage::Deregister { .. } => Bytes::new(),
            RegistryMessage::DeregisterNode { nodes, .. } => encode_node_ids(nodes),
        };

        Ok(SyncMessage::new(
            self.event_type().as_str(),
            self.service_id(),
            encoded,
        ))
    }

    /// Event matching the wire type, given the service state after the change
    pub(crate) fn event(&self, after: Option<ServiceInfo>) -> Event {
        Event {
            event_type: match self {
                RegistryMessage::Register(_) => EventType::Register,
                RegistryMessage::Deregister { .. } => EventType::Deregister,
                // Node removal is observed as a change of the service
                RegistryMessage::Update(_) | RegistryMessage::DeregisterNode { .. } => {
                    EventType::Update
                }
            },
            service_id: self.service_id().to_string(),
            info: after,
        }
    }
}

/// Join node ids for a DeRegisterNode payload
pub fn encode_node_ids<S: AsRef<str>>(nodes: &[S]) -> Bytes {
    let joined = nodes
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(NODE_ID_SEPARATOR);
    Bytes::from(joined)
}

/// Split a DeRegisterNode payload into node ids
///
/// Empty segments are dropped, so an empty payload is an empty list.
pub fn decode_node_ids(data: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::MalformedPayload(format!("node id list: {}", e)))?;

    Ok(text
        .split(NODE_ID_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}
