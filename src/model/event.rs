//! Registry change notifications

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

use super::service::ServiceInfo;

/// Kind of registry change
///
/// Doubles as the message type carried on the wire; the string forms are
/// what [`SyncMessage::kind`](crate::protocol::SyncMessage) holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Register,
    Update,
    Deregister,
    DeregisterNode,
}

impl EventType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Register => "Register",
            EventType::Update => "Update",
            EventType::Deregister => "DeRegister",
            EventType::DeregisterNode => "DeRegisterNode",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Register" => Ok(EventType::Register),
            "Update" => Ok(EventType::Update),
            "DeRegister" => Ok(EventType::Deregister),
            "DeRegisterNode" => Ok(EventType::DeregisterNode),
            other => Err(Error::Unsupported(other.to_string())),
        }
    }
}

/// A change delivered to event subscribers
///
/// Events are never stored; they exist only for the fan-out that follows
/// the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub service_id: String,
    /// The service after the change; `None` for a full deregistration
    pub info: Option<ServiceInfo>,
}

impl Event {
    pub fn register(info: ServiceInfo) -> Self {
        Self {
            event_type: EventType::Register,
            service_id: info.id.clone(),
            info: Some(info),
        }
    }

    pub fn update(info: ServiceInfo) -> Self {
        Self {
            event_type: EventType::Update,
            service_id: info.id.clone(),
            info: Some(info),
        }
    }

    pub fn deregister(service_id: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Deregister,
            service_id: service_id.into(),
            info: None,
        }
    }
}
