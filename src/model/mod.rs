//! Entity model: services, nodes and change events

pub mod event;
pub mod service;

pub use event::{Event, EventType};
pub use service::{ConnectionInfo, Node, Protocol, ServiceInfo, META_CERTIFICATE};
