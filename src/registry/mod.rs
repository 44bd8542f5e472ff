//! Replicated registry core
//!
//! ```text
//!          RegistryClient                       RegistryHub
//!   Replica<ServiceMirror, ClientLink>   Replica<StoreBackend, PeerSet>
//!                 │                                   │
//!        apply ── backend.put ── events.publish ── sender.send
//! ```
//!
//! Both ends apply a [`RegistryMessage`](crate::protocol::RegistryMessage)
//! the same way: commit it to their backend, publish the resulting
//! [`Event`](crate::model::Event) to subscribers, and for locally
//! originated changes push the message out through their sender.

pub mod backend;
pub mod dispatch;
pub mod mirror;
pub mod owner;
pub mod replica;

pub use backend::{RegistryBackend, StoreBackend};
pub use dispatch::{EventDispatcher, EventHandler, SubscriptionId};
pub use mirror::ServiceMirror;
pub use owner::OwnerKey;
pub use replica::{MessageSender, Replica};
