//! Service discovery registry with push replication
//!
//! One [`RegistryServer`] holds the authoritative registry of services, the
//! nodes that implement them and their certificates. Any number of
//! [`RegistryClient`]s keep a mirror of it over long-lived TCP connections
//! and get events whenever it changes.
//!
//! - A client registering a service sends it to the server, which stores it
//!   under that connection and forwards it to every other client.
//! - A newly connected client receives the whole registry first.
//! - When a client disconnects, everything it registered is withdrawn.
//! - After a reconnect, a client re-sends its own registrations.
//!
//! # Example
//! ```no_run
//! use discovery_rs::client::{ClientConfig, RegistryClient};
//! use discovery_rs::model::{Event, ServiceInfo};
//! use discovery_rs::server::{RegistryServer, ServerConfig};
//!
//! # async fn example() -> discovery_rs::error::Result<()> {
//! let server = RegistryServer::start(ServerConfig::default()).await?;
//!
//! let client = RegistryClient::connect(ClientConfig::new(server.local_addr().to_string()));
//! client.register_event_handler(|event: &Event| {
//!     println!("{} {}", event.event_type, event.service_id);
//! });
//! client.wait_connected().await?;
//! client.register_service(ServiceInfo::new("search-1", 3)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

pub use client::{ClientConfig, RegistryClient};
pub use error::{Error, Result};
pub use model::{ConnectionInfo, Event, EventType, Node, Protocol, ServiceInfo};
pub use registry::{EventHandler, SubscriptionId};
pub use server::{RegistryHub, RegistryServer, ServerConfig};
