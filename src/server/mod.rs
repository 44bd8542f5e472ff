//! Registry server
//!
//! [`RegistryServer`] accepts peer connections and feeds them into the
//! [`RegistryHub`], which owns the authoritative copy of the registry.

pub mod config;
mod connection;
pub mod hub;
pub mod listener;
pub mod peers;

pub use config::ServerConfig;
pub use hub::RegistryHub;
pub use listener::RegistryServer;
pub use peers::{PeerInfo, PeerSet};
