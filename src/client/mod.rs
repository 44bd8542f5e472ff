//! Registry client
//!
//! [`RegistryClient`] mirrors the server's registry and publishes this
//! process's own services through it.

pub mod agent;
pub mod config;
pub mod link;

pub use agent::RegistryClient;
pub use config::ClientConfig;
pub use link::ClientLink;
