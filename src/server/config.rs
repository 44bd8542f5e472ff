//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Default registry port
pub const DEFAULT_PORT: u16 = 9777;

/// File name of the registry database inside `store_dir`
pub const STORE_FILE_NAME: &str = "registry.db";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of this server; scopes the owner key of its own registrations
    pub name: String,

    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Directory of the registry database (None = in-memory database)
    pub store_dir: Option<PathBuf>,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Per-peer outbound queue capacity, in messages
    pub outbound_queue: usize,

    /// Largest accepted frame body, in bytes
    pub max_frame_size: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "registry".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            store_dir: None,
            max_connections: 0, // Unlimited
            outbound_queue: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the server name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Keep the registry database under `dir`
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-peer outbound queue capacity (at least 1)
    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    /// Set the largest accepted frame body
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Path of the database file, if a store directory is configured
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_dir.as_ref().map(|dir| dir.join(STORE_FILE_NAME))
    }
}
