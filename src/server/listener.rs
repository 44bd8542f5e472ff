//! Registry server listener
//!
//! Handles the TCP accept loop and spawns a task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::storage::{DurableStore, TwoKeyStore};

use super::config::ServerConfig;
use super::connection;
use super::hub::RegistryHub;
use super::peers::PeerInfo;

/// Running registry server
///
/// The accept loop runs on its own task from [`start`](Self::start) until
/// [`stop`](Self::stop) or drop.
pub struct RegistryServer {
    hub: Arc<RegistryHub>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RegistryServer {
    /// Open the configured store, bind and start accepting peers
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn TwoKeyStore> = match config.store_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                Arc::new(DurableStore::open(&path)?)
            }
            None => Arc::new(DurableStore::in_memory()?),
        };
        Self::with_store(config, store).await
    }

    /// Start on a caller-provided store
    ///
    /// The store is cleared first: no peer is connected yet, so every entry
    /// in it belongs to a connection that no longer exists.
    pub async fn with_store(config: ServerConfig, store: Arc<dyn TwoKeyStore>) -> Result<Self> {
        store.clear()?;

        let hub = Arc::new(RegistryHub::new(&config.name, store));
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, name = %config.name, "Registry server listening");

        let acceptor = Acceptor::new(config, Arc::clone(&hub));
        let accept_task = tokio::spawn(acceptor.run(listener));

        Ok(Self {
            hub,
            local_addr,
            accept_task,
        })
    }

    /// The registry served by this server
    pub fn hub(&self) -> &Arc<RegistryHub> {
        &self.hub
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every peer connection
    pub fn stop(&self) {
        if !self.accept_task.is_finished() {
            tracing::info!(addr = %self.local_addr, "Registry server stopping");
        }
        self.accept_task.abort();
        self.hub.disconnect_all();
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Acceptor {
    config: ServerConfig,
    hub: Arc<RegistryHub>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Acceptor {
    fn new(config: ServerConfig, hub: Arc<RegistryHub>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            hub,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let config = self.config.clone();
        let hub = Arc::clone(&self.hub);
        let peer = PeerInfo::new(session_id, peer_addr);

        tokio::spawn(async move {
            let _permit = permit;
            connection::serve(hub, socket, peer, &config).await;
            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }
}
