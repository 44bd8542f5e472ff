//! Client registry agent
//!
//! Keeps a mirror of the server's registry, pushes this client's own
//! registrations to the server, and re-sends them after every reconnect.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::model::{ConnectionInfo, Event, Node, Protocol, ServiceInfo};
use crate::protocol::{write_queue, FrameReader, RegistryMessage, SyncMessage};
use crate::registry::{
    EventHandler, MessageSender, OwnerKey, Replica, ServiceMirror, SubscriptionId,
};

use super::config::ClientConfig;
use super::link::ClientLink;

/// Registry client
///
/// Connects in the background and reconnects with exponential back-off
/// whenever the connection drops. Writes are applied to the local mirror
/// first; a failed send is returned to the caller but the change is kept
/// and re-sent on the next reconnect.
///
/// # Example
/// ```no_run
/// use discovery_rs::client::{ClientConfig, RegistryClient};
/// use discovery_rs::model::{Node, Protocol, ServiceInfo};
///
/// # async fn example() -> discovery_rs::error::Result<()> {
/// let client = RegistryClient::connect(ClientConfig::new("127.0.0.1:9777"));
/// client.wait_connected().await?;
///
/// let info = ServiceInfo::new("billing-1", 7)
///     .with_node(Node::new("n1", "10.0.0.5:8080", Protocol::Http));
/// client.register_service(info).await?;
///
/// let http = client.connection_info("billing-1", Protocol::Http)?;
/// println!("billing at {}", http.address);
/// # Ok(())
/// # }
/// ```
pub struct RegistryClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: ClientConfig,
    replica: Replica<ServiceMirror, ClientLink>,
    /// Registrations made through this client, re-sent on reconnect
    own: DashMap<String, ServiceInfo>,
    connected: watch::Sender<bool>,
}

impl RegistryClient {
    /// Create a client and start connecting in the background
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        let supervisor = tokio::spawn(Arc::clone(&shared).supervise());

        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Register (or replace) a service owned by this client
    ///
    /// The mirror is updated and a Register event published even if the
    /// send fails; the registration is then delivered on reconnect.
    pub async fn register_service(&self, info: ServiceInfo) -> Result<()> {
        let id = info.id.clone();
        self.shared.own.insert(id.clone(), info.clone());
        self.shared
            .replica
            .submit(RegistryMessage::Register(info))
            .await?;
        tracing::info!(service = %id, "Service registered");
        Ok(())
    }

    /// Remove a service, or only the listed nodes of it
    ///
    /// An empty `nodes` removes the whole service. Removing nodes of a
    /// service this client does not know fails with
    /// [`Error::NotFound`](crate::error::Error::NotFound).
    pub async fn deregister_service<S: AsRef<str>>(&self, id: &str, nodes: &[S]) -> Result<()> {
        let msg = if nodes.is_empty() {
            self.shared.own.remove(id);
            RegistryMessage::Deregister { id: id.to_string() }
        } else {
            if let Some(mut own) = self.shared.own.get_mut(id) {
                own.remove_nodes(nodes);
            }
            RegistryMessage::DeregisterNode {
                id: id.to_string(),
                nodes: nodes.iter().map(|n| n.as_ref().to_string()).collect(),
            }
        };

        self.shared.replica.submit(msg).await?;
        tracing::info!(service = %id, nodes = nodes.len(), "Service deregistered");
        Ok(())
    }

    pub fn get_service(&self, id: &str) -> Result<ServiceInfo> {
        self.shared.replica.get_service(id)
    }

    pub fn get_node(&self, id: &str, node_id: &str) -> Result<Node> {
        self.shared.replica.get_node(id, node_id)
    }

    pub fn certificate(&self, id: &str) -> Result<Bytes> {
        self.shared.replica.certificate(id)
    }

    /// Address of the first node speaking `protocol`, with the certificate
    pub fn connection_info(&self, id: &str, protocol: Protocol) -> Result<ConnectionInfo> {
        self.shared.replica.connection_info(id, protocol)
    }

    pub fn services_of_type(&self, service_type: u32) -> Result<Vec<ServiceInfo>> {
        self.shared.replica.services_of_type(service_type)
    }

    pub fn first_of_type(&self, service_type: u32) -> Result<ServiceInfo> {
        self.shared.replica.first_of_type(service_type)
    }

    /// Every service in the mirror
    pub fn services(&self) -> Result<Vec<ServiceInfo>> {
        self.shared.replica.services()
    }

    /// Register an event handler
    pub fn register_event_handler<H: EventHandler>(&self, handler: H) -> SubscriptionId {
        self.shared.replica.subscribe(handler)
    }

    /// Remove an event handler
    pub fn deregister_event_handler(&self, id: &SubscriptionId) -> bool {
        self.shared.replica.unsubscribe(id)
    }

    /// Whether a server connection is currently up
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Observe connection state changes
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Wait until a server connection is up
    ///
    /// Fails once the client is stopped.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.connection_state();
        loop {
            if *state.borrow_and_update() {
                return Ok(());
            }
            if self.is_stopped() {
                return Err(Error::Transport("client stopped".into()));
            }
            if state.changed().await.is_err() {
                return Err(Error::Transport("client stopped".into()));
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Drop the connection and stop reconnecting; idempotent
    pub fn stop(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = supervisor {
            handle.abort();
            self.shared.replica.sender().detach();
            self.shared.connected.send_replace(false);
            tracing::info!(server = %self.shared.config.server_addr, "Registry client stopped");
        }
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tear-down of one connection, also on cancellation
struct Session<'a> {
    shared: &'a Shared,
    writer: JoinHandle<()>,
    resync: JoinHandle<()>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.resync.abort();
        self.writer.abort();
        self.shared.replica.sender().detach();
        self.shared.connected.send_replace(false);
    }
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        let owner = OwnerKey::local(&config.name);
        let (connected, _) = watch::channel(false);

        Self {
            replica: Replica::new(ServiceMirror::new(), ClientLink::new(), owner),
            own: DashMap::new(),
            connected,
            config,
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut delay = self.config.reconnect_delay;

        loop {
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(&self.config.server_addr),
            )
            .await;

            match attempt {
                Ok(Ok(socket)) => {
                    delay = self.config.reconnect_delay;
                    self.run_connection(socket).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        server = %self.config.server_addr,
                        error = %e,
                        retry_in = ?delay,
                        "Connect failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        server = %self.config.server_addr,
                        retry_in = ?delay,
                        "Connect timed out"
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = self.config.next_delay(delay);
        }
    }

    async fn run_connection(self: &Arc<Self>, socket: TcpStream) {
        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        // The server's initial sync re-sends everything it still holds
        self.drop_foreign_entries();

        let (read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);

        let writer = tokio::spawn(async move {
            if let Err(e) = write_queue(write_half, rx).await {
                tracing::debug!(error = %e, "Write failed");
            }
        });

        self.replica.sender().attach(tx);
        self.connected.send_replace(true);
        tracing::info!(server = %self.config.server_addr, "Connected to registry server");

        let resync = tokio::spawn(Arc::clone(self).resync());
        let mut session = Session {
            shared: self.as_ref(),
            writer,
            resync,
        };

        let mut reader = FrameReader::new(read_half, self.config.max_frame_size);
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Ok(Some(msg)) => self.apply_inbound(msg),
                    Ok(None) => {
                        tracing::info!(server = %self.config.server_addr, "Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.config.server_addr, error = %e, "Connection lost");
                        break;
                    }
                },
                _ = &mut session.writer => {
                    tracing::warn!(server = %self.config.server_addr, "Connection lost: write side closed");
                    break;
                }
            }
        }
    }

    /// Forget every mirrored service not registered through this client
    ///
    /// Each one is removed through the normal apply path, so subscribers see
    /// a Deregister. Services the server still holds come back with the
    /// initial sync that follows.
    fn drop_foreign_entries(&self) {
        let foreign: Vec<String> = self
            .replica
            .backend()
            .list()
            .into_iter()
            .map(|info| info.id)
            .filter(|id| !self.own.contains_key(id))
            .collect();

        for id in &foreign {
            let msg = RegistryMessage::Deregister { id: id.clone() };
            if let Err(e) = self.replica.apply(self.replica.owner(), &msg) {
                tracing::error!(service = %id, error = %e, "Failed to drop mirrored service");
            }
        }

        if !foreign.is_empty() {
            tracing::debug!(services = foreign.len(), "Dropped mirrored services before sync");
        }
    }

    /// Re-send every registration made through this client
    ///
    /// Stops at the first failed send; the next reconnect retries.
    async fn resync(self: Arc<Self>) {
        let owned: Vec<ServiceInfo> = self.own.iter().map(|e| e.value().clone()).collect();
        let total = owned.len();

        for (sent, info) in owned.into_iter().enumerate() {
            let msg = match RegistryMessage::Register(info.clone()).encode() {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(service = %info.id, error = %e, "Cannot encode service for resync");
                    continue;
                }
            };

            if let Err(e) = self.replica.sender().send(msg).await {
                tracing::warn!(sent = sent, total = total, error = %e, "Resync aborted");
                return;
            }
            self.replica.events().publish(Event::register(info));
        }

        tracing::info!(services = total, "Resync complete");
    }

    fn apply_inbound(&self, wire: SyncMessage) {
        let msg = match RegistryMessage::decode(&wire) {
            Ok(msg) => msg,
            Err(Error::Unsupported(kind)) => {
                tracing::warn!(kind = %kind, service = %wire.id, "Ignoring unsupported message");
                return;
            }
            Err(e) => {
                tracing::error!(service = %wire.id, error = %e, "Dropping malformed message");
                return;
            }
        };

        match self.replica.apply(self.replica.owner(), &msg) {
            Ok(Some(event)) => {
                tracing::debug!(
                    service = %event.service_id,
                    event = %event.event_type,
                    "Applied server change"
                );
            }
            Ok(None) => {
                tracing::debug!(service = %msg.service_id(), "Node removal for unknown service ignored");
            }
            Err(e) => {
                tracing::error!(service = %msg.service_id(), error = %e, "Failed to apply server change");
            }
        }
    }
}
