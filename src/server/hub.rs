//! Server registry hub
//!
//! The authoritative replica. Every registration is stored under the
//! owner key of the connection that made it (or the server's own key), so
//! a connection's services can be withdrawn in one step when it goes away.
//!
//! Inbound handling and new-peer sync are ordered by `gate`: inbound
//! messages, local changes and disconnect cleanup hold it shared while they
//! commit and broadcast; a joining peer holds it exclusively only while its
//! snapshot is read and it is added to the broadcast set. Every change is
//! therefore either in the snapshot or broadcast to the new peer. Nothing
//! under the gate waits on a peer's socket or queue.
//!
//! Store transactions run on the blocking pool.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::model::{ConnectionInfo, Event, EventType, Node, Protocol, ServiceInfo};
use crate::protocol::{RegistryMessage, SyncMessage};
use crate::registry::{
    EventHandler, MessageSender, OwnerKey, Replica, StoreBackend, SubscriptionId,
};
use crate::storage::TwoKeyStore;

use super::peers::{PeerInfo, PeerSet};

type StoreReplica = Replica<StoreBackend, Arc<PeerSet>>;

/// Server side of the registry
pub struct RegistryHub {
    replica: Arc<StoreReplica>,
    peers: Arc<PeerSet>,
    gate: RwLock<()>,
}

impl RegistryHub {
    /// Hub named `name` on top of `store`
    pub fn new(name: &str, store: Arc<dyn TwoKeyStore>) -> Self {
        let peers = Arc::new(PeerSet::new());
        let replica = Replica::new(
            StoreBackend::new(store),
            Arc::clone(&peers),
            OwnerKey::local(name),
        )
        .distinguish_updates(true);

        Self {
            replica: Arc::new(replica),
            peers,
            gate: RwLock::new(()),
        }
    }

    /// Run `f` against the replica on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreReplica) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let replica = Arc::clone(&self.replica);
        tokio::task::spawn_blocking(move || f(&replica))
            .await
            .map_err(|e| Error::Storage(format!("store task failed: {}", e)))?
    }

    /// Number of live peer connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Bring a freshly connected peer up to date
    ///
    /// Adds the peer to the broadcast set and returns one Register per
    /// stored entry. The caller must write the returned snapshot to the
    /// peer before anything queued on `tx`. A store failure is logged and
    /// yields an empty snapshot; the peer then only sees changes from this
    /// point on.
    pub async fn on_new_client(
        &self,
        peer: &PeerInfo,
        tx: mpsc::Sender<SyncMessage>,
    ) -> Vec<SyncMessage> {
        let _gate = self.gate.write().await;

        let snapshot = match self
            .blocking(|replica| replica.backend().store().entries())
            .await
        {
            Ok(entries) => entries
                .into_iter()
                .map(|entry| {
                    SyncMessage::new(EventType::Register.as_str(), entry.service_id, entry.value)
                })
                .collect(),
            Err(e) => {
                tracing::error!(
                    session_id = peer.session_id,
                    error = %e,
                    "Initial sync aborted: store enumeration failed"
                );
                Vec::new()
            }
        };

        self.peers.insert(peer.session_id, tx);
        tracing::info!(
            session_id = peer.session_id,
            peer = %peer.peer_addr,
            services = snapshot.len(),
            peers = self.peers.len(),
            "Peer connected"
        );
        snapshot
    }

    /// Handle one message received from `peer`
    ///
    /// The raw message is forwarded to every other peer before the store is
    /// updated. Messages that do not decode are dropped without forwarding.
    pub async fn on_message(&self, peer: &PeerInfo, wire: SyncMessage) {
        let msg = match RegistryMessage::decode(&wire) {
            Ok(msg) => msg,
            Err(Error::Unsupported(kind)) => {
                tracing::warn!(
                    session_id = peer.session_id,
                    kind = %kind,
                    "Ignoring unsupported message"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    session_id = peer.session_id,
                    service = %wire.id,
                    error = %e,
                    "Dropping malformed message"
                );
                return;
            }
        };

        let _gate = self.gate.read().await;
        self.peers.broadcast_except(&wire, Some(peer.session_id));

        let owner = peer.owner();
        match self.blocking(move |replica| replica.apply(&owner, &msg)).await {
            Ok(Some(event)) => {
                tracing::debug!(
                    session_id = peer.session_id,
                    service = %event.service_id,
                    event = %event.event_type,
                    "Applied peer change"
                );
            }
            Ok(None) => {
                tracing::warn!(
                    session_id = peer.session_id,
                    service = %wire.id,
                    "Node removal for a service this peer does not hold"
                );
            }
            Err(e) => {
                tracing::error!(
                    session_id = peer.session_id,
                    service = %wire.id,
                    error = %e,
                    "Failed to apply peer change"
                );
            }
        }
    }

    /// Withdraw everything `peer` registered
    ///
    /// Each removed service is announced to the remaining peers: as a
    /// Deregister, or as an Update carrying the surviving value when
    /// another owner still holds the same id.
    pub async fn on_client_quit(&self, peer: &PeerInfo) {
        let _gate = self.gate.read().await;
        self.peers.remove(peer.session_id);

        let owner = peer.owner();
        let announcements = match self
            .blocking(move |replica| withdraw(&**replica.backend().store(), &owner))
            .await
        {
            Ok(announcements) => announcements,
            Err(e) => {
                tracing::error!(
                    session_id = peer.session_id,
                    error = %e,
                    "Failed to remove services of departed peer"
                );
                return;
            }
        };

        let removed = announcements.len();
        for (msg, event) in announcements {
            self.peers.broadcast_except(&msg, None);
            self.replica.events().publish(event);
        }

        tracing::info!(
            session_id = peer.session_id,
            peer = %peer.peer_addr,
            removed = removed,
            peers = self.peers.len(),
            "Peer disconnected"
        );
    }

    /// Close every peer connection
    pub fn disconnect_all(&self) {
        self.peers.clear();
    }

    /// Commit a server-owned change, then broadcast it
    async fn submit(&self, msg: RegistryMessage) -> Result<Event> {
        let wire = msg.encode()?;
        let owner = self.replica.owner().clone();
        let event = self
            .blocking(move |replica| replica.apply(&owner, &msg))
            .await?
            .ok_or(Error::NotFound)?;
        self.replica.sender().send(wire).await?;
        Ok(event)
    }

    /// Register a service owned by the server itself, and broadcast it
    pub async fn register_service(&self, info: ServiceInfo) -> Result<()> {
        let _gate = self.gate.read().await;
        let id = info.id.clone();
        self.submit(RegistryMessage::Register(info)).await?;
        tracing::info!(service = %id, "Service registered");
        Ok(())
    }

    /// Remove a server-owned service, or some of its nodes, and broadcast it
    ///
    /// An empty `nodes` removes the whole service.
    pub async fn deregister_service<S: AsRef<str>>(&self, id: &str, nodes: &[S]) -> Result<()> {
        let msg = if nodes.is_empty() {
            RegistryMessage::Deregister { id: id.to_string() }
        } else {
            RegistryMessage::DeregisterNode {
                id: id.to_string(),
                nodes: nodes.iter().map(|n| n.as_ref().to_string()).collect(),
            }
        };

        let _gate = self.gate.read().await;
        self.submit(msg).await?;
        tracing::info!(service = %id, nodes = nodes.len(), "Service deregistered");
        Ok(())
    }

    /// Register an event handler
    pub fn register_event_handler<H: EventHandler>(&self, handler: H) -> SubscriptionId {
        self.replica.subscribe(handler)
    }

    /// Remove an event handler
    pub fn deregister_event_handler(&self, id: &SubscriptionId) -> bool {
        self.replica.unsubscribe(id)
    }

    pub fn get_service(&self, id: &str) -> Result<ServiceInfo> {
        self.replica.get_service(id)
    }

    pub fn get_node(&self, id: &str, node_id: &str) -> Result<Node> {
        self.replica.get_node(id, node_id)
    }

    pub fn certificate(&self, id: &str) -> Result<Bytes> {
        self.replica.certificate(id)
    }

    pub fn connection_info(&self, id: &str, protocol: Protocol) -> Result<ConnectionInfo> {
        self.replica.connection_info(id, protocol)
    }

    pub fn services_of_type(&self, service_type: u32) -> Result<Vec<ServiceInfo>> {
        self.replica.services_of_type(service_type)
    }

    pub fn first_of_type(&self, service_type: u32) -> Result<ServiceInfo> {
        self.replica.first_of_type(service_type)
    }

    /// Every service in the store, one per id
    pub fn services(&self) -> Result<Vec<ServiceInfo>> {
        self.replica.services()
    }
}

/// Remove every entry of `owner` and build the announcement for each
fn withdraw(store: &dyn TwoKeyStore, owner: &OwnerKey) -> Result<Vec<(SyncMessage, Event)>> {
    let removed = store.delete_all_for_first(owner.as_str())?;
    let mut announcements = Vec::with_capacity(removed.len());

    for entry in removed {
        let survivor = match store.find_second(&entry.service_id) {
            Ok(survivor) => survivor,
            Err(e) => {
                tracing::error!(service = %entry.service_id, error = %e, "Store lookup failed");
                None
            }
        };

        let survivor = survivor.and_then(|s| match ServiceInfo::decode(&s.value) {
            Ok(info) => Some((s.value, info)),
            Err(_) => None,
        });

        announcements.push(match survivor {
            Some((value, info)) => (
                SyncMessage::new(EventType::Update.as_str(), entry.service_id.as_str(), value),
                Event::update(info),
            ),
            None => (
                SyncMessage::new(
                    EventType::Deregister.as_str(),
                    entry.service_id.as_str(),
                    Bytes::new(),
                ),
                Event::deregister(entry.service_id.as_str()),
            ),
        });
    }

    Ok(announcements)
}
