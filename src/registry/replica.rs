//! Shared replicated-registry core
//!
//! The client agent and the server hub differ only in where they keep
//! services ([`RegistryBackend`]) and how they push changes out
//! ([`MessageSender`]). Applying a message, publishing its event and every
//! read operation live here once.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{ConnectionInfo, Event, EventType, Node, Protocol, ServiceInfo};
use crate::protocol::{RegistryMessage, SyncMessage};

use super::backend::RegistryBackend;
use super::dispatch::{EventDispatcher, EventHandler, SubscriptionId};
use super::owner::OwnerKey;

/// Outbound side of a replica
pub trait MessageSender: Send + Sync {
    /// Push one message towards the other replicas
    fn send(&self, msg: SyncMessage) -> impl Future<Output = Result<()>> + Send;
}

impl<T: MessageSender> MessageSender for Arc<T> {
    fn send(&self, msg: SyncMessage) -> impl Future<Output = Result<()>> + Send {
        (**self).send(msg)
    }
}

/// One replica of the registry
pub struct Replica<B, S> {
    backend: B,
    sender: S,
    events: EventDispatcher,
    owner: OwnerKey,
    distinguish_updates: bool,
}

impl<B: RegistryBackend, S: MessageSender> Replica<B, S> {
    /// Replica whose own changes are recorded under `owner`
    pub fn new(backend: B, sender: S, owner: OwnerKey) -> Self {
        Self {
            backend,
            sender,
            events: EventDispatcher::new(),
            owner,
            distinguish_updates: false,
        }
    }

    /// Report a Register for an id the owner already holds as an Update
    pub fn distinguish_updates(mut self, enabled: bool) -> Self {
        self.distinguish_updates = enabled;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Owner key of locally originated changes
    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }

    /// Commit `msg` on behalf of `owner` and publish the resulting event
    ///
    /// Returns `None` when a node removal names a service `owner` does not
    /// hold; nothing is committed or published in that case.
    pub fn apply(&self, owner: &OwnerKey, msg: &RegistryMessage) -> Result<Option<Event>> {
        let event = match msg {
            RegistryMessage::Register(info) | RegistryMessage::Update(info) => {
                let existed = self.distinguish_updates
                    && matches!(msg, RegistryMessage::Register(_))
                    && self.backend.load(owner, &info.id)?.is_some();

                self.backend.put(owner, info)?;

                let mut event = msg.event(Some(info.clone()));
                if existed {
                    event.event_type = EventType::Update;
                }
                event
            }
            RegistryMessage::Deregister { id } => {
                self.backend.remove(owner, id)?;
                msg.event(None)
            }
            RegistryMessage::DeregisterNode { id, nodes } => {
                let Some(mut info) = self.backend.load(owner, id)? else {
                    return Ok(None);
                };
                let removed = info.remove_nodes(nodes);
                self.backend.put(owner, &info)?;
                tracing::debug!(service = %id, removed = removed, "Nodes removed");
                msg.event(Some(info))
            }
        };

        self.events.publish(event.clone());
        Ok(Some(event))
    }

    /// Apply `msg` as a local change, then send it out
    ///
    /// A node removal for an unknown service fails with
    /// [`Error::NotFound`] and sends nothing. A send failure is returned
    /// after the local change has been kept.
    pub async fn submit(&self, msg: RegistryMessage) -> Result<Event> {
        let wire = msg.encode()?;
        let event = self.apply(&self.owner, &msg)?.ok_or(Error::NotFound)?;
        self.sender.send(wire).await?;
        Ok(event)
    }

    /// Register an event handler
    pub fn subscribe<H: EventHandler>(&self, handler: H) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    /// Remove an event handler
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Service by id
    pub fn get_service(&self, id: &str) -> Result<ServiceInfo> {
        self.backend.lookup(id)?.ok_or(Error::NotFound)
    }

    /// One node of a service
    pub fn get_node(&self, id: &str, node_id: &str) -> Result<Node> {
        self.get_service(id)?
            .node(node_id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Certificate attached to a service
    pub fn certificate(&self, id: &str) -> Result<Bytes> {
        let info = self.get_service(id)?;
        info.certificate()
            .map(|pem| Bytes::copy_from_slice(pem.as_bytes()))
            .ok_or(Error::NotFound)
    }

    /// Address and certificate for reaching a service over `protocol`
    pub fn connection_info(&self, id: &str, protocol: Protocol) -> Result<ConnectionInfo> {
        self.get_service(id)?
            .connection_info(protocol)
            .ok_or(Error::NotFound)
    }

    /// Every service of one type
    pub fn services_of_type(&self, service_type: u32) -> Result<Vec<ServiceInfo>> {
        Ok(self
            .backend
            .services()?
            .into_iter()
            .filter(|info| info.service_type == service_type)
            .collect())
    }

    /// Some service of one type
    pub fn first_of_type(&self, service_type: u32) -> Result<ServiceInfo> {
        self.backend
            .services()?
            .into_iter()
            .find(|info| info.service_type == service_type)
            .ok_or(Error::NotFound)
    }

    /// Every known service
    pub fn services(&self) -> Result<Vec<ServiceInfo>> {
        self.backend.services()
    }
}
