//! Live peer connections and broadcast
//!
//! Each peer is represented by the sending half of its outbound queue.
//! Broadcast never waits: a peer whose queue is full or closed is dropped
//! from the set, which ends its writer task and closes the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::Result;
use crate::protocol::SyncMessage;
use crate::registry::{MessageSender, OwnerKey};

/// Identity of one peer connection
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Unique session ID
    pub session_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,
}

impl PeerInfo {
    pub fn new(session_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
        }
    }

    /// Owner key of everything this peer registers
    pub fn owner(&self) -> OwnerKey {
        OwnerKey::peer(self.session_id)
    }
}

type PeerMap = HashMap<u64, mpsc::Sender<SyncMessage>>;

/// Outbound queues of the live peers
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<PeerMap>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerMap> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerMap> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start delivering broadcasts to a peer
    pub fn insert(&self, session_id: u64, tx: mpsc::Sender<SyncMessage>) {
        self.write().insert(session_id, tx);
    }

    /// Stop delivering to a peer; returns whether it was present
    pub fn remove(&self, session_id: u64) -> bool {
        self.write().remove(&session_id).is_some()
    }

    #[cfg(test)]
    fn contains(&self, session_id: u64) -> bool {
        self.read().contains_key(&session_id)
    }

    /// Number of live peers
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every peer, closing their connections
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Queue `msg` for every peer except `except`
    ///
    /// Returns the number of peers the message was queued for.
    pub fn broadcast_except(&self, msg: &SyncMessage, except: Option<u64>) -> usize {
        let mut delivered = 0;
        let mut evicted = Vec::new();

        {
            let peers = self.read();
            for (&session_id, tx) in peers.iter() {
                if Some(session_id) == except {
                    continue;
                }
                match tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            session_id = session_id,
                            "Evicting peer: outbound queue full"
                        );
                        evicted.push(session_id);
                    }
                    Err(TrySendError::Closed(_)) => evicted.push(session_id),
                }
            }
        }

        if !evicted.is_empty() {
            let mut peers = self.write();
            for session_id in evicted {
                peers.remove(&session_id);
            }
        }

        tracing::debug!(
            kind = %msg.kind,
            service = %msg.id,
            peers = delivered,
            "Broadcast"
        );
        delivered
    }
}

impl MessageSender for PeerSet {
    async fn send(&self, msg: SyncMessage) -> Result<()> {
        self.broadcast_except(&msg, None);
        Ok(())
    }
}
