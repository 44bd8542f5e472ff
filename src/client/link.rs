//! Outbound link to the registry server
//!
//! Holds the outbound queue of the current connection, if any. Sends fail
//! fast while disconnected; the reconnect resync repairs what was missed.

use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::SyncMessage;
use crate::registry::MessageSender;

/// Sender half of the client connection
#[derive(Debug, Default)]
pub struct ClientLink {
    current: RwLock<Option<mpsc::Sender<SyncMessage>>>,
}

impl ClientLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sends into `tx`
    pub(crate) fn attach(&self, tx: mpsc::Sender<SyncMessage>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Stop routing sends; the connection's writer drains and closes
    pub(crate) fn detach(&self) {
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    #[cfg(test)]
    fn is_attached(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl MessageSender for ClientLink {
    async fn send(&self, msg: SyncMessage) -> Result<()> {
        let tx = self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::Transport("not connected".into()))?;

        tx.send(msg)
            .await
            .map_err(|_| Error::Transport("connection closed".into()))
    }
}
