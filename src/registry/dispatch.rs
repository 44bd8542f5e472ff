//! Event fan-out to subscribers
//!
//! `publish` snapshots the handler map and hands each handler its own
//! task, so a slow or panicking handler holds up neither the other
//! handlers nor the code that produced the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::model::Event;

/// Receiver of registry events
///
/// Implemented for any `Fn(&Event)` closure.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Token returned by [`EventDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscriber registry
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<SubscriptionId, Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler
    pub fn subscribe<H: EventHandler>(&self, handler: H) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(handler));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `event` to every handler registered right now
    ///
    /// Each delivery runs on its own tokio task. Outside a runtime the
    /// handlers are called inline. Returns the number of handlers targeted.
    pub fn publish(&self, event: Event) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        if handlers.is_empty() {
            return 0;
        }

        let count = handlers.len();
        let event = Arc::new(event);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                for handler in handlers {
                    let event = Arc::clone(&event);
                    runtime.spawn(async move { handler.handle(&event) });
                }
            }
            Err(_) => {
                for handler in handlers {
                    handler.handle(&event);
                }
            }
        }

        count
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
