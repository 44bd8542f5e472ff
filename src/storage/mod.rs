//! Two-key registry storage
//!
//! The server keeps every registration under `(owner, service id)`. The
//! owner half lets it answer "what did connection X register" and drop all
//! of it in one call when X goes away; the service half answers "what is
//! the current value of service Y".
//!
//! Values are the serialized [`ServiceInfo`](crate::model::ServiceInfo)
//! bytes; the store never interprets them.

pub mod durable;
pub mod memory;

use bytes::Bytes;

use crate::error::Result;

pub use durable::DurableStore;
pub use memory::MemoryStore;

/// One stored registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Owner key (first key)
    pub owner: String,
    /// Service id (second key)
    pub service_id: String,
    /// Encoded service
    pub value: Bytes,
}

/// Durable mapping `(owner, service id) -> encoded service`
///
/// Every operation is a short, self-contained transaction. Enumerations
/// return owned snapshots, so nothing stays open after the call returns.
pub trait TwoKeyStore: Send + Sync {
    /// Insert or replace one entry
    fn upsert(&self, owner: &str, service_id: &str, value: Bytes) -> Result<()>;

    /// Value stored under both keys
    fn get(&self, owner: &str, service_id: &str) -> Result<Option<Bytes>>;

    /// Remove one entry; removing a missing entry is not an error
    fn delete(&self, owner: &str, service_id: &str) -> Result<()>;

    /// Remove every entry of `owner`, returning what was removed
    fn delete_all_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>>;

    /// Every entry of `owner`
    fn entries_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>>;

    /// Every entry
    fn entries(&self) -> Result<Vec<StoreEntry>>;

    /// Remove everything
    fn clear(&self) -> Result<()>;

    /// Some entry for `service_id`, under any owner
    ///
    /// Served from a service-id index, without scanning other services.
    fn find_second(&self, service_id: &str) -> Result<Option<StoreEntry>>;
}
