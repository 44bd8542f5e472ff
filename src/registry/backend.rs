//! Where a replica keeps its services
//!
//! Clients keep a flat [`ServiceMirror`]; the server keeps the owner-scoped
//! [`TwoKeyStore`]. [`RegistryBackend`] is the part of both that the shared
//! apply and read paths need.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::model::ServiceInfo;
use crate::storage::{StoreEntry, TwoKeyStore};

use super::mirror::ServiceMirror;
use super::owner::OwnerKey;

/// Storage seam of a [`Replica`](super::Replica)
pub trait RegistryBackend: Send + Sync {
    /// Insert or replace `info` on behalf of `owner`
    fn put(&self, owner: &OwnerKey, info: &ServiceInfo) -> Result<()>;

    /// The value `owner` holds for `id`
    fn load(&self, owner: &OwnerKey, id: &str) -> Result<Option<ServiceInfo>>;

    /// Drop `owner`'s value for `id`; missing entries are not an error
    fn remove(&self, owner: &OwnerKey, id: &str) -> Result<()>;

    /// Current value of `id`, whoever owns it
    fn lookup(&self, id: &str) -> Result<Option<ServiceInfo>>;

    /// Every known service, one value per id
    fn services(&self) -> Result<Vec<ServiceInfo>>;
}

/// The mirror ignores owners: it holds the last value applied per id
impl RegistryBackend for ServiceMirror {
    fn put(&self, _owner: &OwnerKey, info: &ServiceInfo) -> Result<()> {
        ServiceMirror::put(self, info.clone());
        Ok(())
    }

    fn load(&self, _owner: &OwnerKey, id: &str) -> Result<Option<ServiceInfo>> {
        Ok(self.get(id).ok())
    }

    fn remove(&self, _owner: &OwnerKey, id: &str) -> Result<()> {
        self.delete(id);
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Option<ServiceInfo>> {
        Ok(self.get(id).ok())
    }

    fn services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.list())
    }
}

/// Owner-scoped backend on a two-key store
///
/// Values are stored as the JSON encoding of [`ServiceInfo`].
#[derive(Clone)]
pub struct StoreBackend {
    store: Arc<dyn TwoKeyStore>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn TwoKeyStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn TwoKeyStore> {
        &self.store
    }

    fn decode_entry(entry: &StoreEntry) -> Option<ServiceInfo> {
        match ServiceInfo::decode(&entry.value) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!(
                    owner = %entry.owner,
                    service = %entry.service_id,
                    error = %e,
                    "Skipping undecodable stored service"
                );
                None
            }
        }
    }
}

impl RegistryBackend for StoreBackend {
    fn put(&self, owner: &OwnerKey, info: &ServiceInfo) -> Result<()> {
        self.store.upsert(owner.as_str(), &info.id, info.encode()?)
    }

    fn load(&self, owner: &OwnerKey, id: &str) -> Result<Option<ServiceInfo>> {
        match self.store.get(owner.as_str(), id)? {
            Some(value) => Ok(Some(ServiceInfo::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, owner: &OwnerKey, id: &str) -> Result<()> {
        self.store.delete(owner.as_str(), id)
    }

    fn lookup(&self, id: &str) -> Result<Option<ServiceInfo>> {
        match self.store.find_second(id)? {
            Some(entry) => Ok(Some(ServiceInfo::decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    fn services(&self) -> Result<Vec<ServiceInfo>> {
        let mut seen = HashSet::new();
        Ok(self
            .store
            .entries()?
            .iter()
            .filter(|entry| seen.insert(entry.service_id.clone()))
            .filter_map(Self::decode_entry)
            .collect())
    }
}
