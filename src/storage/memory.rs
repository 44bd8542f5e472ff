//! In-process two-key store

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use crate::error::{Error, Result};

use super::{StoreEntry, TwoKeyStore};

type Key = (String, String);

#[derive(Debug, Default)]
struct Tables {
    /// `(owner, service id) -> value`
    entries: BTreeMap<Key, Bytes>,
    /// `(service id, owner)`, kept in step with `entries`
    by_service: BTreeSet<Key>,
}

impl Tables {
    fn insert(&mut self, owner: &str, service_id: &str, value: Bytes) {
        self.entries
            .insert((owner.to_string(), service_id.to_string()), value);
        self.by_service
            .insert((service_id.to_string(), owner.to_string()));
    }

    fn remove(&mut self, owner: &str, service_id: &str) -> Option<Bytes> {
        self.by_service
            .remove(&(service_id.to_string(), owner.to_string()));
        self.entries
            .remove(&(owner.to_string(), service_id.to_string()))
    }
}

/// `BTreeMap`-backed store
///
/// Keys are ordered by owner first, so owner-scoped operations are range
/// scans; a second ordered set answers lookups by service id. Nothing
/// survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))
    }
}

fn first_key_range(first: &str) -> std::ops::RangeFrom<Key> {
    (first.to_string(), String::new())..
}

fn to_entry((owner, service_id): &Key, value: &Bytes) -> StoreEntry {
    StoreEntry {
        owner: owner.clone(),
        service_id: service_id.clone(),
        value: value.clone(),
    }
}

impl TwoKeyStore for MemoryStore {
    fn upsert(&self, owner: &str, service_id: &str, value: Bytes) -> Result<()> {
        self.write()?.insert(owner, service_id, value);
        Ok(())
    }

    fn get(&self, owner: &str, service_id: &str) -> Result<Option<Bytes>> {
        Ok(self
            .read()?
            .entries
            .get(&(owner.to_string(), service_id.to_string()))
            .cloned())
    }

    fn delete(&self, owner: &str, service_id: &str) -> Result<()> {
        self.write()?.remove(owner, service_id);
        Ok(())
    }

    fn delete_all_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>> {
        let mut tables = self.write()?;
        let keys: Vec<Key> = tables
            .entries
            .range(first_key_range(owner))
            .take_while(|((o, _), _)| o == owner)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = tables.remove(&key.0, &key.1) {
                removed.push(to_entry(&key, &value));
            }
        }
        Ok(removed)
    }

    fn entries_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>> {
        Ok(self
            .read()?
            .entries
            .range(first_key_range(owner))
            .take_while(|((o, _), _)| o == owner)
            .map(|(k, v)| to_entry(k, v))
            .collect())
    }

    fn entries(&self) -> Result<Vec<StoreEntry>> {
        Ok(self
            .read()?
            .entries
            .iter()
            .map(|(k, v)| to_entry(k, v))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let mut tables = self.write()?;
        tables.entries.clear();
        tables.by_service.clear();
        Ok(())
    }

    fn find_second(&self, service_id: &str) -> Result<Option<StoreEntry>> {
        let tables = self.read()?;
        let Some((_, owner)) = tables
            .by_service
            .range(first_key_range(service_id))
            .next()
            .filter(|(id, _)| id == service_id)
        else {
            return Ok(None);
        };

        let key = (owner.clone(), service_id.to_string());
        Ok(tables.entries.get(&key).map(|value| to_entry(&key, value)))
    }
}
