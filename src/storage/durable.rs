//! redb-backed two-key store
//!
//! All registrations live in one table keyed by `"{owner}\0{service_id}"`.
//! Owner keys never contain NUL, so the entries of one owner form the
//! contiguous key range `"{owner}\0" .. "{owner}\x01"`. A second table
//! keyed `(service_id, owner)` is updated in the same transactions and
//! answers lookups by service id.

use std::path::Path;

use bytes::Bytes;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};

use super::{StoreEntry, TwoKeyStore};

/// Registrations keyed by `{owner}\0{service_id}`, JSON service values
const REGISTRY: TableDefinition<&str, &[u8]> = TableDefinition::new("registry");

/// Service id index: `(service_id, owner)`
const BY_SERVICE: TableDefinition<(&str, &str), ()> = TableDefinition::new("by_service");

const KEY_SEPARATOR: char = '\0';

/// Durable store on a redb database
pub struct DurableStore {
    db: Database,
}

impl DurableStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "Registry database opened");
        Self::init(db)
    }

    /// Database held entirely in memory
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        // Create the tables up front so read transactions can always open them
        let txn = db.begin_write()?;
        {
            txn.open_table(REGISTRY)?;
            txn.open_table(BY_SERVICE)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }
}

fn composite_key(owner: &str, service_id: &str) -> Result<String> {
    if owner.contains(KEY_SEPARATOR) {
        return Err(Error::Storage(format!("owner key {:?} contains NUL", owner)));
    }
    Ok(format!("{}{}{}", owner, KEY_SEPARATOR, service_id))
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
}

fn owner_bounds(owner: &str) -> (String, String) {
    (format!("{}\u{0}", owner), format!("{}\u{1}", owner))
}

fn to_entry(key: &str, value: &[u8]) -> Result<StoreEntry> {
    let (owner, service_id) =
        split_key(key).ok_or_else(|| Error::Storage(format!("corrupt registry key {:?}", key)))?;
    Ok(StoreEntry {
        owner: owner.to_string(),
        service_id: service_id.to_string(),
        value: Bytes::copy_from_slice(value),
    })
}

impl TwoKeyStore for DurableStore {
    fn upsert(&self, owner: &str, service_id: &str, value: Bytes) -> Result<()> {
        let key = composite_key(owner, service_id)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(REGISTRY)?;
            table.insert(key.as_str(), &value[..])?;
            let mut index = txn.open_table(BY_SERVICE)?;
            index.insert((service_id, owner), ())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, owner: &str, service_id: &str) -> Result<Option<Bytes>> {
        let key = composite_key(owner, service_id)?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REGISTRY)?;
        let value = table
            .get(key.as_str())?
            .map(|guard| Bytes::copy_from_slice(guard.value()));
        Ok(value)
    }

    fn delete(&self, owner: &str, service_id: &str) -> Result<()> {
        let key = composite_key(owner, service_id)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(REGISTRY)?;
            table.remove(key.as_str())?;
            let mut index = txn.open_table(BY_SERVICE)?;
            index.remove((service_id, owner))?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_all_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>> {
        let (lo, hi) = owner_bounds(owner);
        let txn = self.db.begin_write()?;
        let mut removed = Vec::new();
        {
            let mut table = txn.open_table(REGISTRY)?;
            for item in table.range(lo.as_str()..hi.as_str())? {
                let (key, value) = item?;
                removed.push(to_entry(key.value(), value.value())?);
            }
            let mut index = txn.open_table(BY_SERVICE)?;
            for entry in &removed {
                table.remove(composite_key(&entry.owner, &entry.service_id)?.as_str())?;
                index.remove((entry.service_id.as_str(), entry.owner.as_str()))?;
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    fn entries_for_first(&self, owner: &str) -> Result<Vec<StoreEntry>> {
        let (lo, hi) = owner_bounds(owner);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REGISTRY)?;

        let mut entries = Vec::new();
        for item in table.range(lo.as_str()..hi.as_str())? {
            let (key, value) = item?;
            entries.push(to_entry(key.value(), value.value())?);
        }
        Ok(entries)
    }

    fn entries(&self) -> Result<Vec<StoreEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REGISTRY)?;

        let mut entries = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            entries.push(to_entry(key.value(), value.value())?);
        }
        Ok(entries)
    }

    fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(REGISTRY)?;
            let mut keys = Vec::new();
            for item in table.iter()? {
                let (key, _) = item?;
                keys.push(key.value().to_string());
            }
            for key in &keys {
                table.remove(key.as_str())?;
            }

            let mut index = txn.open_table(BY_SERVICE)?;
            let mut pairs = Vec::new();
            for item in index.iter()? {
                let (key, _) = item?;
                let (service_id, owner) = key.value();
                pairs.push((service_id.to_string(), owner.to_string()));
            }
            for (service_id, owner) in &pairs {
                index.remove((service_id.as_str(), owner.as_str()))?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn find_second(&self, service_id: &str) -> Result<Option<StoreEntry>> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(BY_SERVICE)?;

        let owner = match index.range((service_id, "")..)?.next() {
            Some(item) => {
                let (key, _) = item?;
                let (id, owner) = key.value();
                if id != service_id {
                    return Ok(None);
                }
                owner.to_string()
            }
            None => return Ok(None),
        };

        let table = txn.open_table(REGISTRY)?;
        let key = composite_key(&owner, service_id)?;
        let value = table.get(key.as_str())?;
        Ok(value.map(|guard| StoreEntry {
            owner,
            service_id: service_id.to_string(),
            value: Bytes::copy_from_slice(guard.value()),
        }))
    }
}
