//! Local mirror of the registry
//!
//! A flat `service id -> ServiceInfo` map that always holds the last value
//! applied for each id. Backed by `DashMap`, so readers and writers on
//! different tasks never take a registry-wide lock.

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::model::ServiceInfo;

/// Concurrent service map
#[derive(Debug, Default)]
pub struct ServiceMirror {
    services: DashMap<String, ServiceInfo>,
}

impl ServiceMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service
    pub fn put(&self, info: ServiceInfo) {
        self.services.insert(info.id.clone(), info);
    }

    /// Service by id
    pub fn get(&self, id: &str) -> Result<ServiceInfo> {
        self.services
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotFound)
    }

    /// Remove a service, returning it if it was present
    pub fn delete(&self, id: &str) -> Option<ServiceInfo> {
        self.services.remove(id).map(|(_, info)| info)
    }

    /// Snapshot of every service, in no particular order
    pub fn list(&self) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of the services of one type
    pub fn filter_by_type(&self, service_type: u32) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .filter(|entry| entry.value().service_type == service_type)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Some service of the given type
    ///
    /// When several match, which one is returned is unspecified.
    pub fn first_of_type(&self, service_type: u32) -> Result<ServiceInfo> {
        self.services
            .iter()
            .find(|entry| entry.value().service_type == service_type)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotFound)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
