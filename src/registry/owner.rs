//! Owner keys
//!
//! Every registration held by the server belongs to an owner: either one
//! live connection or the server process itself.

use std::fmt;

/// First key of the two-key store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey(String);

impl OwnerKey {
    /// Owner key of a peer connection
    pub fn peer(session_id: u64) -> Self {
        Self(format!("peer/{}", session_id))
    }

    /// Owner key for changes made by the process itself
    pub fn local(name: &str) -> Self {
        Self(format!("local/{}", name.replace('\0', "")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OwnerKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
