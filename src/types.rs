//! Affinity-level core types
//!
//! These types are shared by the ownership store, the filter and the cache
//! backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one running server process
///
/// Generated once at startup and never reused across restarts, so a record
/// written by a previous incarnation listening on the same address can be
/// told apart from one written by this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a fresh random identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The cached fact "instance X, reachable at address A, owns session S"
///
/// Wire format (see [`crate::affinity::codec`]):
/// `{"ownerId": "...", "address": "http://10.0.1.5:5000", "claimedAt": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRecord {
    /// Instance that owns the session
    pub owner_id: OwnerId,

    /// Base URI (`scheme://host:port`) the owner accepts forwarded requests on
    pub address: String,

    /// When the claim was made. Informational only, never used for expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OwnershipRecord {
    /// Record claiming ownership for `owner_id` as of now
    pub fn claim(owner_id: OwnerId, address: impl Into<String>) -> Self {
        Self {
            owner_id,
            address: address.into(),
            claimed_at: Some(Utc::now()),
        }
    }

    pub fn is_owned_by(&self, owner_id: &OwnerId) -> bool {
        &self.owner_id == owner_id
    }
}

impl fmt::Display for OwnershipRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner_id, self.address)
    }
}
