//! Identity types for records, zones and subscriptions
//!
//! Every identity check in the engine goes through these types. Two records
//! are the same record when their `RecordId`s are equal, never because two
//! handles happen to point at the same allocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Zone name reserved for the implicit default zone of a scope.
pub const DEFAULT_ZONE_NAME: &str = "_defaultZone";

/// Owner name the remote store uses for zones owned by the current user.
pub const DEFAULT_OWNER_NAME: &str = "__defaultOwner__";

/// Identifies a record zone: a named partition of records owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    pub name: String,
    pub owner: String,
}

impl ZoneId {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// The implicit default zone. It always exists and is never created or
    /// deleted independently.
    pub fn default_zone() -> Self {
        Self::new(DEFAULT_ZONE_NAME, DEFAULT_OWNER_NAME)
    }

    /// Returns true if this is the implicit default zone.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_ZONE_NAME && self.owner == DEFAULT_OWNER_NAME
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.owner)
    }
}

/// Stable identifier of a record: a record name unique within its zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub name: String,
    pub zone: ZoneId,
}

impl RecordId {
    pub fn new(name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }

    /// Mint a fresh record id in the given zone (UUIDv7, timestamp-sortable).
    pub fn generate(zone: ZoneId) -> Self {
        Self::new(Uuid::now_v7().to_string(), zone)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.zone)
    }
}

/// Identity of a remote-store user (a record creator or share participant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a push subscription registered with the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a delivered change notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque server-issued cursor marking a sync position.
///
/// The engine never looks inside a token; it only stores the latest one the
/// server handed out and presents it again to resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

impl ChangeToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
