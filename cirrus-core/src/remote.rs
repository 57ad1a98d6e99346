//! The remote record store contract
//!
//! The engine never speaks a wire protocol. It drives an implementation of
//! `RemoteStore`, which may fail, return partial results, and deliver change
//! notifications at least once and possibly coalesced.

use crate::enums::DatabaseScope;
use crate::error::RemoteError;
use crate::identity::{ChangeToken, NotificationId, RecordId, SubscriptionId, ZoneId};
use crate::record::RemoteRecord;
use crate::zone::RecordZone;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// QUERIES
// ============================================================================

/// Filter applied by `fetch_records`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    All,
    /// `field == target`
    ReferenceEquals { field: String, target: RecordId },
    /// `NOT (field IN targets)`; records with no value in `field` match.
    ReferenceNotIn { field: String, targets: Vec<RecordId> },
}

impl Predicate {
    /// Evaluate against a record. Used by in-process store implementations.
    pub fn matches(&self, record: &RemoteRecord) -> bool {
        match self {
            Predicate::All => true,
            Predicate::ReferenceEquals { field, target } => {
                record.reference_field(field) == Some(target)
            }
            Predicate::ReferenceNotIn { field, targets } => match record.reference_field(field) {
                Some(id) => !targets.contains(id),
                None => true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub record_type: String,
    pub zone: ZoneId,
    pub predicate: Predicate,
    pub sort: Option<SortKey>,
}

impl RecordQuery {
    pub fn new(record_type: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            record_type: record_type.into(),
            zone,
            predicate: Predicate::All,
            sort: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortKey {
            field: field.into(),
            ascending: true,
        });
        self
    }
}

/// Opaque continuation for a paged query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordPage {
    pub records: Vec<RemoteRecord>,
    /// `Some` while more pages remain.
    pub cursor: Option<QueryCursor>,
}

/// Result of a fetch-by-id. Records that could be fetched are returned even
/// when others failed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordsById {
    pub records: Vec<RemoteRecord>,
    pub failure: Option<RemoteError>,
}

// ============================================================================
// DELTAS
// ============================================================================

/// One page of scope-level zone changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDeltaPage {
    pub changed: Vec<ZoneId>,
    pub deleted: Vec<ZoneId>,
    pub new_token: ChangeToken,
    pub more_coming: bool,
}

/// One page of record changes inside a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDeltaPage {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
    pub new_token: ChangeToken,
    pub more_coming: bool,
}

// ============================================================================
// MODIFICATIONS
// ============================================================================

/// How the server should treat a save that is based on an old version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavePolicy {
    /// Reject with `ServerRecordChanged` if the server version moved on.
    IfServerRecordUnchanged,
    /// Overwrite whatever the server holds.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyRecordsOutcome {
    pub saved: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyZonesOutcome {
    pub saved: Vec<RecordZone>,
    pub deleted: Vec<ZoneId>,
}

// ============================================================================
// SUBSCRIPTIONS & NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subscription {
    /// Zone-level changes anywhere in a scope.
    Database { id: SubscriptionId },
    /// Record changes inside one zone.
    RecordZone { id: SubscriptionId, zone: ZoneId },
    /// Record changes matching a query.
    Query {
        id: SubscriptionId,
        zone: ZoneId,
        record_type: String,
    },
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        match self {
            Subscription::Database { id } => id,
            Subscription::RecordZone { id, .. } => id,
            Subscription::Query { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Created,
    Updated,
    Deleted,
    /// A read receipt with no record payload.
    Read,
}

/// A delivered record-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub scope: DatabaseScope,
    pub record_id: Option<RecordId>,
    pub subscription_id: Option<SubscriptionId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationBatch {
    pub notifications: Vec<ChangeNotification>,
    pub new_token: Option<ChangeToken>,
    pub more_coming: bool,
}

/// A push delivered by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushNotification {
    Database {
        subscription_id: SubscriptionId,
        scope: DatabaseScope,
    },
    RecordZone {
        subscription_id: SubscriptionId,
        scope: DatabaseScope,
        zone: ZoneId,
    },
    Query(ChangeNotification),
    ReadNotification { id: NotificationId },
}

impl PushNotification {
    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            PushNotification::Database { subscription_id, .. } => Some(subscription_id),
            PushNotification::RecordZone { subscription_id, .. } => Some(subscription_id),
            PushNotification::Query(notification) => notification.subscription_id.as_ref(),
            PushNotification::ReadNotification { .. } => None,
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Abstract remote record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_records(
        &self,
        scope: DatabaseScope,
        query: &RecordQuery,
        cursor: Option<QueryCursor>,
    ) -> Result<RecordPage, RemoteError>;

    async fn fetch_records_by_id(
        &self,
        scope: DatabaseScope,
        ids: &[RecordId],
    ) -> Result<RecordsById, RemoteError>;

    async fn fetch_zone_deltas(
        &self,
        scope: DatabaseScope,
        token: Option<ChangeToken>,
    ) -> Result<ZoneDeltaPage, RemoteError>;

    async fn fetch_zones(
        &self,
        scope: DatabaseScope,
        ids: &[ZoneId],
    ) -> Result<Vec<RecordZone>, RemoteError>;

    async fn fetch_record_deltas(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        token: Option<ChangeToken>,
    ) -> Result<RecordDeltaPage, RemoteError>;

    async fn modify_records(
        &self,
        scope: DatabaseScope,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> Result<ModifyRecordsOutcome, RemoteError>;

    async fn modify_zones(
        &self,
        scope: DatabaseScope,
        save: Vec<RecordZone>,
        delete: Vec<ZoneId>,
    ) -> Result<ModifyZonesOutcome, RemoteError>;

    async fn subscribe(
        &self,
        scope: DatabaseScope,
        subscription: Subscription,
    ) -> Result<(), RemoteError>;

    async fn unsubscribe(
        &self,
        scope: DatabaseScope,
        id: &SubscriptionId,
    ) -> Result<(), RemoteError>;

    async fn drain_notifications(
        &self,
        token: Option<ChangeToken>,
    ) -> Result<NotificationBatch, RemoteError>;

    async fn mark_notifications_consumed(&self, ids: &[NotificationId]) -> Result<(), RemoteError>;
}
