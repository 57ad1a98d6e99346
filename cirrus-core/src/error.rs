//! Error types for CIRRUS operations
//!
//! `RemoteError` is the raw failure vocabulary of the remote-store boundary.
//! It only ever reaches the classifier; everything above that boundary sees
//! `CirrusError`.

use crate::enums::DatabaseScope;
use crate::identity::{NotificationId, RecordId, SubscriptionId, ZoneId};
use crate::record::RemoteRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// REMOTE BOUNDARY
// ============================================================================

/// Kind of remote operation an error arose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    AccountStatus,
    FetchRecords,
    ModifyRecords,
    DeleteRecords,
    ModifyZones,
    DeleteZones,
    FetchZones,
    ModifySubscriptions,
    DeleteSubscriptions,
    FetchChanges,
    MarkRead,
    AcceptShare,
}

impl Operation {
    /// Delete operations treat "item not found" as success.
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Operation::DeleteRecords | Operation::DeleteZones | Operation::DeleteSubscriptions
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Operation::AccountStatus => "AccountStatus",
            Operation::FetchRecords => "FetchRecords",
            Operation::ModifyRecords => "ModifyRecords",
            Operation::DeleteRecords => "DeleteRecords",
            Operation::ModifyZones => "ModifyZones",
            Operation::DeleteZones => "DeleteZones",
            Operation::FetchZones => "FetchZones",
            Operation::ModifySubscriptions => "ModifySubscriptions",
            Operation::DeleteSubscriptions => "DeleteSubscriptions",
            Operation::FetchChanges => "FetchChanges",
            Operation::MarkRead => "MarkRead",
            Operation::AcceptShare => "AcceptShare",
        };
        write!(f, "{}", value)
    }
}

/// Failure codes reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    NetworkUnavailable,
    NetworkFailure,
    ServiceUnavailable,
    RequestRateLimited,
    ZoneBusy,
    /// The record was changed on the server since the version we based our
    /// write on.
    ServerRecordChanged,
    ZoneNotFound,
    UnknownItem,
    ChangeTokenExpired,
    /// Another item in an atomic batch failed.
    BatchRequestFailed,
    /// Envelope whose details live in the per-item map.
    PartialFailure,
    PermissionFailure,
    NotAuthenticated,
    QuotaExceeded,
    InvalidArguments,
    InternalError,
}

impl RemoteErrorCode {
    /// Failures worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteErrorCode::NetworkUnavailable
                | RemoteErrorCode::NetworkFailure
                | RemoteErrorCode::ServiceUnavailable
                | RemoteErrorCode::RequestRateLimited
                | RemoteErrorCode::ZoneBusy
        )
    }
}

/// An object a batch operation touched, used to key per-item errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AffectedItem {
    Record(RecordId),
    Zone(ZoneId),
    Subscription(SubscriptionId),
    Notification(NotificationId),
}

impl From<RecordId> for AffectedItem {
    fn from(id: RecordId) -> Self {
        AffectedItem::Record(id)
    }
}

impl From<ZoneId> for AffectedItem {
    fn from(id: ZoneId) -> Self {
        AffectedItem::Zone(id)
    }
}

impl From<SubscriptionId> for AffectedItem {
    fn from(id: SubscriptionId) -> Self {
        AffectedItem::Subscription(id)
    }
}

impl fmt::Display for AffectedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffectedItem::Record(id) => write!(f, "record {}", id),
            AffectedItem::Zone(id) => write!(f, "zone {}", id),
            AffectedItem::Subscription(id) => write!(f, "subscription {}", id),
            AffectedItem::Notification(id) => write!(f, "notification {}", id),
        }
    }
}

/// Raw failure returned by a remote-store call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
    /// Server-suggested pause before retrying.
    pub retry_after: Option<Duration>,
    /// Authoritative server copy for `ServerRecordChanged`.
    pub server_record: Option<Box<RemoteRecord>>,
    /// Per-item errors of a partial failure.
    pub partial: BTreeMap<AffectedItem, RemoteError>,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            server_record: None,
            partial: BTreeMap::new(),
        }
    }

    /// Build a partial-failure envelope from per-item errors.
    pub fn partial<I>(items: I) -> Self
    where
        I: IntoIterator<Item = (AffectedItem, RemoteError)>,
    {
        Self {
            partial: items.into_iter().collect(),
            ..Self::new(RemoteErrorCode::PartialFailure, "Partial failure")
        }
    }

    pub fn with_server_record(mut self, record: RemoteRecord) -> Self {
        self.server_record = Some(Box::new(record));
        self
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    pub fn is_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

// ============================================================================
// ENGINE ERRORS
// ============================================================================

/// Persisted-state errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors for records, zones and local requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown record type: {record_type}")]
    UnknownRecordType { record_type: String },

    #[error("Required field missing on {record_type}: {field}")]
    RequiredFieldMissing { record_type: String, field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Zone operation not allowed in {scope} scope: {reason}")]
    ZoneNotAllowed { scope: DatabaseScope, reason: String },

    #[error("The default zone cannot be created or deleted")]
    DefaultZoneImmutable,

    #[error("Record {id} is read-only for the current user")]
    ReadOnlyRecord { id: RecordId },

    #[error("Record {id} is not in the cache")]
    NotCached { id: RecordId },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Errors surfaced by the synchronization core after classification.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("Unhandled error during {operation} operation: {source}")]
    Unhandled {
        operation: Operation,
        source: RemoteError,
    },

    #[error("Permission denied during {operation} operation: {message}")]
    PermissionDenied { operation: Operation, message: String },

    #[error("Gave up on {operation} after {attempts} attempts")]
    RetriesExhausted { operation: Operation, attempts: u32 },

    #[error("Change token expired {resets} times in one fetch cycle")]
    TokenResetLimit { resets: u32 },

    #[error("Zone {zone} no longer exists")]
    ZoneNotFound { zone: ZoneId },

    #[error("Execution lane is closed")]
    LaneClosed,
}

/// Master error type for all CIRRUS errors.
#[derive(Debug, Clone, Error)]
pub enum CirrusError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type alias for CIRRUS operations.
pub type CirrusResult<T> = Result<T, CirrusError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_envelope_collects_items() {
        let zone = ZoneId::new("Work", "alice");
        let id = RecordId::new("r1", zone.clone());
        let err = RemoteError::partial([
            (
                AffectedItem::Record(id.clone()),
                RemoteError::new(RemoteErrorCode::UnknownItem, "gone"),
            ),
            (
                AffectedItem::Zone(zone),
                RemoteError::new(RemoteErrorCode::ZoneNotFound, "gone"),
            ),
        ]);
        assert!(err.is_partial());
        assert_eq!(err.code, RemoteErrorCode::PartialFailure);
        assert_eq!(
            err.partial.get(&AffectedItem::Record(id)).map(|e| e.code),
            Some(RemoteErrorCode::UnknownItem)
        );
    }

    #[test]
    fn test_transient_codes() {
        assert!(RemoteErrorCode::NetworkFailure.is_transient());
        assert!(RemoteErrorCode::RequestRateLimited.is_transient());
        assert!(!RemoteErrorCode::ServerRecordChanged.is_transient());
        assert!(!RemoteErrorCode::PermissionFailure.is_transient());
    }

    #[test]
    fn test_delete_operations() {
        assert!(Operation::DeleteRecords.is_delete());
        assert!(Operation::DeleteZones.is_delete());
        assert!(Operation::DeleteSubscriptions.is_delete());
        assert!(!Operation::ModifyRecords.is_delete());
        assert!(!Operation::FetchChanges.is_delete());
    }

    #[test]
    fn test_sync_error_display_unhandled() {
        let err = SyncError::Unhandled {
            operation: Operation::ModifyRecords,
            source: RemoteError::new(RemoteErrorCode::QuotaExceeded, "over quota"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("ModifyRecords"));
        assert!(msg.contains("over quota"));
    }

    #[test]
    fn test_validation_error_display_zone_not_allowed() {
        let err = ValidationError::ZoneNotAllowed {
            scope: DatabaseScope::Public,
            reason: "custom zones are private-only".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Public"));
        assert!(msg.contains("private-only"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "max_token_resets".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("max_token_resets"));
        assert!(msg.contains("must be at least 1"));
    }

    #[test]
    fn test_cirrus_error_from_variants() {
        let storage = CirrusError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, CirrusError::Storage(_)));

        let validation = CirrusError::from(ValidationError::DefaultZoneImmutable);
        assert!(matches!(validation, CirrusError::Validation(_)));

        let config = CirrusError::from(ConfigError::MissingRequired {
            field: "current_user".to_string(),
        });
        assert!(matches!(config, CirrusError::Config(_)));

        let sync = CirrusError::from(SyncError::LaneClosed);
        assert!(matches!(sync, CirrusError::Sync(_)));
    }
}
