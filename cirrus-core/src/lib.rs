//! CIRRUS Core - Data Model and Remote Contract
//!
//! Identifiers, record and zone types, the error family, configuration, and
//! the `RemoteStore` trait. Every other crate depends on this one; it holds no
//! synchronization logic.

pub mod config;
pub mod enums;
pub mod error;
pub mod identity;
pub mod record;
pub mod remote;
pub mod zone;

pub use config::{RetryConfig, SyncConfig, MAX_LMDB_MAP_SIZE_MB};
pub use enums::{DatabaseScope, Permission};
pub use error::{
    AffectedItem, CirrusError, CirrusResult, ConfigError, Operation, RemoteError,
    RemoteErrorCode, StorageError, SyncError, ValidationError,
};
pub use identity::{
    ChangeToken, NotificationId, RecordId, SubscriptionId, Timestamp, UserId, ZoneId,
    DEFAULT_OWNER_NAME, DEFAULT_ZONE_NAME,
};
pub use record::{
    schema, ChangedRecord, FieldValue, Note, RecordVersion, RemoteRecord, Share, Topic,
};
pub use remote::{
    ChangeNotification, ModifyRecordsOutcome, ModifyZonesOutcome, NotificationBatch,
    NotificationKind, Predicate, PushNotification, QueryCursor, RecordDeltaPage, RecordPage,
    RecordQuery, RecordsById, RemoteStore, SavePolicy, SortKey, Subscription, ZoneDeltaPage,
};
pub use zone::{sort_zones, zone_order, RecordZone, ZoneCapabilities};

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
