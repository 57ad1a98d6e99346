//! CIRRUS Test Utilities
//!
//! Centralized test infrastructure for the CIRRUS workspace:
//! - `FakeRemote`, a scriptable in-process remote store
//! - Proptest generators for records and batches
//! - Fixtures for common scenarios
//! - Assertions for CIRRUS-specific results

mod fake_remote;

pub use fake_remote::{Endpoint, FakeRemote, Gate};

// Re-export core types for convenience
pub use cirrus_core::{
    ChangeNotification, ChangedRecord, CirrusError, CirrusResult, DatabaseScope, FieldValue,
    Note, NotificationId, NotificationKind, Permission, RecordId, RemoteError, RemoteErrorCode,
    RemoteRecord, Share, SubscriptionId, SyncConfig, Topic, UserId, ZoneId,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for records and reconciliation batches.
    //!
    //! Ids are drawn from small pools so that generated batches collide with
    //! each other and with cached state, which is where reconciliation bugs
    //! live.

    use super::*;
    use proptest::prelude::*;

    /// Zone every generated record lives in.
    pub fn batch_zone() -> ZoneId {
        ZoneId::new("Batch", "owner")
    }

    pub fn topic_id(n: u8) -> RecordId {
        RecordId::new(format!("topic-{}", n), batch_zone())
    }

    pub fn note_id(n: u8) -> RecordId {
        RecordId::new(format!("note-{}", n), batch_zone())
    }

    /// Share ids are derived from the record they share, so each share
    /// targets exactly one record.
    pub fn share_for(record: &RecordId) -> RecordId {
        RecordId::new(format!("share-{}", record.name), batch_zone())
    }

    pub fn arb_permission() -> impl Strategy<Value = Permission> {
        prop_oneof![Just(Permission::ReadOnly), Just(Permission::ReadWrite)]
    }

    pub fn arb_user() -> impl Strategy<Value = UserId> {
        prop_oneof![Just(UserId::new("me")), Just(UserId::new("peer"))]
    }

    /// A topic from a pool of six, optionally shared.
    pub fn arb_topic() -> impl Strategy<Value = Topic> {
        (0u8..6, "[A-F][a-z]{0,3}", proptest::option::of(arb_user()), any::<bool>()).prop_map(
            |(n, name, creator, shared)| {
                let id = topic_id(n);
                Topic {
                    share: shared.then(|| share_for(&id)),
                    id,
                    name,
                    version: None,
                    creator,
                }
            },
        )
    }

    /// A note from a pool of ten, under one of the pooled topics or none.
    pub fn arb_note() -> impl Strategy<Value = Note> {
        (
            0u8..10,
            "[a-f]{1,4}",
            proptest::option::of(0u8..6),
            proptest::option::of(arb_user()),
            any::<bool>(),
        )
            .prop_map(|(n, title, topic, creator, shared)| {
                let id = note_id(n);
                let topic = topic.map(topic_id);
                Note {
                    share: shared.then(|| share_for(&id)),
                    id,
                    title,
                    parent: topic.clone(),
                    topic,
                    version: None,
                    creator,
                }
            })
    }

    /// Share metadata for one of the pooled topics or notes.
    pub fn arb_share() -> impl Strategy<Value = Share> {
        (
            prop_oneof![(0u8..6).prop_map(topic_id), (0u8..10).prop_map(note_id)],
            proptest::option::of(arb_permission()),
        )
            .prop_map(|(target, participant_permission)| Share {
                id: share_for(&target),
                version: None,
                participant_permission,
            })
    }

    pub fn arb_changed_record() -> impl Strategy<Value = ChangedRecord> {
        prop_oneof![
            3 => arb_topic().prop_map(ChangedRecord::Topic),
            5 => arb_note().prop_map(ChangedRecord::Note),
            2 => arb_share().prop_map(ChangedRecord::Share),
        ]
    }

    pub fn arb_changed_batch() -> impl Strategy<Value = Vec<ChangedRecord>> {
        prop::collection::vec(arb_changed_record(), 0..24)
    }

    pub fn arb_deleted_batch() -> impl Strategy<Value = Vec<RecordId>> {
        prop::collection::vec(
            prop_oneof![(0u8..6).prop_map(topic_id), (0u8..10).prop_map(note_id)],
            0..8,
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records for common test scenarios.

    use super::*;
    use cirrus_core::schema;

    pub fn record_id(zone: &ZoneId, name: &str) -> RecordId {
        RecordId::new(name, zone.clone())
    }

    /// A topic whose record name equals its display name.
    pub fn topic(zone: &ZoneId, name: &str) -> Topic {
        Topic {
            id: record_id(zone, name),
            name: name.to_string(),
            version: None,
            creator: None,
            share: None,
        }
    }

    /// A note whose record name equals its title.
    pub fn note(zone: &ZoneId, title: &str, topic: Option<&Topic>) -> Note {
        Note {
            id: record_id(zone, title),
            title: title.to_string(),
            topic: topic.map(|t| t.id.clone()),
            parent: topic.map(|t| t.id.clone()),
            version: None,
            creator: None,
            share: None,
        }
    }

    /// A note shared on its own through `share-<title>`.
    pub fn shared_note(zone: &ZoneId, title: &str, topic: Option<&Topic>) -> Note {
        let mut note = note(zone, title, topic);
        note.share = Some(record_id(zone, &format!("share-{}", title)));
        note
    }

    pub fn share(id: RecordId, permission: Permission) -> Share {
        Share {
            id,
            version: None,
            participant_permission: Some(permission),
        }
    }

    pub fn remote_topic(zone: &ZoneId, name: &str) -> RemoteRecord {
        topic(zone, name).to_remote()
    }

    pub fn remote_note(zone: &ZoneId, title: &str, topic: Option<&Topic>) -> RemoteRecord {
        note(zone, title, topic).to_remote()
    }

    /// A record of a type the engine does not understand.
    pub fn foreign_record(zone: &ZoneId, name: &str) -> RemoteRecord {
        RemoteRecord::new(record_id(zone, name), "Attachment")
            .with_field(schema::TOPIC_NAME, FieldValue::String(name.to_string()))
    }

    /// A created/updated/deleted notification for `record`.
    pub fn notification(
        id: &str,
        kind: NotificationKind,
        scope: DatabaseScope,
        record: &RecordId,
        subscription: &SubscriptionId,
    ) -> ChangeNotification {
        ChangeNotification {
            id: NotificationId::new(id),
            kind,
            scope,
            record_id: Some(record.clone()),
            subscription_id: Some(subscription.clone()),
        }
    }

    pub fn test_config() -> SyncConfig {
        SyncConfig::new(UserId::new("me"))
    }

    pub fn network_failure() -> RemoteError {
        RemoteError::new(RemoteErrorCode::NetworkFailure, "network unreachable")
    }

    pub fn token_expired() -> RemoteError {
        RemoteError::new(RemoteErrorCode::ChangeTokenExpired, "change token expired")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! CIRRUS-specific assertions.

    use super::*;

    pub fn assert_ok<T: std::fmt::Debug>(result: &CirrusResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got {:?}", result);
    }

    pub fn assert_sync_error<T: std::fmt::Debug>(result: &CirrusResult<T>) {
        assert!(
            matches!(result, Err(CirrusError::Sync(_))),
            "Expected sync error, got {:?}",
            result
        );
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CirrusResult<T>) {
        assert!(
            matches!(result, Err(CirrusError::Validation(_))),
            "Expected validation error, got {:?}",
            result
        );
    }
}
