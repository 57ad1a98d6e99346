//! Notification reconciler.
//!
//! Default zones have no server-side diffing, so their cache is kept current
//! from delivered record notifications instead. Notifications arrive at least
//! once and may be coalesced, so every drain is reduced to one deduplicated
//! plan before anything is fetched or applied.

use crate::classify::ErrorClassifier;
use crate::retry::call_with_retry;
use cirrus_core::{
    ChangeNotification, ChangeToken, CirrusResult, DatabaseScope, NotificationId,
    NotificationKind, Operation, RecordId, RemoteStore, SyncConfig, ZoneId,
};
use std::collections::BTreeSet;
use tracing::debug;

/// What a set of notifications means for one zone's cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationPlan {
    /// Records to remove. Applied before `changed`.
    pub deleted: Vec<RecordId>,
    /// Records to re-fetch. Never contains an id that is also deleted.
    pub changed: Vec<RecordId>,
    /// Every notification seen, for acknowledgement.
    pub consumed: Vec<NotificationId>,
}

impl NotificationPlan {
    /// Whether the plan touches the cache at all.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Reduce `notifications` to the changes relevant to `zone` in `scope`.
///
/// Read receipts and notifications for other zones are consumed but ignored.
/// A record that was both deleted and changed counts as deleted.
pub fn plan(
    notifications: &[ChangeNotification],
    scope: DatabaseScope,
    zone: &ZoneId,
) -> NotificationPlan {
    let mut deleted = BTreeSet::new();
    let mut changed = BTreeSet::new();
    let mut consumed = Vec::new();
    let mut seen = BTreeSet::new();

    for notification in notifications {
        if seen.insert(notification.id.clone()) {
            consumed.push(notification.id.clone());
        }
        if notification.kind == NotificationKind::Read || notification.scope != scope {
            continue;
        }
        let Some(record) = &notification.record_id else {
            continue;
        };
        if &record.zone != zone {
            continue;
        }
        match notification.kind {
            NotificationKind::Deleted => {
                deleted.insert(record.clone());
            }
            NotificationKind::Created | NotificationKind::Updated => {
                changed.insert(record.clone());
            }
            NotificationKind::Read => {}
        }
    }

    NotificationPlan {
        changed: changed.difference(&deleted).cloned().collect(),
        deleted: deleted.into_iter().collect(),
        consumed,
    }
}

/// Notifications drained since a token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drained {
    pub notifications: Vec<ChangeNotification>,
    /// Token to persist once the drained notifications have been applied.
    pub token: Option<ChangeToken>,
}

/// Drain every outstanding notification after `token`.
pub async fn drain(
    remote: &dyn RemoteStore,
    config: &SyncConfig,
    classifier: &ErrorClassifier,
    token: Option<ChangeToken>,
) -> CirrusResult<Drained> {
    let mut drained = Drained {
        notifications: Vec::new(),
        token,
    };
    loop {
        let since = drained.token.clone();
        let batch = call_with_retry(
            &config.retry,
            classifier,
            Operation::FetchChanges,
            &[],
            || remote.drain_notifications(since.clone()),
        )
        .await
        .map_err(|failure| failure.into_error(Operation::FetchChanges))?;

        drained.notifications.extend(batch.notifications);
        if batch.new_token.is_some() {
            drained.token = batch.new_token;
        }
        if !batch.more_coming {
            break;
        }
    }
    debug!(count = drained.notifications.len(), "Drained notifications");
    Ok(drained)
}

/// Acknowledge consumed notifications. Failures are never surfaced.
pub async fn mark_consumed(
    remote: &dyn RemoteStore,
    classifier: &ErrorClassifier,
    ids: &[NotificationId],
) {
    if ids.is_empty() {
        return;
    }
    if let Err(err) = remote.mark_notifications_consumed(ids).await {
        classifier.classify(Some(&err), Operation::MarkRead, &[], false);
        debug!(count = ids.len(), error = %err, "Could not mark notifications consumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::SubscriptionId;

    fn zone() -> ZoneId {
        ZoneId::default_zone()
    }

    fn note(
        id: &str,
        kind: NotificationKind,
        scope: DatabaseScope,
        record: &str,
        zone: ZoneId,
    ) -> ChangeNotification {
        ChangeNotification {
            id: NotificationId::new(id),
            kind,
            scope,
            record_id: Some(RecordId::new(record, zone)),
            subscription_id: Some(SubscriptionId::new("sub")),
        }
    }

    #[test]
    fn test_deleted_wins_over_changed() {
        let notifications = vec![
            note("1", NotificationKind::Created, DatabaseScope::Private, "a", zone()),
            note("2", NotificationKind::Updated, DatabaseScope::Private, "a", zone()),
            note("3", NotificationKind::Deleted, DatabaseScope::Private, "a", zone()),
            note("4", NotificationKind::Updated, DatabaseScope::Private, "b", zone()),
            note("5", NotificationKind::Updated, DatabaseScope::Private, "b", zone()),
        ];
        let plan = plan(&notifications, DatabaseScope::Private, &zone());
        assert_eq!(plan.deleted, vec![RecordId::new("a", zone())]);
        assert_eq!(plan.changed, vec![RecordId::new("b", zone())]);
        assert_eq!(plan.consumed.len(), 5);
    }

    #[test]
    fn test_foreign_and_read_notifications_are_only_consumed() {
        let notifications = vec![
            note("1", NotificationKind::Created, DatabaseScope::Public, "a", zone()),
            note("2", NotificationKind::Created, DatabaseScope::Private, "b", ZoneId::new("Work", "me")),
            ChangeNotification {
                id: NotificationId::new("3"),
                kind: NotificationKind::Read,
                scope: DatabaseScope::Private,
                record_id: None,
                subscription_id: None,
            },
        ];
        let plan = plan(&notifications, DatabaseScope::Private, &zone());
        assert!(plan.is_empty());
        assert_eq!(plan.consumed.len(), 3);
    }

    #[test]
    fn test_redelivered_notification_is_consumed_once() {
        let delivered = note("1", NotificationKind::Created, DatabaseScope::Private, "a", zone());
        let plan = plan(&[delivered.clone(), delivered], DatabaseScope::Private, &zone());
        assert_eq!(plan.consumed, vec![NotificationId::new("1")]);
        assert_eq!(plan.changed.len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_kind() -> impl Strategy<Value = NotificationKind> {
            prop_oneof![
                Just(NotificationKind::Created),
                Just(NotificationKind::Updated),
                Just(NotificationKind::Deleted),
                Just(NotificationKind::Read),
            ]
        }

        fn arb_notification() -> impl Strategy<Value = ChangeNotification> {
            (0u8..8, arb_kind(), 0u8..4).prop_map(|(id, kind, record)| {
                note(
                    &format!("n{}", id),
                    kind,
                    DatabaseScope::Private,
                    &format!("r{}", record),
                    zone(),
                )
            })
        }

        proptest! {
            #[test]
            fn prop_plan_is_disjoint_and_consumes_each_id_once(
                notifications in prop::collection::vec(arb_notification(), 0..16)
            ) {
                let plan = plan(&notifications, DatabaseScope::Private, &zone());
                for id in &plan.changed {
                    prop_assert!(!plan.deleted.contains(id));
                }
                let unique: BTreeSet<_> = plan.consumed.iter().collect();
                prop_assert_eq!(unique.len(), plan.consumed.len());
                let delivered: BTreeSet<_> = notifications.iter().map(|n| &n.id).collect();
                prop_assert_eq!(unique, delivered);
            }
        }
    }
}
