//! Batch reconciliation properties of `TopicCache`.

use cirrus_cache::TopicCache;
use cirrus_core::{ChangedRecord, DatabaseScope, Permission, UserId, ZoneId};
use cirrus_test_utils::fixtures::{note, share, shared_note, topic};
use cirrus_test_utils::generators::{arb_changed_batch, arb_deleted_batch};
use proptest::prelude::*;

fn shared_cache() -> TopicCache {
    TopicCache::new(DatabaseScope::Shared, UserId::new("me"))
}

fn zone() -> ZoneId {
    ZoneId::new("Projects", "alice")
}

fn arb_scope() -> impl Strategy<Value = DatabaseScope> {
    prop_oneof![
        Just(DatabaseScope::Public),
        Just(DatabaseScope::Private),
        Just(DatabaseScope::Shared),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Applying the same changed batch twice equals applying it once.
    #[test]
    fn changed_batch_is_idempotent(
        scope in arb_scope(),
        seed in arb_changed_batch(),
        batch in arb_changed_batch(),
    ) {
        let mut cache = TopicCache::new(scope, UserId::new("me"));
        cache.apply_changed(seed);

        cache.apply_changed(batch.clone());
        let once = cache.clone();
        cache.apply_changed(batch);
        prop_assert_eq!(cache, once);
    }

    /// Applying the same deleted batch twice equals applying it once.
    #[test]
    fn deleted_batch_is_idempotent(
        scope in arb_scope(),
        seed in arb_changed_batch(),
        deleted in arb_deleted_batch(),
    ) {
        let mut cache = TopicCache::new(scope, UserId::new("me"));
        cache.apply_changed(seed);

        cache.apply_deleted(&deleted);
        let once = cache.clone();
        prop_assert!(!cache.apply_deleted(&deleted));
        prop_assert_eq!(cache, once);
    }

    /// A combined delta (deletes, then changes) converges when replayed, as
    /// happens when a fetch cycle resumes from an older token.
    #[test]
    fn replayed_delta_converges(
        seed in arb_changed_batch(),
        deleted in arb_deleted_batch(),
        changed in arb_changed_batch(),
    ) {
        let mut cache = shared_cache();
        cache.apply_changed(seed);

        cache.apply_deleted(&deleted);
        cache.apply_changed(changed.clone());
        let once = cache.clone();

        cache.apply_deleted(&deleted);
        cache.apply_changed(changed);
        prop_assert_eq!(cache, once);
    }

    /// No note is ever cached twice, whatever the batch sequence.
    #[test]
    fn notes_are_never_duplicated(batches in proptest::collection::vec(arb_changed_batch(), 1..4)) {
        let mut cache = shared_cache();
        for batch in batches {
            cache.apply_changed(batch);
        }
        let mut ids: Vec<_> = cache
            .topics()
            .iter()
            .flat_map(|t| t.notes.iter())
            .chain(cache.orphans().iter())
            .map(|n| n.note.id.clone())
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), total);
    }
}

#[test]
fn child_of_deleted_parent_lands_in_orphans() {
    let zone = zone();
    let parent = topic(&zone, "P");
    let mut cache = TopicCache::new(DatabaseScope::Private, UserId::new("me"));
    cache.apply_changed(vec![ChangedRecord::Topic(parent.clone())]);

    // One delta: delete P and add a child that still references it.
    cache.apply_deleted(&[parent.id.clone()]);
    cache.apply_changed(vec![ChangedRecord::Note(note(&zone, "child", Some(&parent)))]);

    assert!(cache.topics().is_empty());
    assert_eq!(cache.orphans().len(), 1);
    assert_eq!(cache.orphans()[0].note.title, "child");
}

#[test]
fn deleting_work_rescues_independently_shared_note() {
    let zone = zone();
    let work = topic(&zone, "Work");
    let orphaned = shared_note(&zone, "Orphaned", Some(&work));
    let orphaned_share = orphaned.share.clone().expect("fixture note is shared");

    let mut cache = shared_cache();
    cache.apply_changed(vec![
        ChangedRecord::Topic(work.clone()),
        ChangedRecord::Note(note(&zone, "Report", Some(&work))),
        ChangedRecord::Note(note(&zone, "Notes", Some(&work))),
        ChangedRecord::Note(orphaned.clone()),
        ChangedRecord::Share(share(orphaned_share, Permission::ReadOnly)),
    ]);
    assert_eq!(cache.topics()[0].permission, Permission::ReadWrite);
    assert_eq!(cache.note_count(), 3);

    cache.apply_deleted(&[work.id.clone()]);
    cache.apply_changed(vec![ChangedRecord::Note(orphaned.clone())]);

    assert!(cache.topics().is_empty());
    assert!(cache.find_note(&note(&zone, "Report", None).id).is_none());
    assert!(cache.find_note(&note(&zone, "Notes", None).id).is_none());
    assert_eq!(cache.orphans().len(), 1);
    assert_eq!(cache.orphans()[0].note.id, orphaned.id);
    assert_eq!(cache.orphans()[0].permission, Permission::ReadOnly);
}

#[test]
fn topic_share_change_flips_inheriting_notes() {
    let zone = zone();
    let mut project = topic(&zone, "Project");
    let project_share = fixture_share_id(&zone, "Project");
    project.share = Some(project_share.clone());

    let plain_a = note(&zone, "a", Some(&project));
    let plain_b = note(&zone, "b", Some(&project));
    let own = shared_note(&zone, "own", Some(&project));
    let own_share = own.share.clone().expect("fixture note is shared");

    let mut cache = shared_cache();
    cache.apply_changed(vec![
        ChangedRecord::Topic(project.clone()),
        ChangedRecord::Share(share(project_share.clone(), Permission::ReadWrite)),
        ChangedRecord::Note(plain_a.clone()),
        ChangedRecord::Note(plain_b.clone()),
        ChangedRecord::Note(own.clone()),
        ChangedRecord::Share(share(own_share, Permission::ReadWrite)),
    ]);
    for id in [&plain_a.id, &plain_b.id, &own.id] {
        assert_eq!(cache.permission_of(id), Some(Permission::ReadWrite));
    }

    // Only the share record changes.
    let outcome = cache.apply_changed(vec![ChangedRecord::Share(share(
        project_share,
        Permission::ReadOnly,
    ))]);
    assert!(outcome.unmatched_shares.is_empty());

    assert_eq!(cache.permission_of(&project.id), Some(Permission::ReadOnly));
    assert_eq!(cache.permission_of(&plain_a.id), Some(Permission::ReadOnly));
    assert_eq!(cache.permission_of(&plain_b.id), Some(Permission::ReadOnly));
    assert_eq!(cache.permission_of(&own.id), Some(Permission::ReadWrite));
}

#[test]
fn new_note_inherits_topic_permission_in_shared_scope() {
    let zone = zone();
    let mut project = topic(&zone, "Project");
    let project_share = fixture_share_id(&zone, "Project");
    project.share = Some(project_share.clone());

    let mut cache = shared_cache();
    cache.apply_changed(vec![
        ChangedRecord::Topic(project.clone()),
        ChangedRecord::Share(share(project_share, Permission::ReadOnly)),
    ]);
    cache.merge_children(&project.id, vec![note(&zone, "late", Some(&project))]);

    assert_eq!(
        cache.permission_of(&note(&zone, "late", None).id),
        Some(Permission::ReadOnly)
    );
}

#[test]
fn topics_resorted_only_when_names_change() {
    let zone = zone();
    let mut cache = TopicCache::new(DatabaseScope::Private, UserId::new("me"));
    cache.apply_changed(vec![
        ChangedRecord::Topic(topic(&zone, "b")),
        ChangedRecord::Topic(topic(&zone, "a")),
    ]);
    let mut renamed = topic(&zone, "a");
    renamed.name = "c".to_string();
    cache.apply_changed(vec![ChangedRecord::Topic(renamed)]);

    let names: Vec<_> = cache.topics().iter().map(|t| t.topic.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

fn fixture_share_id(zone: &ZoneId, name: &str) -> cirrus_core::RecordId {
    cirrus_core::RecordId::new(format!("share-{}", name), zone.clone())
}
