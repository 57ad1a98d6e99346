//! The active zone's topic/note mirror and its batch reconciliation.
//!
//! All mutation goes through `apply_deleted` / `apply_changed` (server
//! batches) or the local helpers used by the mutation pipeline. Both batch
//! operations are idempotent: applying a batch a second time leaves the cache
//! unchanged.

use crate::model::{note_order, topic_order, CachedNote, CachedTopic, Section};
use cirrus_core::{ChangedRecord, DatabaseScope, Note, Permission, RecordId, Share, Topic, UserId};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// What a changed-record batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Topics inserted by this batch. Their notes still need fetching.
    pub new_topics: Vec<RecordId>,
    /// Every topic and note id the batch touched.
    pub changed: Vec<RecordId>,
    /// Share updates that matched nothing in the cache and were dropped.
    pub unmatched_shares: Vec<RecordId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Topic(usize),
    Orphans,
}

/// Collections touched during one operation, re-sorted at its end.
#[derive(Default)]
struct Dirty {
    topics: BTreeSet<usize>,
    orphans: bool,
}

impl Dirty {
    fn mark(&mut self, slot: Slot) {
        match slot {
            Slot::Topic(index) => {
                self.topics.insert(index);
            }
            Slot::Orphans => self.orphans = true,
        }
    }
}

/// Mirror of the topics and notes of one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCache {
    scope: DatabaseScope,
    current_user: UserId,
    topics: Vec<CachedTopic>,
    orphans: Vec<CachedNote>,
}

impl TopicCache {
    pub fn new(scope: DatabaseScope, current_user: UserId) -> Self {
        Self {
            scope,
            current_user,
            topics: Vec::new(),
            orphans: Vec::new(),
        }
    }

    pub fn scope(&self) -> DatabaseScope {
        self.scope
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.orphans.clear();
    }

    /// Empty the cache and rebind it to another scope.
    pub fn reset(&mut self, scope: DatabaseScope) {
        self.scope = scope;
        self.clear();
    }

    // ========================================================================
    // READ ACCESS
    // ========================================================================

    /// Topics in name order.
    pub fn topics(&self) -> &[CachedTopic] {
        &self.topics
    }

    /// Notes with no live topic, in title order.
    pub fn orphans(&self) -> &[CachedNote] {
        &self.orphans
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.orphans.is_empty()
    }

    pub fn note_count(&self) -> usize {
        self.topics.iter().map(|t| t.notes.len()).sum::<usize>() + self.orphans.len()
    }

    /// Sections to display: every topic, plus the orphan bucket when it has
    /// notes.
    pub fn visible_topic_count(&self) -> usize {
        self.topics.len() + usize::from(!self.orphans.is_empty())
    }

    pub fn visible_topic(&self, index: usize) -> Option<Section<'_>> {
        if let Some(topic) = self.topics.get(index) {
            return Some(Section::Topic(topic));
        }
        self.is_orphan_section(index)
            .then_some(Section::Orphans(&self.orphans))
    }

    pub fn is_orphan_section(&self, index: usize) -> bool {
        index == self.topics.len() && !self.orphans.is_empty()
    }

    pub fn find_topic(&self, id: &RecordId) -> Option<&CachedTopic> {
        self.topics.iter().find(|t| t.id() == id)
    }

    pub fn find_note(&self, id: &RecordId) -> Option<&CachedNote> {
        self.locate_note(id)
            .map(|(slot, position)| self.note_at(slot, position))
    }

    /// Permission of any cached topic or note.
    pub fn permission_of(&self, id: &RecordId) -> Option<Permission> {
        self.find_topic(id)
            .map(|t| t.permission)
            .or_else(|| self.find_note(id).map(|n| n.permission))
    }

    // ========================================================================
    // BATCH RECONCILIATION
    // ========================================================================

    /// Apply a batch of deleted ids.
    ///
    /// Topics go first. Their notes are discarded with them, except notes
    /// shared on their own, which move to the orphan bucket with their
    /// permission intact. Then matching notes are removed from wherever they
    /// live. Returns whether anything changed.
    pub fn apply_deleted(&mut self, ids: &[RecordId]) -> bool {
        if ids.is_empty() {
            return false;
        }
        let doomed: HashSet<&RecordId> = ids.iter().collect();
        let mut changed = false;

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.topics)
            .into_iter()
            .partition(|t| doomed.contains(t.id()));
        self.topics = kept;

        let mut rescued = Vec::new();
        for topic in removed {
            changed = true;
            rescued.extend(
                topic
                    .notes
                    .into_iter()
                    .filter(|n| n.note.is_independently_shared() && !doomed.contains(n.id())),
            );
        }

        for topic in &mut self.topics {
            let before = topic.notes.len();
            topic.notes.retain(|n| !doomed.contains(n.id()));
            changed |= topic.notes.len() != before;
        }
        let before = self.orphans.len();
        self.orphans.retain(|n| !doomed.contains(n.id()));
        changed |= self.orphans.len() != before;

        if !rescued.is_empty() {
            for note in rescued {
                if !self.orphans.iter().any(|n| n.id() == note.id()) {
                    self.orphans.push(note);
                }
            }
            self.orphans.sort_by(note_order);
            changed = true;
        }
        changed
    }

    /// Apply a batch of changed records.
    ///
    /// Share metadata only matters in the shared scope and is dropped
    /// elsewhere. Topics are reconciled before notes so a note can land in a
    /// topic inserted by the same batch; notes are upserted by id, so the
    /// later child fetch of that topic cannot duplicate them.
    pub fn apply_changed(&mut self, records: Vec<ChangedRecord>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut shares = Vec::new();
        let mut topics_in = Vec::new();
        let mut notes_in = Vec::new();
        for record in records {
            match record {
                ChangedRecord::Share(share) => {
                    if self.scope == DatabaseScope::Shared {
                        shares.push(share);
                    }
                }
                ChangedRecord::Topic(topic) => topics_in.push(topic),
                ChangedRecord::Note(note) => notes_in.push(note),
            }
        }

        let mut topics_dirty = false;
        for topic in topics_in {
            outcome.changed.push(topic.id.clone());
            let index = match self.topic_index(&topic.id) {
                Some(index) => {
                    let cached = &mut self.topics[index];
                    topics_dirty |= cached.topic.name != topic.name;
                    cached.topic = topic;
                    index
                }
                None => {
                    topics_dirty = true;
                    outcome.new_topics.push(topic.id.clone());
                    let permission = Permission::for_creator(
                        self.scope,
                        topic.creator.as_ref(),
                        &self.current_user,
                    );
                    self.topics.push(CachedTopic {
                        topic,
                        permission,
                        notes: Vec::new(),
                    });
                    self.topics.len() - 1
                }
            };
            if let Some(permission) =
                take_matching_share(&mut shares, self.topics[index].topic.share.as_ref())
            {
                self.topics[index].set_permission(permission);
            }
        }
        if topics_dirty {
            self.topics.sort_by(topic_order);
        }

        let mut dirty = Dirty::default();
        for note in notes_in {
            outcome.changed.push(note.id.clone());
            let (slot, position) = self.place_note(note, &mut dirty);
            let own_share = self.note_at(slot, position).note.share.clone();
            if let Some(permission) = take_matching_share(&mut shares, own_share.as_ref()) {
                self.note_at_mut(slot, position).permission = permission;
            }
        }
        self.sort_dirty(dirty);

        // Whatever is left changed only a permission on something already
        // cached.
        for share in shares {
            if !self.apply_share(&share) {
                debug!(share = %share.id, "Dropping share update with no cached record");
                outcome.unmatched_shares.push(share.id);
            }
        }
        outcome
    }

    /// Drop the whole cache and load a full snapshot in its place.
    pub fn replace_all(&mut self, records: Vec<ChangedRecord>) -> ApplyOutcome {
        self.clear();
        self.apply_changed(records)
    }

    // ========================================================================
    // LOCAL HELPERS
    // ========================================================================

    /// Insert or update a single topic.
    pub fn insert_topic(&mut self, topic: Topic) {
        self.apply_changed(vec![ChangedRecord::Topic(topic)]);
    }

    /// Remove a topic. Independently shared notes are rescued to the orphan
    /// bucket as with a server-side deletion.
    pub fn remove_topic(&mut self, id: &RecordId) -> Option<CachedTopic> {
        let removed = self.find_topic(id).cloned()?;
        self.apply_deleted(std::slice::from_ref(id));
        Some(removed)
    }

    /// Insert or update a single note.
    pub fn upsert_note(&mut self, note: Note) {
        let mut dirty = Dirty::default();
        self.place_note(note, &mut dirty);
        self.sort_dirty(dirty);
    }

    pub fn remove_note(&mut self, id: &RecordId) -> Option<CachedNote> {
        let (slot, position) = self.locate_note(id)?;
        Some(self.take_note(slot, position))
    }

    /// Replace a note with its re-created copy under another topic.
    pub fn move_note(&mut self, old: &RecordId, note: Note) {
        self.remove_note(old);
        self.upsert_note(note);
    }

    /// Remove any cached topic or note with this id.
    pub fn remove_record(&mut self, id: &RecordId) -> bool {
        self.apply_deleted(std::slice::from_ref(id))
    }

    /// Merge the fetched notes of one topic. Returns false if the topic is no
    /// longer cached, in which case nothing is merged.
    pub fn merge_children(&mut self, topic_id: &RecordId, notes: Vec<Note>) -> bool {
        if self.topic_index(topic_id).is_none() {
            return false;
        }
        let mut dirty = Dirty::default();
        for note in notes {
            self.place_note(note, &mut dirty);
        }
        self.sort_dirty(dirty);
        true
    }

    /// Merge fetched notes that belong to no cached topic.
    pub fn merge_orphans(&mut self, notes: Vec<Note>) {
        let mut dirty = Dirty::default();
        for note in notes {
            self.place_note(note, &mut dirty);
        }
        self.sort_dirty(dirty);
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn topic_index(&self, id: &RecordId) -> Option<usize> {
        self.topics.iter().position(|t| t.id() == id)
    }

    fn locate_note(&self, id: &RecordId) -> Option<(Slot, usize)> {
        for (index, topic) in self.topics.iter().enumerate() {
            if let Some(position) = topic.note_index(id) {
                return Some((Slot::Topic(index), position));
            }
        }
        self.orphans
            .iter()
            .position(|n| n.id() == id)
            .map(|position| (Slot::Orphans, position))
    }

    fn notes_mut(&mut self, slot: Slot) -> &mut Vec<CachedNote> {
        match slot {
            Slot::Topic(index) => &mut self.topics[index].notes,
            Slot::Orphans => &mut self.orphans,
        }
    }

    fn note_at(&self, slot: Slot, position: usize) -> &CachedNote {
        match slot {
            Slot::Topic(index) => &self.topics[index].notes[position],
            Slot::Orphans => &self.orphans[position],
        }
    }

    fn note_at_mut(&mut self, slot: Slot, position: usize) -> &mut CachedNote {
        &mut self.notes_mut(slot)[position]
    }

    fn take_note(&mut self, slot: Slot, position: usize) -> CachedNote {
        self.notes_mut(slot).remove(position)
    }

    /// Where a note belongs: its topic if cached, otherwise the orphan bucket.
    fn target_slot(&self, note: &Note) -> Slot {
        note.topic
            .as_ref()
            .and_then(|topic| self.topic_index(topic))
            .map_or(Slot::Orphans, Slot::Topic)
    }

    /// Update a note in place, or move/insert it into the slot its topic
    /// reference points at.
    fn place_note(&mut self, note: Note, dirty: &mut Dirty) -> (Slot, usize) {
        let target = self.target_slot(&note);
        let previous = match self.locate_note(&note.id) {
            Some((slot, position)) if slot == target => {
                let cached = self.note_at_mut(slot, position);
                let renamed = cached.note.title != note.title;
                cached.note = note;
                if renamed {
                    dirty.mark(slot);
                }
                return (slot, position);
            }
            Some((slot, position)) => Some(self.take_note(slot, position).permission),
            None => None,
        };

        let permission = self.note_permission(&note, target, previous);
        let notes = self.notes_mut(target);
        notes.push(CachedNote { note, permission });
        let position = notes.len() - 1;
        dirty.mark(target);
        (target, position)
    }

    /// Permission for a note entering `target`.
    ///
    /// In the shared scope a note without its own share takes its topic's
    /// permission. Otherwise a moved note keeps what it had and a new note
    /// gets the same-creator rule.
    fn note_permission(&self, note: &Note, target: Slot, previous: Option<Permission>) -> Permission {
        if self.scope == DatabaseScope::Shared && note.share.is_none() {
            if let Slot::Topic(index) = target {
                return self.topics[index].permission;
            }
        }
        previous.unwrap_or_else(|| {
            Permission::for_creator(self.scope, note.creator.as_ref(), &self.current_user)
        })
    }

    fn sort_dirty(&mut self, dirty: Dirty) {
        for index in dirty.topics {
            self.topics[index].notes.sort_by(note_order);
        }
        if dirty.orphans {
            self.orphans.sort_by(note_order);
        }
    }

    /// Find the record `share` belongs to, topics first, then notes, and set
    /// its permission.
    fn apply_share(&mut self, share: &Share) -> bool {
        let Some(permission) = share.participant_permission else {
            return false;
        };
        if let Some(topic) = self
            .topics
            .iter_mut()
            .find(|t| t.topic.share.as_ref() == Some(&share.id))
        {
            topic.set_permission(permission);
            return true;
        }
        let note = self
            .topics
            .iter_mut()
            .flat_map(|t| t.notes.iter_mut())
            .chain(self.orphans.iter_mut())
            .find(|n| n.note.share.as_ref() == Some(&share.id));
        match note {
            Some(note) => {
                note.permission = permission;
                true
            }
            None => false,
        }
    }
}

/// Remove and return the permission of the first share that targets
/// `share_ref` and names the current user as a participant.
fn take_matching_share(shares: &mut Vec<Share>, share_ref: Option<&RecordId>) -> Option<Permission> {
    let share_ref = share_ref?;
    let index = shares
        .iter()
        .position(|s| &s.id == share_ref && s.participant_permission.is_some())?;
    shares.remove(index).participant_permission
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::ZoneId;

    fn zone() -> ZoneId {
        ZoneId::new("Trip", "bob")
    }

    fn id(name: &str) -> RecordId {
        RecordId::new(name, zone())
    }

    fn topic(name: &str) -> Topic {
        Topic {
            id: id(name),
            name: name.to_string(),
            version: None,
            creator: None,
            share: None,
        }
    }

    fn note(name: &str, topic: Option<&str>) -> Note {
        Note {
            id: id(name),
            title: name.to_string(),
            topic: topic.map(id),
            parent: topic.map(id),
            version: None,
            creator: None,
            share: None,
        }
    }

    fn cache(scope: DatabaseScope) -> TopicCache {
        TopicCache::new(scope, UserId::new("me"))
    }

    #[test]
    fn test_new_topics_are_reported_and_sorted() {
        let mut cache = cache(DatabaseScope::Private);
        let outcome = cache.apply_changed(vec![
            ChangedRecord::Topic(topic("Zoo")),
            ChangedRecord::Topic(topic("Apple")),
        ]);
        assert_eq!(outcome.new_topics, vec![id("Zoo"), id("Apple")]);
        let names: Vec<_> = cache.topics().iter().map(|t| t.topic.name.as_str()).collect();
        assert_eq!(names, vec!["Apple", "Zoo"]);
    }

    #[test]
    fn test_note_with_unknown_topic_goes_to_orphans() {
        let mut cache = cache(DatabaseScope::Private);
        cache.apply_changed(vec![ChangedRecord::Note(note("n", Some("missing")))]);
        assert_eq!(cache.orphans().len(), 1);
        assert_eq!(cache.visible_topic_count(), 1);
        assert!(cache.is_orphan_section(0));
    }

    #[test]
    fn test_note_follows_topic_reference_change() {
        let mut cache = cache(DatabaseScope::Private);
        cache.apply_changed(vec![
            ChangedRecord::Topic(topic("A")),
            ChangedRecord::Topic(topic("B")),
            ChangedRecord::Note(note("n", Some("A"))),
        ]);
        cache.apply_changed(vec![ChangedRecord::Note(note("n", Some("B")))]);

        assert!(cache.find_topic(&id("A")).map(|t| t.notes.is_empty()).unwrap_or(false));
        assert_eq!(cache.find_topic(&id("B")).map(|t| t.notes.len()), Some(1));
        assert_eq!(cache.note_count(), 1);
    }

    #[test]
    fn test_retitled_note_is_resorted() {
        let mut cache = cache(DatabaseScope::Private);
        cache.apply_changed(vec![
            ChangedRecord::Topic(topic("T")),
            ChangedRecord::Note(note("a", Some("T"))),
            ChangedRecord::Note(note("b", Some("T"))),
        ]);
        let mut renamed = note("a", Some("T"));
        renamed.title = "z".to_string();
        cache.apply_changed(vec![ChangedRecord::Note(renamed)]);

        let titles: Vec<_> = cache.topics()[0]
            .notes
            .iter()
            .map(|n| n.note.title.as_str())
            .collect();
        assert_eq!(titles, vec!["b", "z"]);
    }

    #[test]
    fn test_shares_ignored_outside_shared_scope() {
        let mut cache = cache(DatabaseScope::Private);
        let mut shared = topic("T");
        shared.share = Some(id("s"));
        let outcome = cache.apply_changed(vec![
            ChangedRecord::Topic(shared),
            ChangedRecord::Share(Share {
                id: id("s"),
                version: None,
                participant_permission: Some(Permission::ReadOnly),
            }),
        ]);
        assert!(outcome.unmatched_shares.is_empty());
        assert_eq!(cache.permission_of(&id("T")), Some(Permission::ReadWrite));
    }

    #[test]
    fn test_unmatched_share_is_dropped() {
        let mut cache = cache(DatabaseScope::Shared);
        let outcome = cache.apply_changed(vec![ChangedRecord::Share(Share {
            id: id("s"),
            version: None,
            participant_permission: Some(Permission::ReadOnly),
        })]);
        assert_eq!(outcome.unmatched_shares, vec![id("s")]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_public_records_by_others_are_read_only() {
        let mut cache = cache(DatabaseScope::Public);
        let mut theirs = topic("Theirs");
        theirs.creator = Some(UserId::new("someone"));
        let mut mine = topic("Mine");
        mine.creator = Some(UserId::new("me"));
        cache.apply_changed(vec![ChangedRecord::Topic(theirs), ChangedRecord::Topic(mine)]);

        assert_eq!(cache.permission_of(&id("Theirs")), Some(Permission::ReadOnly));
        assert_eq!(cache.permission_of(&id("Mine")), Some(Permission::ReadWrite));
    }

    #[test]
    fn test_merge_children_ignores_uncached_topic() {
        let mut cache = cache(DatabaseScope::Private);
        assert!(!cache.merge_children(&id("gone"), vec![note("n", Some("gone"))]));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_move_note_replaces_old_copy() {
        let mut cache = cache(DatabaseScope::Private);
        cache.apply_changed(vec![
            ChangedRecord::Topic(topic("A")),
            ChangedRecord::Topic(topic("B")),
            ChangedRecord::Note(note("old", Some("A"))),
        ]);
        cache.move_note(&id("old"), note("new", Some("B")));

        assert!(cache.find_note(&id("old")).is_none());
        assert_eq!(cache.find_topic(&id("B")).map(|t| t.notes.len()), Some(1));
    }

    #[test]
    fn test_visible_sections() {
        let mut cache = cache(DatabaseScope::Private);
        cache.apply_changed(vec![ChangedRecord::Topic(topic("A"))]);
        assert_eq!(cache.visible_topic_count(), 1);
        assert!(matches!(cache.visible_topic(0), Some(Section::Topic(_))));
        assert!(cache.visible_topic(1).is_none());

        cache.upsert_note(note("loose", None));
        assert_eq!(cache.visible_topic_count(), 2);
        assert!(matches!(cache.visible_topic(1), Some(Section::Orphans(notes)) if notes.len() == 1));
    }
}
