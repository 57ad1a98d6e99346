//! Cached entity wrappers.

use cirrus_core::{Note, Permission, RecordId, Topic};
use std::cmp::Ordering;

/// A note as held by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedNote {
    pub note: Note,
    pub permission: Permission,
}

impl CachedNote {
    pub fn id(&self) -> &RecordId {
        &self.note.id
    }
}

/// A topic and its notes, notes kept in title order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTopic {
    pub topic: Topic,
    pub permission: Permission,
    pub notes: Vec<CachedNote>,
}

impl CachedTopic {
    pub fn id(&self) -> &RecordId {
        &self.topic.id
    }

    pub fn note_index(&self, id: &RecordId) -> Option<usize> {
        self.notes.iter().position(|n| n.id() == id)
    }

    /// Set this topic's permission and hand it down to every note that is
    /// not shared on its own.
    pub(crate) fn set_permission(&mut self, permission: Permission) {
        self.permission = permission;
        for note in self.notes.iter_mut().filter(|n| n.note.share.is_none()) {
            note.permission = permission;
        }
    }
}

/// One visible section of the cache: a topic, or the trailing orphan bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section<'a> {
    Topic(&'a CachedTopic),
    Orphans(&'a [CachedNote]),
}

impl<'a> Section<'a> {
    pub fn notes(&self) -> &'a [CachedNote] {
        match self {
            Section::Topic(topic) => &topic.notes,
            Section::Orphans(notes) => notes,
        }
    }
}

pub(crate) fn topic_order(a: &CachedTopic, b: &CachedTopic) -> Ordering {
    a.topic
        .name
        .cmp(&b.topic.name)
        .then_with(|| a.topic.id.cmp(&b.topic.id))
}

pub(crate) fn note_order(a: &CachedNote, b: &CachedNote) -> Ordering {
    a.note
        .title
        .cmp(&b.note.title)
        .then_with(|| a.note.id.cmp(&b.note.id))
}
