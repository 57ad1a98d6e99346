//! Cache-changed event types

use cirrus_core::{DatabaseScope, Note, RecordId, ZoneId};
use serde::{Deserialize, Serialize};

/// Which cache instance emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    /// The zone registry.
    Zones,
    /// The active-zone content mirror.
    Content,
}

/// Why a cache changed, when it matters to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeReason {
    /// The active zone disappeared; observers should switch zones.
    ZoneNotFound,
    /// A note moved to another topic; the payload carries the new note.
    TopicSwitched,
}

/// Records touched by the batch that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub deleted: Vec<RecordId>,
    pub changed: Vec<RecordId>,
    pub new_note: Option<Note>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.changed.is_empty() && self.new_note.is_none()
    }
}

/// Emitted once a cache's batch has drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub cache: CacheKind,
    pub scope: DatabaseScope,
    pub zone: Option<ZoneId>,
    pub reason: Option<ChangeReason>,
    pub changes: Option<ChangeSet>,
}

impl CacheEvent {
    pub fn new(cache: CacheKind, scope: DatabaseScope) -> Self {
        Self {
            cache,
            scope,
            zone: None,
            reason: None,
            changes: None,
        }
    }

    pub fn zones_changed(scope: DatabaseScope) -> Self {
        Self::new(CacheKind::Zones, scope)
    }

    pub fn content_changed(scope: DatabaseScope, zone: ZoneId) -> Self {
        Self::new(CacheKind::Content, scope).with_zone(zone)
    }

    pub fn with_zone(mut self, zone: ZoneId) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn with_reason(mut self, reason: ChangeReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_changes(mut self, changes: ChangeSet) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Short label used in logs.
    pub fn event_type(&self) -> &'static str {
        match (self.cache, self.reason) {
            (_, Some(ChangeReason::ZoneNotFound)) => "zone_not_found",
            (_, Some(ChangeReason::TopicSwitched)) => "topic_switched",
            (CacheKind::Zones, None) => "zones_changed",
            (CacheKind::Content, None) => "content_changed",
        }
    }
}
