//! Mutation pipeline: local edits written to the server, then to the mirror.
//!
//! Every mutation runs as a job on the content lane. Permissions are checked
//! against the mirror before anything is sent. The mirror is only updated
//! after the server accepted the write, and only if the active zone did not
//! change while the write was in flight.

use crate::classify::Classified;
use crate::content::{ContentCache, ContentInner, Selection};
use crate::retry::{call_with_retry, RemoteFailure};
use cirrus_cache::TopicCache;
use cirrus_core::{
    AffectedItem, ChangedRecord, CirrusResult, DatabaseScope, Note, Operation, RecordId,
    RemoteError, RemoteErrorCode, RemoteRecord, SavePolicy, Topic, ValidationError,
};
use cirrus_events::{ChangeReason, ChangeSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of saving a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted the note; the mirror holds the saved copy.
    Saved(Note),
    /// Somebody else changed the note first. Nothing was written; resolve
    /// with `ContentCache::accept_remote` or `ContentCache::overwrite`.
    Conflict { local: Note, server: Note },
}

impl ContentCache {
    async fn mutate<T, F, Fut>(&self, op: F) -> CirrusResult<T>
    where
        F: FnOnce(Arc<ContentInner>, Selection) -> Fut,
        Fut: Future<Output = CirrusResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let selection = self.inner.current();
        let job = op(self.inner.clone(), selection);
        self.inner.lane.run(job).await?
    }

    /// Create a topic in the active zone.
    pub async fn add_topic(&self, name: &str) -> CirrusResult<Topic> {
        let name = required("name", name)?;
        self.mutate(|inner, selection| async move { inner.add_topic(&selection, name).await })
            .await
    }

    /// Rename a topic. If the server copy moved on, the server copy is kept
    /// and returned instead.
    pub async fn rename_topic(&self, id: &RecordId, name: &str) -> CirrusResult<Topic> {
        let name = required("name", name)?;
        let id = id.clone();
        self.mutate(|inner, selection| async move {
            inner.rename_topic(&selection, id, name).await
        })
        .await
    }

    /// Delete a topic and the notes that are not shared on their own.
    pub async fn delete_topic(&self, id: &RecordId) -> CirrusResult<()> {
        let id = id.clone();
        self.mutate(|inner, selection| async move { inner.delete_topic(&selection, id).await })
            .await
    }

    /// Save a new or edited note, reporting conflicts instead of resolving
    /// them.
    pub async fn save_note(&self, note: Note) -> CirrusResult<MutationOutcome> {
        required("title", &note.title)?;
        self.mutate(|inner, selection| async move {
            inner
                .save_note(&selection, note, SavePolicy::IfServerRecordUnchanged)
                .await
        })
        .await
    }

    /// Resolve a conflict by taking the server's copy.
    pub async fn accept_remote(&self, server: Note) -> CirrusResult<Note> {
        self.mutate(|inner, selection| async move {
            inner.store_note(&selection, server.clone()).await;
            Ok(server)
        })
        .await
    }

    /// Resolve a conflict by writing the local copy over the server's.
    pub async fn overwrite(&self, local: Note) -> CirrusResult<Note> {
        self.mutate(|inner, selection| async move {
            match inner
                .save_note(&selection, local, SavePolicy::Overwrite)
                .await?
            {
                MutationOutcome::Saved(note) => Ok(note),
                // An overwrite cannot conflict; take the server copy if one
                // is reported anyway.
                MutationOutcome::Conflict { server, .. } => Ok(server),
            }
        })
        .await
    }

    pub async fn delete_note(&self, id: &RecordId) -> CirrusResult<()> {
        let id = id.clone();
        self.mutate(|inner, selection| async move { inner.delete_note(&selection, id).await })
            .await
    }

    /// Move a note under another topic, or to the orphan bucket with `None`.
    ///
    /// A note's topic is fixed at creation, so the note is re-created under
    /// the new topic and the old record deleted, in one server call. Returns
    /// the new note.
    pub async fn switch_note_topic(
        &self,
        id: &RecordId,
        topic: Option<&RecordId>,
    ) -> CirrusResult<Note> {
        let id = id.clone();
        let topic = topic.cloned();
        self.mutate(|inner, selection| async move {
            inner.switch_note_topic(&selection, id, topic).await
        })
        .await
    }

    /// Delete every record in the active zone the current user may write.
    /// Returns the number of records deleted.
    pub async fn delete_all(&self) -> CirrusResult<usize> {
        self.mutate(|inner, selection| async move { inner.delete_all(&selection).await })
            .await
    }
}

impl ContentInner {
    async fn add_topic(&self, selection: &Selection, name: String) -> CirrusResult<Topic> {
        let draft = Topic::draft(selection.active.zone.clone(), name);
        let topic = match self
            .modify(
                selection.active.scope,
                vec![draft.to_remote()],
                Vec::new(),
                SavePolicy::IfServerRecordUnchanged,
                Operation::ModifyRecords,
            )
            .await
        {
            Ok(saved) => first_topic(saved)?.unwrap_or(draft),
            Err(failure) => resolve_with_server(failure, Operation::ModifyRecords)
                .and_then(as_topic)?,
        };

        let changed = vec![topic.id.clone()];
        let stored = topic.clone();
        if self
            .update_mirror(selection, |cache| cache.insert_topic(stored))
            .await
        {
            self.post_changes(selection, ChangeSet {
                changed,
                ..ChangeSet::default()
            });
        }
        info!(topic = %topic.id, "Added topic");
        Ok(topic)
    }

    async fn rename_topic(
        &self,
        selection: &Selection,
        id: RecordId,
        name: String,
    ) -> CirrusResult<Topic> {
        let mut topic = self.writable_topic(&id).await?;
        topic.name = name;
        let topic = match self
            .modify(
                selection.active.scope,
                vec![topic.to_remote()],
                Vec::new(),
                SavePolicy::IfServerRecordUnchanged,
                Operation::ModifyRecords,
            )
            .await
        {
            Ok(saved) => first_topic(saved)?.unwrap_or(topic),
            Err(failure) => {
                let server = resolve_with_server(failure, Operation::ModifyRecords)
                    .and_then(as_topic)?;
                debug!(topic = %id, "Rename lost to a newer server copy");
                server
            }
        };

        let stored = topic.clone();
        if self
            .update_mirror(selection, |cache| cache.insert_topic(stored))
            .await
        {
            self.post_changes(selection, ChangeSet {
                changed: vec![id],
                ..ChangeSet::default()
            });
        }
        Ok(topic)
    }

    async fn delete_topic(&self, selection: &Selection, id: RecordId) -> CirrusResult<()> {
        self.writable_topic(&id).await?;
        let mut doomed = vec![id.clone()];
        {
            let state = self.state.read().await;
            if let Some(cached) = state.cache.find_topic(&id) {
                doomed.extend(
                    cached
                        .notes
                        .iter()
                        .filter(|n| !n.note.is_independently_shared())
                        .map(|n| n.id().clone()),
                );
            }
        }
        self.delete_records(selection, doomed).await?;
        info!(topic = %id, "Deleted topic");
        Ok(())
    }

    async fn save_note(
        &self,
        selection: &Selection,
        note: Note,
        policy: SavePolicy,
    ) -> CirrusResult<MutationOutcome> {
        {
            let state = self.state.read().await;
            check_note_writable(&state.cache, &note)?;
        }
        let saved = match self
            .modify(
                selection.active.scope,
                vec![note.to_remote()],
                Vec::new(),
                policy,
                Operation::ModifyRecords,
            )
            .await
        {
            Ok(saved) => first_note(saved)?.unwrap_or_else(|| note.clone()),
            Err(RemoteFailure::Verdict(Classified::Conflict {
                server_record: Some(server),
                ..
            })) => {
                debug!(note = %note.id, "Save conflicts with a newer server copy");
                return Ok(MutationOutcome::Conflict {
                    server: as_note(server)?,
                    local: note,
                });
            }
            Err(failure) => return Err(failure.into_error(Operation::ModifyRecords).into()),
        };

        self.store_note(selection, saved.clone()).await;
        Ok(MutationOutcome::Saved(saved))
    }

    async fn delete_note(&self, selection: &Selection, id: RecordId) -> CirrusResult<()> {
        self.writable_note(&id).await?;
        self.delete_records(selection, vec![id]).await
    }

    async fn switch_note_topic(
        &self,
        selection: &Selection,
        id: RecordId,
        topic: Option<RecordId>,
    ) -> CirrusResult<Note> {
        let old = self.writable_note(&id).await?;
        if let Some(topic) = &topic {
            self.writable_topic(topic).await?;
        }
        let mut moved = Note::draft(
            selection.active.zone.clone(),
            old.title.clone(),
            topic.as_ref(),
            selection.active.scope,
        );
        moved.creator = old.creator.clone();

        let saved = self
            .modify(
                selection.active.scope,
                vec![moved.to_remote()],
                vec![id.clone()],
                SavePolicy::IfServerRecordUnchanged,
                Operation::ModifyRecords,
            )
            .await
            .map_err(|failure| failure.into_error(Operation::ModifyRecords))?;
        let note = first_note(saved)?.unwrap_or(moved);

        let stored = note.clone();
        let old_id = id.clone();
        if self
            .update_mirror(selection, |cache| cache.move_note(&old_id, stored))
            .await
        {
            self.post(
                ContentInner::content_event(selection)
                    .with_reason(ChangeReason::TopicSwitched)
                    .with_changes(ChangeSet {
                        deleted: vec![id],
                        changed: vec![note.id.clone()],
                        new_note: Some(note.clone()),
                    }),
            );
        }
        info!(note = %note.id, "Moved note to another topic");
        Ok(note)
    }

    async fn delete_all(&self, selection: &Selection) -> CirrusResult<usize> {
        let doomed: Vec<RecordId> = {
            let state = self.state.read().await;
            let cache = &state.cache;
            let topics = cache
                .topics()
                .iter()
                .filter(|t| t.permission.can_write())
                .map(|t| t.id().clone());
            let notes = cache
                .topics()
                .iter()
                .flat_map(|t| t.notes.iter())
                .chain(cache.orphans().iter())
                .filter(|n| n.permission.can_write())
                .map(|n| n.id().clone());
            topics.chain(notes).collect()
        };
        if doomed.is_empty() {
            return Ok(0);
        }
        let count = doomed.len();
        self.delete_records(selection, doomed).await?;
        info!(records = count, "Deleted all records");
        Ok(count)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// One `modify_records` call with retries. Returns the saved records.
    async fn modify(
        &self,
        scope: DatabaseScope,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
        operation: Operation,
    ) -> Result<Vec<RemoteRecord>, RemoteFailure> {
        let affected: Vec<AffectedItem> = save
            .iter()
            .map(|r| r.id.clone())
            .chain(delete.iter().cloned())
            .map(AffectedItem::Record)
            .collect();
        call_with_retry(
            &self.config.retry,
            &self.classifier,
            operation,
            &affected,
            || {
                self.remote
                    .modify_records(scope, save.clone(), delete.clone(), policy)
            },
        )
        .await
        .map(|outcome| outcome.saved)
    }

    /// Delete on the server, then from the mirror. Records already gone on
    /// the server count as deleted.
    ///
    /// A batch delete is atomic on the server, so a batch naming a record a
    /// peer already removed is rejected as a whole. The gone ids are dropped
    /// and the rest resubmitted; every round removes at least one id.
    async fn delete_records(&self, selection: &Selection, ids: Vec<RecordId>) -> CirrusResult<()> {
        let scope = selection.active.scope;
        let mut remaining = ids.clone();
        while !remaining.is_empty() {
            let affected: Vec<AffectedItem> =
                remaining.iter().cloned().map(AffectedItem::Record).collect();
            let result = call_with_retry(
                &self.config.retry,
                &self.classifier,
                Operation::DeleteRecords,
                &affected,
                || {
                    let request = remaining.clone();
                    async move {
                        match self
                            .remote
                            .modify_records(
                                scope,
                                Vec::new(),
                                request.clone(),
                                SavePolicy::IfServerRecordUnchanged,
                            )
                            .await
                        {
                            Ok(_) => Ok(Vec::new()),
                            Err(err) => {
                                let gone = already_deleted(&err, &request);
                                if gone.is_empty() {
                                    Err(err)
                                } else {
                                    Ok(gone)
                                }
                            }
                        }
                    }
                },
            )
            .await;

            match result {
                Ok(gone) if gone.is_empty() => break,
                Ok(gone) => {
                    debug!(
                        gone = gone.len(),
                        remaining = remaining.len() - gone.len(),
                        "Records already deleted on the server; resubmitting the rest"
                    );
                    remaining.retain(|id| !gone.contains(id));
                }
                Err(failure) if failure.is_success() => {
                    debug!(records = remaining.len(), "Records already deleted on the server");
                    break;
                }
                Err(failure) => return Err(failure.into_error(Operation::DeleteRecords).into()),
            }
        }

        let doomed = ids.clone();
        if self
            .update_mirror(selection, |cache| {
                cache.apply_deleted(&doomed);
            })
            .await
        {
            self.post_changes(selection, ChangeSet {
                deleted: ids,
                ..ChangeSet::default()
            });
        }
        Ok(())
    }

    async fn store_note(&self, selection: &Selection, note: Note) {
        let changed = vec![note.id.clone()];
        if self
            .update_mirror(selection, |cache| cache.upsert_note(note))
            .await
        {
            self.post_changes(selection, ChangeSet {
                changed,
                ..ChangeSet::default()
            });
        }
    }

    /// Run `f` against the mirror unless the active zone changed. Returns
    /// whether it ran.
    async fn update_mirror(&self, selection: &Selection, f: impl FnOnce(&mut TopicCache)) -> bool {
        let mut state = self.state.write().await;
        if !self.is_current(selection.epoch) {
            debug!(epoch = selection.epoch, "Active zone changed; mirror not updated");
            return false;
        }
        f(&mut state.cache);
        true
    }

    fn post_changes(&self, selection: &Selection, changes: ChangeSet) {
        self.post(ContentInner::content_event(selection).with_changes(changes));
    }

    async fn writable_topic(&self, id: &RecordId) -> CirrusResult<Topic> {
        let state = self.state.read().await;
        let cached = state
            .cache
            .find_topic(id)
            .ok_or_else(|| ValidationError::NotCached { id: id.clone() })?;
        if !cached.permission.can_write() {
            return Err(ValidationError::ReadOnlyRecord { id: id.clone() }.into());
        }
        Ok(cached.topic.clone())
    }

    async fn writable_note(&self, id: &RecordId) -> CirrusResult<Note> {
        let state = self.state.read().await;
        let cached = state
            .cache
            .find_note(id)
            .ok_or_else(|| ValidationError::NotCached { id: id.clone() })?;
        if !cached.permission.can_write() {
            return Err(ValidationError::ReadOnlyRecord { id: id.clone() }.into());
        }
        Ok(cached.note.clone())
    }
}

/// A cached note carries its own permission; a new note inherits its
/// topic's.
fn check_note_writable(cache: &TopicCache, note: &Note) -> CirrusResult<()> {
    let permission = cache.permission_of(&note.id).or_else(|| {
        note.topic
            .as_ref()
            .and_then(|topic| cache.permission_of(topic))
    });
    match permission {
        Some(permission) if !permission.can_write() => Err(ValidationError::ReadOnlyRecord {
            id: note.id.clone(),
        }
        .into()),
        _ => Ok(()),
    }
}

fn required(field: &str, value: &str) -> CirrusResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        }
        .into());
    }
    Ok(trimmed.to_string())
}

/// The server copy carried by a conflict, or the failure as an error.
fn resolve_with_server(failure: RemoteFailure, operation: Operation) -> CirrusResult<RemoteRecord> {
    match failure {
        RemoteFailure::Verdict(Classified::Conflict {
            server_record: Some(server),
            ..
        }) => Ok(server),
        other => Err(other.into_error(operation).into()),
    }
}

fn as_topic(record: RemoteRecord) -> CirrusResult<Topic> {
    match ChangedRecord::try_from(record)? {
        ChangedRecord::Topic(topic) => Ok(topic),
        other => Err(unexpected("topic", other.id())),
    }
}

fn as_note(record: RemoteRecord) -> CirrusResult<Note> {
    match ChangedRecord::try_from(record)? {
        ChangedRecord::Note(note) => Ok(note),
        other => Err(unexpected("note", other.id())),
    }
}

fn first_topic(saved: Vec<RemoteRecord>) -> CirrusResult<Option<Topic>> {
    saved.into_iter().next().map(as_topic).transpose()
}

fn first_note(saved: Vec<RemoteRecord>) -> CirrusResult<Option<Note>> {
    saved.into_iter().next().map(as_note).transpose()
}

fn unexpected(expected: &str, id: &RecordId) -> cirrus_core::CirrusError {
    ValidationError::InvalidValue {
        field: "record_type".to_string(),
        reason: format!("expected a {} for {}", expected, id),
    }
    .into()
}

/// Ids of `request` a rejected batch reported as not found.
fn already_deleted(err: &RemoteError, request: &[RecordId]) -> Vec<RecordId> {
    err.partial
        .iter()
        .filter(|(_, item_err)| item_err.code == RemoteErrorCode::UnknownItem)
        .filter_map(|(item, _)| match item {
            AffectedItem::Record(id) if request.contains(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}
