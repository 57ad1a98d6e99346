//! Content cache: the topic/note mirror of the active zone.
//!
//! Everything that touches the mirror runs as a job on the cache's lane.
//! Switching zones bumps an epoch immediately, before the switch job is even
//! queued; every job captures the epoch it was submitted under and throws its
//! results away if the epoch moved on in the meantime.

use crate::classify::ErrorClassifier;
use crate::fetch::{self, DeltaCursor, FetchOutcome, RecordDeltaSource};
use crate::lane::{JobHandle, Lane};
use crate::notify;
use crate::retry::call_with_retry;
use crate::zones::ZoneListener;
use async_trait::async_trait;
use cirrus_core::{
    schema, AffectedItem, ChangeNotification, ChangeToken, ChangedRecord, CirrusResult,
    DatabaseScope, Note, Operation, Predicate, RecordId, RecordQuery, RemoteRecord, RemoteStore,
    SyncConfig, ZoneId,
};
use cirrus_cache::TopicCache;
use cirrus_events::{CacheEvent, ChangeReason, ChangeSet, EventHub};
use cirrus_storage::{ActiveZone, SyncStateStore};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The active zone together with the epoch it was selected in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Selection {
    pub(crate) epoch: u64,
    pub(crate) active: ActiveZone,
}

pub(crate) struct ContentState {
    pub(crate) cache: TopicCache,
    cursor: DeltaCursor<RemoteRecord, RecordId>,
    notification_token: Option<ChangeToken>,
    token_loaded: bool,
}

pub(crate) struct ContentInner {
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) store: Arc<dyn SyncStateStore>,
    pub(crate) config: SyncConfig,
    pub(crate) classifier: ErrorClassifier,
    selection: Mutex<Selection>,
    pub(crate) state: RwLock<ContentState>,
    pub(crate) lane: Lane,
    pub(crate) hub: EventHub,
}

/// Mirror of the active zone's topics and notes.
#[derive(Clone)]
pub struct ContentCache {
    pub(crate) inner: Arc<ContentInner>,
}

impl ContentCache {
    /// Starts on the private default zone with an empty cache. Must be
    /// called inside a tokio runtime.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn SyncStateStore>,
        config: SyncConfig,
        classifier: ErrorClassifier,
    ) -> Self {
        let active = ActiveZone::default();
        let cache = TopicCache::new(active.scope, config.current_user.clone());
        let hub = EventHub::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(ContentInner {
                remote,
                store,
                config,
                classifier,
                selection: Mutex::new(Selection { epoch: 0, active }),
                state: RwLock::new(ContentState {
                    cache,
                    cursor: DeltaCursor::default(),
                    notification_token: None,
                    token_loaded: false,
                }),
                lane: Lane::new("content"),
                hub,
            }),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn lane(&self) -> &Lane {
        &self.inner.lane
    }

    /// Whether the cache has queued work or an undelivered event.
    pub fn is_updating(&self) -> bool {
        !self.inner.lane.is_idle() || self.inner.hub.pending().is_pending()
    }

    /// Wait until every queued job has finished.
    pub async fn wait_idle(&self) {
        self.inner.lane.wait_idle().await;
    }

    /// The zone the cache mirrors, or is switching to.
    pub fn active_zone(&self) -> ActiveZone {
        self.inner.current().active
    }

    /// A copy of the mirror as it is right now.
    pub async fn snapshot(&self) -> TopicCache {
        self.inner.state.read().await.cache.clone()
    }

    /// Run `f` against the mirror without copying it.
    pub async fn read<R>(&self, f: impl FnOnce(&TopicCache) -> R) -> R {
        f(&self.inner.state.read().await.cache)
    }

    // ========================================================================
    // JOBS
    // ========================================================================

    /// Make `zone` the active zone: clear the mirror, then load the zone.
    ///
    /// Results of jobs queued before this call are discarded from this point
    /// on, even if they are still running.
    pub fn switch_zone(&self, scope: DatabaseScope, zone: ZoneId) -> JobHandle<CirrusResult<()>> {
        let selection = self.inner.select(ActiveZone { scope, zone });
        debug!(
            epoch = selection.epoch,
            scope = %selection.active.scope,
            zone = %selection.active.zone,
            "Switching active zone"
        );
        let inner = self.inner.clone();
        self.spawn("switch_zone", async move { inner.activate(selection).await })
    }

    /// Pull whatever changed in the active zone since the last fetch.
    pub fn fetch_changes(&self) -> JobHandle<CirrusResult<()>> {
        let selection = self.inner.current();
        let inner = self.inner.clone();
        self.spawn("fetch_changes", async move { inner.refresh(&selection).await })
    }

    /// Rebuild the mirror from a full query of the active zone.
    pub fn fetch_current_zone(&self) -> JobHandle<CirrusResult<()>> {
        let selection = self.inner.current();
        let inner = self.inner.clone();
        self.spawn("fetch_current_zone", async move {
            inner.fetch_everything(&selection).await
        })
    }

    /// Re-fetch a single record. A record the server no longer has is
    /// removed from the mirror.
    pub fn refresh_record(&self, id: RecordId) -> JobHandle<CirrusResult<()>> {
        let selection = self.inner.current();
        let inner = self.inner.clone();
        self.spawn("refresh_record", async move {
            inner.refresh_record(&selection, id).await
        })
    }

    /// Drain outstanding notifications, plus `delivered` if the transport
    /// handed one over, and apply them to the mirror.
    pub fn reconcile_notifications(
        &self,
        delivered: Option<ChangeNotification>,
    ) -> JobHandle<CirrusResult<()>> {
        let selection = self.inner.current();
        let inner = self.inner.clone();
        self.spawn("reconcile_notifications", async move {
            inner.reconcile(&selection, delivered).await
        })
    }

    pub(crate) fn spawn<F>(&self, job: &'static str, work: F) -> JobHandle<CirrusResult<()>>
    where
        F: Future<Output = CirrusResult<()>> + Send + 'static,
    {
        self.inner.lane.submit(async move {
            let result = work.await;
            if let Err(err) = &result {
                warn!(job, error = %err, "Content job failed");
            }
            result
        })
    }
}

#[async_trait]
impl ZoneListener for ContentCache {
    async fn zones_deleted(&self, scope: DatabaseScope, zones: &[ZoneId]) {
        let active = self.active_zone();
        if active.scope == scope && zones.contains(&active.zone) {
            warn!(scope = %scope, zone = %active.zone, "Active zone was deleted");
            self.inner.post(
                CacheEvent::content_changed(scope, active.zone)
                    .with_reason(ChangeReason::ZoneNotFound),
            );
        }
    }

    async fn zones_changed(&self, scope: DatabaseScope, zones: &[ZoneId]) {
        let active = self.active_zone();
        if active.scope == scope && !active.zone.is_default() && zones.contains(&active.zone) {
            // The handle is dropped; failures are logged by the job itself.
            let _ = self.fetch_changes();
        }
    }
}

impl ContentInner {
    fn lock_selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, active: ActiveZone) -> Selection {
        let mut selection = self.lock_selection();
        selection.epoch += 1;
        selection.active = active;
        selection.clone()
    }

    pub(crate) fn current(&self) -> Selection {
        self.lock_selection().clone()
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.lock_selection().epoch == epoch
    }

    pub(crate) fn post(&self, event: CacheEvent) {
        self.hub.post_when_idle(self.lane.idle_barrier(), event);
    }

    pub(crate) fn content_event(selection: &Selection) -> CacheEvent {
        CacheEvent::content_changed(selection.active.scope, selection.active.zone.clone())
    }

    async fn activate(&self, selection: Selection) -> CirrusResult<()> {
        if !self.is_current(selection.epoch) {
            debug!(epoch = selection.epoch, "Skipping superseded zone switch");
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            state.cache.reset(selection.active.scope);
            state.cursor = DeltaCursor::default();
        }
        self.store.save_active_zone(&selection.active).await?;
        info!(
            scope = %selection.active.scope,
            zone = %selection.active.zone,
            "Active zone changed"
        );

        let result = self.refresh(&selection).await;
        if result.is_err() && self.is_current(selection.epoch) {
            // Observers still need to drop what they showed for the old zone.
            self.post(Self::content_event(&selection));
        }
        result
    }

    /// Default zones have no server-side diffing and are re-read in full.
    async fn refresh(&self, selection: &Selection) -> CirrusResult<()> {
        if selection.active.zone.is_default() {
            self.fetch_everything(selection).await
        } else {
            self.fetch_deltas(selection).await
        }
    }

    async fn fetch_deltas(&self, selection: &Selection) -> CirrusResult<()> {
        let active = &selection.active;
        let mut cursor = std::mem::take(&mut self.state.write().await.cursor);
        let source = RecordDeltaSource {
            remote: self.remote.clone(),
            scope: active.scope,
            zone: active.zone.clone(),
        };
        let result = fetch::run(&source, &mut cursor, &self.config, &self.classifier).await;

        {
            let mut state = self.state.write().await;
            if !self.is_current(selection.epoch) {
                debug!(zone = %active.zone, "Discarding stale delta fetch");
                return Ok(());
            }
            state.cursor = cursor;
        }

        match result? {
            FetchOutcome::Completed(batch) => {
                if let Some(changes) = self
                    .apply(selection, batch.deleted, batch.changed, batch.full_resync)
                    .await?
                {
                    self.post(Self::content_event(selection).with_changes(changes));
                }
            }
            FetchOutcome::ZoneNotFound => {
                warn!(scope = %active.scope, zone = %active.zone, "Active zone not found");
                self.post(Self::content_event(selection).with_reason(ChangeReason::ZoneNotFound));
            }
        }
        Ok(())
    }

    /// Topics sorted by name, the notes of each topic, then every note that
    /// references none of them.
    async fn fetch_everything(&self, selection: &Selection) -> CirrusResult<()> {
        let active = &selection.active;
        let topic_query =
            RecordQuery::new(schema::TOPIC, active.zone.clone()).sorted_by(schema::TOPIC_NAME);
        let mut records = self.query_all(active.scope, &topic_query).await?;
        let topic_ids: Vec<RecordId> = records
            .iter()
            .filter(|r| r.record_type == schema::TOPIC)
            .map(|r| r.id.clone())
            .collect();

        for topic in &topic_ids {
            let notes = self
                .query_all(active.scope, &notes_of(&active.zone, topic))
                .await?;
            records.extend(notes);
        }
        let orphan_query = RecordQuery::new(schema::NOTE, active.zone.clone()).with_predicate(
            Predicate::ReferenceNotIn {
                field: schema::NOTE_TOPIC.to_string(),
                targets: topic_ids,
            },
        );
        records.extend(self.query_all(active.scope, &orphan_query).await?);

        let fetched = records.len();
        let outcome = {
            let mut state = self.state.write().await;
            if !self.is_current(selection.epoch) {
                debug!(zone = %active.zone, "Discarding stale zone fetch");
                return Ok(());
            }
            state.cache.replace_all(convert(records))
        };
        info!(zone = %active.zone, records = fetched, "Loaded zone");
        self.post(Self::content_event(selection).with_changes(ChangeSet {
            changed: outcome.changed,
            ..ChangeSet::default()
        }));
        Ok(())
    }

    async fn refresh_record(&self, selection: &Selection, id: RecordId) -> CirrusResult<()> {
        let fetched = self
            .fetch_by_id(selection.active.scope, std::slice::from_ref(&id))
            .await?;
        let (deleted, changed) = if fetched.is_empty() {
            (vec![id], Vec::new())
        } else {
            (Vec::new(), fetched)
        };
        if let Some(changes) = self.apply(selection, deleted, changed, false).await? {
            self.post(Self::content_event(selection).with_changes(changes));
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        selection: &Selection,
        delivered: Option<ChangeNotification>,
    ) -> CirrusResult<()> {
        let active = &selection.active;
        let token = self.notification_token().await?;
        let mut drained =
            notify::drain(self.remote.as_ref(), &self.config, &self.classifier, token).await?;
        drained.notifications.extend(delivered);

        let plan = notify::plan(&drained.notifications, active.scope, &active.zone);
        if !plan.is_empty() {
            let changed = if plan.changed.is_empty() {
                Vec::new()
            } else {
                self.fetch_by_id(active.scope, &plan.changed).await?
            };
            debug!(
                deleted = plan.deleted.len(),
                changed = changed.len(),
                "Applying notifications"
            );
            if let Some(changes) = self.apply(selection, plan.deleted, changed, false).await? {
                self.post(Self::content_event(selection).with_changes(changes));
            }
        }
        notify::mark_consumed(self.remote.as_ref(), &self.classifier, &plan.consumed).await;

        self.state.write().await.notification_token = drained.token.clone();
        self.store
            .save_notification_token(drained.token.as_ref())
            .await
    }

    async fn notification_token(&self) -> CirrusResult<Option<ChangeToken>> {
        {
            let state = self.state.read().await;
            if state.token_loaded {
                return Ok(state.notification_token.clone());
            }
        }
        let token = self.store.load_notification_token().await?;
        let mut state = self.state.write().await;
        state.notification_token = token.clone();
        state.token_loaded = true;
        Ok(token)
    }

    // ========================================================================
    // BATCH APPLICATION
    // ========================================================================

    /// Apply a server batch: deletions first, then changes, then the notes
    /// of any topic the batch introduced. `None` if the selection moved on.
    pub(crate) async fn apply(
        &self,
        selection: &Selection,
        deleted: Vec<RecordId>,
        changed: Vec<RemoteRecord>,
        full_resync: bool,
    ) -> CirrusResult<Option<ChangeSet>> {
        let records = convert(changed);
        let outcome = {
            let mut state = self.state.write().await;
            if !self.is_current(selection.epoch) {
                debug!(epoch = selection.epoch, "Discarding stale batch");
                return Ok(None);
            }
            if full_resync {
                state.cache.replace_all(records)
            } else {
                state.cache.apply_deleted(&deleted);
                state.cache.apply_changed(records)
            }
        };
        if !outcome.unmatched_shares.is_empty() {
            debug!(
                shares = outcome.unmatched_shares.len(),
                "Dropped shares matching no cached record"
            );
        }
        if !full_resync {
            self.fetch_children(selection, &outcome.new_topics).await?;
        }
        Ok(Some(ChangeSet {
            deleted: if full_resync { Vec::new() } else { deleted },
            changed: outcome.changed,
            new_note: None,
        }))
    }

    async fn fetch_children(&self, selection: &Selection, topics: &[RecordId]) -> CirrusResult<()> {
        let active = &selection.active;
        for topic in topics {
            let notes: Vec<Note> = convert(
                self.query_all(active.scope, &notes_of(&active.zone, topic))
                    .await?,
            )
            .into_iter()
            .filter_map(|record| match record {
                ChangedRecord::Note(note) => Some(note),
                _ => None,
            })
            .collect();
            let mut state = self.state.write().await;
            if !self.is_current(selection.epoch) {
                return Ok(());
            }
            state.cache.merge_children(topic, notes);
        }
        Ok(())
    }

    // ========================================================================
    // REMOTE READS
    // ========================================================================

    /// Every page of `query`. A query the classifier deems ignorable yields
    /// what was fetched so far.
    async fn query_all(
        &self,
        scope: DatabaseScope,
        query: &RecordQuery,
    ) -> CirrusResult<Vec<RemoteRecord>> {
        let affected = [AffectedItem::Zone(query.zone.clone())];
        let mut records = Vec::new();
        let mut cursor = None;
        loop {
            let page = match call_with_retry(
                &self.config.retry,
                &self.classifier,
                Operation::FetchRecords,
                &affected,
                || self.remote.fetch_records(scope, query, cursor.clone()),
            )
            .await
            {
                Ok(page) => page,
                Err(failure) if failure.is_success() => break,
                Err(failure) => return Err(failure.into_error(Operation::FetchRecords).into()),
            };
            records.extend(page.records);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(records)
    }

    /// Records that vanished before they could be fetched are left out.
    async fn fetch_by_id(
        &self,
        scope: DatabaseScope,
        ids: &[RecordId],
    ) -> CirrusResult<Vec<RemoteRecord>> {
        let affected: Vec<AffectedItem> = ids.iter().cloned().map(AffectedItem::Record).collect();
        let result = call_with_retry(
            &self.config.retry,
            &self.classifier,
            Operation::FetchRecords,
            &affected,
            || self.remote.fetch_records_by_id(scope, ids),
        )
        .await
        .map_err(|failure| failure.into_error(Operation::FetchRecords))?;

        if let Some(failure) = &result.failure {
            let verdict =
                self.classifier
                    .classify(Some(failure), Operation::FetchRecords, &affected, true);
            if !verdict.is_success() {
                return Err(verdict.into_error(Operation::FetchRecords).into());
            }
            debug!(
                requested = ids.len(),
                fetched = result.records.len(),
                "Some records vanished before they could be fetched"
            );
        }
        Ok(result.records)
    }
}

fn notes_of(zone: &ZoneId, topic: &RecordId) -> RecordQuery {
    RecordQuery::new(schema::NOTE, zone.clone()).with_predicate(Predicate::ReferenceEquals {
        field: schema::NOTE_TOPIC.to_string(),
        target: topic.clone(),
    })
}

/// Convert fetched records, skipping any the engine cannot read.
pub(crate) fn convert(records: Vec<RemoteRecord>) -> Vec<ChangedRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            match ChangedRecord::try_from(record) {
                Ok(changed) => Some(changed),
                Err(err) => {
                    warn!(record = %id, error = %err, "Skipping unreadable record");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_storage::InMemorySyncStateStore;
    use cirrus_test_utils::fixtures;
    use cirrus_test_utils::{Endpoint, FakeRemote};

    fn content(remote: &FakeRemote) -> (ContentCache, Arc<InMemorySyncStateStore>) {
        let store = Arc::new(InMemorySyncStateStore::new());
        let cache = ContentCache::new(
            Arc::new(remote.clone()),
            store.clone(),
            fixtures::test_config(),
            ErrorClassifier::new(),
        );
        (cache, store)
    }

    #[tokio::test]
    async fn test_default_zone_is_loaded_by_full_query() {
        let remote = FakeRemote::new();
        let zone = ZoneId::default_zone();
        let work = fixtures::topic(&zone, "Work");
        remote
            .server_save(DatabaseScope::Private, work.to_remote())
            .await;
        remote
            .server_save(DatabaseScope::Private, fixtures::remote_note(&zone, "a", Some(&work)))
            .await;
        remote
            .server_save(DatabaseScope::Private, fixtures::remote_note(&zone, "loose", None))
            .await;
        remote
            .server_save(DatabaseScope::Private, fixtures::foreign_record(&zone, "x"))
            .await;

        let (cache, store) = content(&remote);
        cache
            .switch_zone(DatabaseScope::Private, zone.clone())
            .join()
            .await
            .expect("lane should run the job")
            .expect("switch should succeed");

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.topics().len(), 1);
        assert_eq!(snapshot.topics()[0].notes.len(), 1);
        assert_eq!(snapshot.orphans().len(), 1);
        assert_eq!(remote.calls(Endpoint::FetchRecordDeltas).await, 0);
        assert_eq!(
            store
                .load_active_zone()
                .await
                .expect("load should succeed"),
            Some(ActiveZone::default())
        );
    }

    #[tokio::test]
    async fn test_custom_zone_is_loaded_by_deltas() {
        let remote = FakeRemote::new();
        let zone = ZoneId::new("Work", "me");
        remote
            .server_create_zone(DatabaseScope::Private, zone.clone())
            .await;
        let topic = fixtures::topic(&zone, "Plans");
        remote
            .server_save(DatabaseScope::Private, topic.to_remote())
            .await;
        remote
            .server_save(DatabaseScope::Private, fixtures::remote_note(&zone, "q3", Some(&topic)))
            .await;

        let (cache, _) = content(&remote);
        cache
            .switch_zone(DatabaseScope::Private, zone.clone())
            .join()
            .await
            .expect("lane should run the job")
            .expect("switch should succeed");
        assert_eq!(cache.snapshot().await.note_count(), 1);

        remote
            .server_delete(DatabaseScope::Private, &fixtures::record_id(&zone, "q3"))
            .await;
        cache
            .fetch_changes()
            .join()
            .await
            .expect("lane should run the job")
            .expect("fetch should succeed");
        assert_eq!(cache.snapshot().await.note_count(), 0);
        assert_eq!(remote.calls(Endpoint::FetchRecordDeltas).await, 2);
    }

    #[tokio::test]
    async fn test_missing_zone_emits_zone_not_found() {
        let remote = FakeRemote::new();
        let (cache, _) = content(&remote);
        let mut events = cache.hub().subscribe();
        let ghost = ZoneId::new("Ghost", "me");

        cache
            .switch_zone(DatabaseScope::Private, ghost.clone())
            .join()
            .await
            .expect("lane should run the job")
            .expect("a missing zone is not an error");

        let event = events.recv().await.expect("event should be delivered");
        assert_eq!(event.zone, Some(ghost));
        assert_eq!(event.reason, Some(ChangeReason::ZoneNotFound));
    }

    #[tokio::test]
    async fn test_refresh_record_removes_vanished_record() {
        let remote = FakeRemote::new();
        let zone = ZoneId::default_zone();
        let saved = remote
            .server_save(DatabaseScope::Private, fixtures::remote_topic(&zone, "Old"))
            .await;
        let (cache, _) = content(&remote);
        cache
            .switch_zone(DatabaseScope::Private, zone.clone())
            .join()
            .await
            .expect("lane should run the job")
            .expect("switch should succeed");

        remote.server_delete(DatabaseScope::Private, &saved.id).await;
        cache
            .refresh_record(saved.id.clone())
            .join()
            .await
            .expect("lane should run the job")
            .expect("refresh should succeed");
        assert!(cache.snapshot().await.find_topic(&saved.id).is_none());
    }
}
