//! In-process `RemoteStore` for tests.
//!
//! Keeps records and zones per scope, an ordered change log that backs the
//! delta endpoints, and a notification queue. Tests script it from the
//! "server side" (other peers' edits), inject failures per endpoint, and
//! hold calls at a gate to observe in-flight behaviour.

use async_trait::async_trait;
use cirrus_core::{
    ChangeNotification, ChangeToken, DatabaseScope, ModifyRecordsOutcome, ModifyZonesOutcome,
    NotificationBatch, NotificationId, RecordDeltaPage, RecordId, RecordPage, RecordQuery,
    RecordVersion, RecordZone, RecordsById, RemoteError, RemoteErrorCode, RemoteRecord,
    RemoteStore, SavePolicy, Subscription, SubscriptionId, UserId, ZoneDeltaPage, ZoneId,
    AffectedItem, QueryCursor, FieldValue,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Remote endpoints, for failure injection, gates and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    FetchRecords,
    FetchRecordsById,
    FetchZoneDeltas,
    FetchZones,
    FetchRecordDeltas,
    ModifyRecords,
    ModifyZones,
    Subscribe,
    Unsubscribe,
    DrainNotifications,
    MarkConsumed,
}

/// Holds the next call to an endpoint until released.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until a call has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held call proceed.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Clone)]
enum RecordChange {
    Saved(RecordId),
    Deleted(RecordId),
}

#[derive(Debug, Clone)]
enum ZoneChange {
    Saved(ZoneId),
    Deleted(ZoneId),
}

#[derive(Debug, Default)]
struct ScopeData {
    zones: Vec<ZoneId>,
    records: BTreeMap<RecordId, RemoteRecord>,
    record_log: Vec<(u64, RecordChange)>,
    zone_log: Vec<(u64, ZoneChange)>,
    subscriptions: HashSet<SubscriptionId>,
}

#[derive(Debug, Default)]
struct FakeState {
    scopes: HashMap<DatabaseScope, ScopeData>,
    sequence: u64,
    notifications: Vec<ChangeNotification>,
    consumed: Vec<NotificationId>,
    failures: HashMap<Endpoint, VecDeque<RemoteError>>,
    scheduled: HashMap<Endpoint, BTreeMap<usize, RemoteError>>,
    gates: HashMap<Endpoint, Arc<Gate>>,
    calls: HashMap<Endpoint, usize>,
    record_delta_tokens: Vec<Option<ChangeToken>>,
    saved_batches: Vec<Vec<RecordId>>,
}

impl FakeState {
    fn scope(&mut self, scope: DatabaseScope) -> &mut ScopeData {
        self.scopes.entry(scope).or_default()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Scriptable in-memory remote store.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
    page_size: usize,
    current_user: UserId,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    /// Public and private scopes start with their default zone.
    pub fn new() -> Self {
        let mut state = FakeState::default();
        for scope in DatabaseScope::ALL {
            let data = state.scope(scope);
            if scope.has_default_zone() {
                data.zones.push(ZoneId::default_zone());
            }
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            page_size: 50,
            current_user: UserId::new("me"),
        }
    }

    /// Maximum entries per delta or query page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Creator stamped on records saved through `modify_records`.
    pub fn with_current_user(mut self, user: UserId) -> Self {
        self.current_user = user;
        self
    }

    // ========================================================================
    // SCRIPTING
    // ========================================================================

    /// Make the next call to `endpoint` fail with `error`. Queued failures
    /// are consumed in order.
    pub async fn fail_next(&self, endpoint: Endpoint, error: RemoteError) {
        let mut state = self.state.lock().await;
        state.failures.entry(endpoint).or_default().push_back(error);
    }

    /// Make the `nth` call to `endpoint` from now on (1-based) fail with
    /// `error`, letting the calls before it through.
    pub async fn fail_call(&self, endpoint: Endpoint, nth: usize, error: RemoteError) {
        let mut state = self.state.lock().await;
        let at = state.calls.get(&endpoint).copied().unwrap_or(0) + nth.max(1);
        state.scheduled.entry(endpoint).or_default().insert(at, error);
    }

    /// Hold the next call to `endpoint` until the returned gate is released.
    pub async fn install_gate(&self, endpoint: Endpoint) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state.lock().await.gates.insert(endpoint, gate.clone());
        gate
    }

    /// A peer saves a record (bumps its version and logs the change).
    pub async fn server_save(&self, scope: DatabaseScope, mut record: RemoteRecord) -> RemoteRecord {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        let data = state.scope(scope);
        let version = data
            .records
            .get(&record.id)
            .and_then(|r| r.version)
            .map_or(RecordVersion(1), |v| v.next());
        record.version = Some(version);
        data.records.insert(record.id.clone(), record.clone());
        data.record_log
            .push((sequence, RecordChange::Saved(record.id.clone())));
        record
    }

    /// A peer deletes a record.
    pub async fn server_delete(&self, scope: DatabaseScope, id: &RecordId) {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        let data = state.scope(scope);
        data.records.remove(id);
        data.record_log
            .push((sequence, RecordChange::Deleted(id.clone())));
    }

    /// A peer creates a zone.
    pub async fn server_create_zone(&self, scope: DatabaseScope, zone: ZoneId) {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        let data = state.scope(scope);
        if !data.zones.contains(&zone) {
            data.zones.push(zone.clone());
        }
        data.zone_log.push((sequence, ZoneChange::Saved(zone)));
    }

    /// A peer deletes a zone and everything in it.
    pub async fn server_delete_zone(&self, scope: DatabaseScope, zone: &ZoneId) {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence();
        let data = state.scope(scope);
        data.zones.retain(|z| z != zone);
        data.records.retain(|id, _| &id.zone != zone);
        data.zone_log
            .push((sequence, ZoneChange::Deleted(zone.clone())));
    }

    /// Queue a delivered notification.
    pub async fn push_notification(&self, notification: ChangeNotification) {
        self.state.lock().await.notifications.push(notification);
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub async fn calls(&self, endpoint: Endpoint) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Tokens presented to `fetch_record_deltas`, in call order.
    pub async fn record_delta_tokens(&self) -> Vec<Option<ChangeToken>> {
        self.state.lock().await.record_delta_tokens.clone()
    }

    pub async fn record(&self, scope: DatabaseScope, id: &RecordId) -> Option<RemoteRecord> {
        self.state.lock().await.scope(scope).records.get(id).cloned()
    }

    pub async fn zones(&self, scope: DatabaseScope) -> Vec<ZoneId> {
        self.state.lock().await.scope(scope).zones.clone()
    }

    pub async fn subscriptions(&self, scope: DatabaseScope) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self
            .state
            .lock()
            .await
            .scope(scope)
            .subscriptions
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn consumed_notifications(&self) -> Vec<NotificationId> {
        self.state.lock().await.consumed.clone()
    }

    /// Ids saved by each successful `modify_records` call.
    pub async fn saved_batches(&self) -> Vec<Vec<RecordId>> {
        self.state.lock().await.saved_batches.clone()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Count the call, wait at an installed gate, then pop a scripted failure.
    async fn enter(&self, endpoint: Endpoint) -> Result<(), RemoteError> {
        let (call, gate) = {
            let mut state = self.state.lock().await;
            let calls = state.calls.entry(endpoint).or_default();
            *calls += 1;
            let call = *calls;
            (call, state.gates.remove(&endpoint))
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut state = self.state.lock().await;
        if let Some(error) = state
            .scheduled
            .get_mut(&endpoint)
            .and_then(|scheduled| scheduled.remove(&call))
        {
            return Err(error);
        }
        match state.failures.get_mut(&endpoint).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn encode_token(sequence: u64) -> ChangeToken {
        ChangeToken::new(sequence.to_be_bytes().to_vec())
    }

    fn decode_token(token: Option<&ChangeToken>) -> Result<u64, RemoteError> {
        match token {
            None => Ok(0),
            Some(token) => token
                .as_bytes()
                .try_into()
                .map(u64::from_be_bytes)
                .map_err(|_| RemoteError::new(RemoteErrorCode::ChangeTokenExpired, "bad token")),
        }
    }
}

fn sort_value(record: &RemoteRecord, field: &str) -> String {
    match record.fields.get(field) {
        Some(FieldValue::String(value)) => value.clone(),
        Some(FieldValue::Int(value)) => format!("{:020}", value),
        _ => String::new(),
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn fetch_records(
        &self,
        scope: DatabaseScope,
        query: &RecordQuery,
        cursor: Option<QueryCursor>,
    ) -> Result<RecordPage, RemoteError> {
        self.enter(Endpoint::FetchRecords).await?;
        let mut state = self.state.lock().await;
        let data = state.scope(scope);
        if !data.zones.contains(&query.zone) {
            return Err(RemoteError::new(RemoteErrorCode::ZoneNotFound, "zone not found"));
        }
        let mut matching: Vec<RemoteRecord> = data
            .records
            .values()
            .filter(|r| r.id.zone == query.zone && r.record_type == query.record_type)
            .filter(|r| query.predicate.matches(r))
            .cloned()
            .collect();
        if let Some(sort) = &query.sort {
            matching.sort_by_key(|r| sort_value(r, &sort.field));
            if !sort.ascending {
                matching.reverse();
            }
        }

        let offset = cursor
            .and_then(|c| c.0.as_slice().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0) as usize;
        let end = (offset + self.page_size).min(matching.len());
        let records = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let cursor = (end < matching.len()).then(|| QueryCursor((end as u64).to_be_bytes().to_vec()));
        Ok(RecordPage { records, cursor })
    }

    async fn fetch_records_by_id(
        &self,
        scope: DatabaseScope,
        ids: &[RecordId],
    ) -> Result<RecordsById, RemoteError> {
        self.enter(Endpoint::FetchRecordsById).await?;
        let mut state = self.state.lock().await;
        let data = state.scope(scope);
        let mut records = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match data.records.get(id) {
                Some(record) => records.push(record.clone()),
                None => missing.push((
                    AffectedItem::Record(id.clone()),
                    RemoteError::new(RemoteErrorCode::UnknownItem, "record not found"),
                )),
            }
        }
        let failure = (!missing.is_empty()).then(|| RemoteError::partial(missing));
        Ok(RecordsById { records, failure })
    }

    async fn fetch_zone_deltas(
        &self,
        scope: DatabaseScope,
        token: Option<ChangeToken>,
    ) -> Result<ZoneDeltaPage, RemoteError> {
        self.enter(Endpoint::FetchZoneDeltas).await?;
        let since = Self::decode_token(token.as_ref())?;
        let page_size = self.page_size;
        let mut state = self.state.lock().await;
        let current = state.sequence;
        let data = state.scope(scope);

        let pending: Vec<_> = data.zone_log.iter().filter(|(seq, _)| *seq > since).collect();
        let more_coming = pending.len() > page_size;
        let page = &pending[..pending.len().min(page_size)];

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (_, change) in page {
            match change {
                ZoneChange::Saved(zone) => changed.push(zone.clone()),
                ZoneChange::Deleted(zone) => deleted.push(zone.clone()),
            }
        }
        let last = if more_coming {
            page.last().map_or(since, |(seq, _)| *seq)
        } else {
            current.max(since)
        };
        Ok(ZoneDeltaPage {
            changed,
            deleted,
            new_token: Self::encode_token(last),
            more_coming,
        })
    }

    async fn fetch_zones(
        &self,
        scope: DatabaseScope,
        ids: &[ZoneId],
    ) -> Result<Vec<RecordZone>, RemoteError> {
        self.enter(Endpoint::FetchZones).await?;
        let mut state = self.state.lock().await;
        let data = state.scope(scope);
        Ok(ids
            .iter()
            .filter(|id| data.zones.contains(id))
            .cloned()
            .map(RecordZone::new)
            .collect())
    }

    async fn fetch_record_deltas(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        token: Option<ChangeToken>,
    ) -> Result<RecordDeltaPage, RemoteError> {
        self.state
            .lock()
            .await
            .record_delta_tokens
            .push(token.clone());
        self.enter(Endpoint::FetchRecordDeltas).await?;
        let since = Self::decode_token(token.as_ref())?;
        let page_size = self.page_size;
        let mut state = self.state.lock().await;
        let current = state.sequence;
        let data = state.scope(scope);
        if !data.zones.contains(zone) {
            return Err(RemoteError::new(RemoteErrorCode::ZoneNotFound, "zone not found"));
        }

        let pending: Vec<_> = data
            .record_log
            .iter()
            .filter(|(seq, change)| {
                let id = match change {
                    RecordChange::Saved(id) | RecordChange::Deleted(id) => id,
                };
                *seq > since && &id.zone == zone
            })
            .collect();
        let more_coming = pending.len() > page_size;
        let page = &pending[..pending.len().min(page_size)];

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (_, change) in page {
            match change {
                RecordChange::Saved(id) => {
                    if let Some(record) = data.records.get(id) {
                        changed.push(record.clone());
                    }
                }
                RecordChange::Deleted(id) => deleted.push(id.clone()),
            }
        }
        let last = if more_coming {
            page.last().map_or(since, |(seq, _)| *seq)
        } else {
            current.max(since)
        };
        Ok(RecordDeltaPage {
            changed,
            deleted,
            new_token: Self::encode_token(last),
            more_coming,
        })
    }

    async fn modify_records(
        &self,
        scope: DatabaseScope,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> Result<ModifyRecordsOutcome, RemoteError> {
        self.enter(Endpoint::ModifyRecords).await?;
        let current_user = self.current_user.clone();
        let mut state = self.state.lock().await;

        // Atomic: validate everything before touching state.
        {
            let data = state.scope(scope);
            let mut failures = Vec::new();
            for record in &save {
                if !data.zones.contains(&record.id.zone) {
                    failures.push((
                        AffectedItem::Record(record.id.clone()),
                        RemoteError::new(RemoteErrorCode::ZoneNotFound, "zone not found"),
                    ));
                    continue;
                }
                if policy == SavePolicy::IfServerRecordUnchanged {
                    if let Some(server) = data.records.get(&record.id) {
                        if server.version != record.version {
                            failures.push((
                                AffectedItem::Record(record.id.clone()),
                                RemoteError::new(
                                    RemoteErrorCode::ServerRecordChanged,
                                    "record changed on server",
                                )
                                .with_server_record(server.clone()),
                            ));
                        }
                    }
                }
            }
            for id in &delete {
                if !data.records.contains_key(id) {
                    failures.push((
                        AffectedItem::Record(id.clone()),
                        RemoteError::new(RemoteErrorCode::UnknownItem, "record not found"),
                    ));
                }
            }
            if !failures.is_empty() {
                return Err(RemoteError::partial(failures));
            }
        }

        let mut saved = Vec::new();
        for mut record in save {
            let sequence = state.next_sequence();
            let data = state.scope(scope);
            let version = data
                .records
                .get(&record.id)
                .and_then(|r| r.version)
                .map_or(RecordVersion(1), |v| v.next());
            record.version = Some(version);
            if record.creator.is_none() {
                record.creator = Some(current_user.clone());
            }
            data.records.insert(record.id.clone(), record.clone());
            data.record_log
                .push((sequence, RecordChange::Saved(record.id.clone())));
            saved.push(record);
        }
        for id in &delete {
            let sequence = state.next_sequence();
            let data = state.scope(scope);
            data.records.remove(id);
            data.record_log.push((sequence, RecordChange::Deleted(id.clone())));
        }
        state
            .saved_batches
            .push(saved.iter().map(|r| r.id.clone()).collect());
        Ok(ModifyRecordsOutcome {
            saved,
            deleted: delete,
        })
    }

    async fn modify_zones(
        &self,
        scope: DatabaseScope,
        save: Vec<RecordZone>,
        delete: Vec<ZoneId>,
    ) -> Result<ModifyZonesOutcome, RemoteError> {
        self.enter(Endpoint::ModifyZones).await?;
        if !save.is_empty() && !scope.supports_custom_zones() {
            return Err(RemoteError::new(
                RemoteErrorCode::InvalidArguments,
                "custom zones are only supported in the private scope",
            ));
        }
        let mut state = self.state.lock().await;
        let missing: Vec<_> = {
            let data = state.scope(scope);
            delete
                .iter()
                .filter(|zone| !data.zones.contains(zone))
                .map(|zone| {
                    (
                        AffectedItem::Zone(zone.clone()),
                        RemoteError::new(RemoteErrorCode::ZoneNotFound, "zone not found"),
                    )
                })
                .collect()
        };
        if !missing.is_empty() {
            return Err(RemoteError::partial(missing));
        }

        for zone in &save {
            let sequence = state.next_sequence();
            let data = state.scope(scope);
            if !data.zones.contains(&zone.id) {
                data.zones.push(zone.id.clone());
            }
            data.zone_log.push((sequence, ZoneChange::Saved(zone.id.clone())));
        }
        for zone in &delete {
            let sequence = state.next_sequence();
            let data = state.scope(scope);
            data.zones.retain(|z| z != zone);
            data.records.retain(|id, _| &id.zone != zone);
            data.zone_log.push((sequence, ZoneChange::Deleted(zone.clone())));
        }
        Ok(ModifyZonesOutcome {
            saved: save,
            deleted: delete,
        })
    }

    async fn subscribe(
        &self,
        scope: DatabaseScope,
        subscription: Subscription,
    ) -> Result<(), RemoteError> {
        self.enter(Endpoint::Subscribe).await?;
        let mut state = self.state.lock().await;
        state
            .scope(scope)
            .subscriptions
            .insert(subscription.id().clone());
        Ok(())
    }

    async fn unsubscribe(
        &self,
        scope: DatabaseScope,
        id: &SubscriptionId,
    ) -> Result<(), RemoteError> {
        self.enter(Endpoint::Unsubscribe).await?;
        let mut state = self.state.lock().await;
        if state.scope(scope).subscriptions.remove(id) {
            Ok(())
        } else {
            Err(RemoteError::partial([(
                AffectedItem::Subscription(id.clone()),
                RemoteError::new(RemoteErrorCode::UnknownItem, "subscription not found"),
            )]))
        }
    }

    async fn drain_notifications(
        &self,
        token: Option<ChangeToken>,
    ) -> Result<NotificationBatch, RemoteError> {
        self.enter(Endpoint::DrainNotifications).await?;
        let since = Self::decode_token(token.as_ref())? as usize;
        let state = self.state.lock().await;
        let notifications = state
            .notifications
            .get(since..)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        Ok(NotificationBatch {
            notifications,
            new_token: Some(Self::encode_token(state.notifications.len() as u64)),
            more_coming: false,
        })
    }

    async fn mark_notifications_consumed(&self, ids: &[NotificationId]) -> Result<(), RemoteError> {
        self.enter(Endpoint::MarkConsumed).await?;
        self.state.lock().await.consumed.extend_from_slice(ids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn test_record_deltas_page_and_resume() {
        let remote = FakeRemote::new().with_page_size(2);
        let zone = ZoneId::new("Work", "me");
        remote.server_create_zone(DatabaseScope::Private, zone.clone()).await;
        for name in ["a", "b", "c"] {
            remote
                .server_save(DatabaseScope::Private, fixtures::remote_topic(&zone, name))
                .await;
        }

        let first = remote
            .fetch_record_deltas(DatabaseScope::Private, &zone, None)
            .await
            .expect("first page should succeed");
        assert_eq!(first.changed.len(), 2);
        assert!(first.more_coming);

        let second = remote
            .fetch_record_deltas(DatabaseScope::Private, &zone, Some(first.new_token.clone()))
            .await
            .expect("second page should succeed");
        assert_eq!(second.changed.len(), 1);
        assert!(!second.more_coming);
    }

    #[tokio::test]
    async fn test_conflicting_save_reports_server_record() {
        let remote = FakeRemote::new();
        let zone = ZoneId::default_zone();
        let saved = remote
            .server_save(DatabaseScope::Private, fixtures::remote_topic(&zone, "a"))
            .await;

        let mut stale = saved.clone();
        stale.version = Some(RecordVersion(0));
        let err = remote
            .modify_records(
                DatabaseScope::Private,
                vec![stale],
                vec![],
                SavePolicy::IfServerRecordUnchanged,
            )
            .await
            .expect_err("stale save must conflict");
        let item = err
            .partial
            .get(&AffectedItem::Record(saved.id.clone()))
            .expect("per-item error should be present");
        assert_eq!(item.code, RemoteErrorCode::ServerRecordChanged);
        assert_eq!(item.server_record.as_deref(), Some(&saved));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let remote = FakeRemote::new();
        remote
            .fail_next(
                Endpoint::FetchZoneDeltas,
                RemoteError::new(RemoteErrorCode::NetworkFailure, "offline"),
            )
            .await;
        assert!(remote
            .fetch_zone_deltas(DatabaseScope::Private, None)
            .await
            .is_err());
        assert!(remote
            .fetch_zone_deltas(DatabaseScope::Private, None)
            .await
            .is_ok());
        assert_eq!(remote.calls(Endpoint::FetchZoneDeltas).await, 2);
    }
}
