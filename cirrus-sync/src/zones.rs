//! Zone registry: the known zones of every scope and their change tokens.
//!
//! All mutation runs on the registry's own lane. State is persisted through
//! the `SyncStateStore` after every change, including after each
//! acknowledged page of a zone-delta cycle.

use crate::classify::{Classified, ErrorClassifier};
use crate::fetch::{self, DeltaCursor, DeltaPage, DeltaSource, FetchOutcome};
use crate::lane::Lane;
use crate::retry::{call_with_retry, RemoteFailure};
use async_trait::async_trait;
use cirrus_core::{
    AffectedItem, ChangeToken, CirrusResult, DatabaseScope, Operation, RecordZone, RemoteError,
    RemoteStore, SyncConfig, ValidationError, ZoneId,
};
use cirrus_events::{CacheEvent, EventHub};
use cirrus_storage::{ScopeState, SyncStateStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Told about zone-level changes so the content cache can react.
#[async_trait]
pub trait ZoneListener: Send + Sync {
    /// Zones removed from `scope`.
    async fn zones_deleted(&self, scope: DatabaseScope, zones: &[ZoneId]);

    /// Zones reported changed in `scope` by a completed delta cycle.
    async fn zones_changed(&self, scope: DatabaseScope, zones: &[ZoneId]);
}

struct RegistryInner {
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn SyncStateStore>,
    config: SyncConfig,
    classifier: ErrorClassifier,
    scopes: RwLock<HashMap<DatabaseScope, ScopeState>>,
    listener: RwLock<Option<Arc<dyn ZoneListener>>>,
    lane: Lane,
    hub: EventHub,
}

/// Tracks zones per scope.
#[derive(Clone)]
pub struct ZoneRegistry {
    inner: Arc<RegistryInner>,
}

impl ZoneRegistry {
    /// Must be called inside a tokio runtime.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn SyncStateStore>,
        config: SyncConfig,
        classifier: ErrorClassifier,
    ) -> Self {
        let scopes = DatabaseScope::ALL
            .into_iter()
            .map(|scope| (scope, ScopeState::initial(scope)))
            .collect();
        let hub = EventHub::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(RegistryInner {
                remote,
                store,
                config,
                classifier,
                scopes: RwLock::new(scopes),
                listener: RwLock::new(None),
                lane: Lane::new("zones"),
                hub,
            }),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn ZoneListener>) {
        *self.inner.listener.write().await = Some(listener);
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn lane(&self) -> &Lane {
        &self.inner.lane
    }

    /// Whether the registry has queued work or an undelivered event.
    pub fn is_updating(&self) -> bool {
        !self.inner.lane.is_idle() || self.inner.hub.pending().is_pending()
    }

    // ========================================================================
    // READ ACCESS
    // ========================================================================

    /// Known zones of `scope` in display order.
    pub async fn zones(&self, scope: DatabaseScope) -> Vec<RecordZone> {
        self.inner
            .scopes
            .read()
            .await
            .get(&scope)
            .map(|s| s.zones.clone())
            .unwrap_or_default()
    }

    pub async fn contains(&self, scope: DatabaseScope, zone: &ZoneId) -> bool {
        self.inner
            .scopes
            .read()
            .await
            .get(&scope)
            .is_some_and(|s| s.contains(zone))
    }

    pub async fn change_token(&self, scope: DatabaseScope) -> Option<ChangeToken> {
        self.inner
            .scopes
            .read()
            .await
            .get(&scope)
            .and_then(|s| s.change_token.clone())
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Restore every scope from the state store.
    pub async fn load(&self) -> CirrusResult<()> {
        let inner = self.inner.clone();
        self.inner.lane.run(async move { inner.load().await }).await?
    }

    /// Create a custom zone in the private scope.
    pub async fn create_zone(
        &self,
        name: &str,
        owner: &str,
        scope: DatabaseScope,
    ) -> CirrusResult<RecordZone> {
        let id = ZoneId::new(name, owner);
        if id.is_default() {
            return Err(ValidationError::DefaultZoneImmutable.into());
        }
        if !scope.supports_custom_zones() {
            return Err(ValidationError::ZoneNotAllowed {
                scope,
                reason: "custom zones can only be created in the private scope".to_string(),
            }
            .into());
        }
        let inner = self.inner.clone();
        self.inner
            .lane
            .run(async move { inner.create_zone(id, scope).await })
            .await?
    }

    /// Delete a custom zone on the server and forget it locally.
    ///
    /// The active zone is not touched here; callers switch away first.
    pub async fn delete_zone(&self, zone: &ZoneId, scope: DatabaseScope) -> CirrusResult<()> {
        if zone.is_default() {
            return Err(ValidationError::DefaultZoneImmutable.into());
        }
        if !scope.supports_custom_zones() {
            return Err(ValidationError::ZoneNotAllowed {
                scope,
                reason: "zones can only be deleted from the private scope".to_string(),
            }
            .into());
        }
        let inner = self.inner.clone();
        let zone = zone.clone();
        self.inner
            .lane
            .run(async move { inner.delete_zone(zone, scope).await })
            .await?
    }

    /// Drop a zone from the local registry without telling the server.
    pub async fn forget_zone(&self, zone: &ZoneId, scope: DatabaseScope) -> CirrusResult<bool> {
        let inner = self.inner.clone();
        let zone = zone.clone();
        self.inner
            .lane
            .run(async move { inner.forget_zone(zone, scope).await })
            .await?
    }

    /// Bring the zone set of `scope` up to date with the server.
    pub async fn sync_zones(&self, scope: DatabaseScope) -> CirrusResult<()> {
        if !scope.supports_zone_deltas() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner
            .lane
            .run(async move { inner.sync_scope(scope).await })
            .await?
    }
}

impl RegistryInner {
    async fn load(&self) -> CirrusResult<()> {
        for scope in DatabaseScope::ALL {
            if let Some(state) = self.store.load_scope(scope).await? {
                debug!(
                    scope = %scope,
                    zones = state.zones.len(),
                    has_token = state.change_token.is_some(),
                    "Restored zone state"
                );
                self.scopes.write().await.insert(scope, state);
            }
        }
        Ok(())
    }

    async fn create_zone(&self, id: ZoneId, scope: DatabaseScope) -> CirrusResult<RecordZone> {
        let affected = [AffectedItem::Zone(id.clone())];
        let saved = match call_with_retry(
            &self.config.retry,
            &self.classifier,
            Operation::ModifyZones,
            &affected,
            || self.remote.modify_zones(scope, vec![RecordZone::new(id.clone())], vec![]),
        )
        .await
        {
            Ok(outcome) => outcome.saved,
            // Another device created it first; the server copy wins.
            Err(RemoteFailure::Verdict(Classified::Conflict { .. })) => {
                vec![RecordZone::new(id.clone())]
            }
            Err(failure) => return Err(failure.into_error(Operation::ModifyZones).into()),
        };

        let zone = saved
            .iter()
            .find(|z| z.id == id)
            .cloned()
            .unwrap_or_else(|| RecordZone::new(id.clone()));
        let changed = self
            .update_scope(scope, |state| {
                saved
                    .into_iter()
                    .fold(false, |acc, z| state.insert_zone(z) | acc)
            })
            .await?;
        if changed {
            self.post(CacheEvent::zones_changed(scope));
        }
        info!(scope = %scope, zone = %zone.id, "Created zone");
        Ok(zone)
    }

    async fn delete_zone(&self, zone: ZoneId, scope: DatabaseScope) -> CirrusResult<()> {
        let affected = [AffectedItem::Zone(zone.clone())];
        match call_with_retry(
            &self.config.retry,
            &self.classifier,
            Operation::DeleteZones,
            &affected,
            || self.remote.modify_zones(scope, vec![], vec![zone.clone()]),
        )
        .await
        {
            Ok(_) => {}
            Err(failure) if failure.is_success() => {
                debug!(zone = %zone, "Zone already gone on the server");
            }
            Err(failure) => return Err(failure.into_error(Operation::DeleteZones).into()),
        }
        if self.update_scope(scope, |state| state.remove_zone(&zone)).await? {
            self.post(CacheEvent::zones_changed(scope));
        }
        if let Some(listener) = self.listener().await {
            listener.zones_deleted(scope, std::slice::from_ref(&zone)).await;
        }
        info!(scope = %scope, zone = %zone, "Deleted zone");
        Ok(())
    }

    async fn forget_zone(&self, zone: ZoneId, scope: DatabaseScope) -> CirrusResult<bool> {
        let removed = self
            .update_scope(scope, |state| state.remove_zone(&zone))
            .await?;
        if removed {
            self.post(CacheEvent::zones_changed(scope));
        }
        Ok(removed)
    }

    /// Mutate one scope's state and persist it if `f` reports a change.
    async fn update_scope<F>(&self, scope: DatabaseScope, f: F) -> CirrusResult<bool>
    where
        F: FnOnce(&mut ScopeState) -> bool,
    {
        let snapshot = {
            let mut scopes = self.scopes.write().await;
            let state = scopes
                .entry(scope)
                .or_insert_with(|| ScopeState::initial(scope));
            if !f(state) {
                return Ok(false);
            }
            state.clone()
        };
        self.store.save_scope(&snapshot).await?;
        Ok(true)
    }

    fn post(&self, event: CacheEvent) {
        self.hub.post_when_idle(self.lane.idle_barrier(), event);
    }

    async fn listener(&self) -> Option<Arc<dyn ZoneListener>> {
        self.listener.read().await.clone()
    }

    async fn sync_scope(&self, scope: DatabaseScope) -> CirrusResult<()> {
        let mut cursor = {
            let scopes = self.scopes.read().await;
            let state = scopes.get(&scope);
            let mut cursor: DeltaCursor<ZoneId, ZoneId> =
                DeltaCursor::resume_from(state.and_then(|s| s.change_token.clone()));
            if let Some(state) = state {
                cursor
                    .pending
                    .seed_changed(state.pending_zone_ids.iter().cloned(), ZoneId::clone);
                cursor.full_resync = state.full_resync;
            }
            cursor
        };

        let source = ZoneDeltaSource { inner: self, scope };
        let batch = match fetch::run(&source, &mut cursor, &self.config, &self.classifier).await? {
            FetchOutcome::Completed(batch) => batch,
            FetchOutcome::ZoneNotFound => return Ok(()),
        };

        let unknown: Vec<ZoneId> = {
            let scopes = self.scopes.read().await;
            batch
                .changed
                .iter()
                .filter(|id| !scopes.get(&scope).is_some_and(|s| s.contains(id)))
                .cloned()
                .collect()
        };
        let fetched = if unknown.is_empty() {
            Vec::new()
        } else {
            let affected: Vec<AffectedItem> =
                unknown.iter().cloned().map(AffectedItem::Zone).collect();
            call_with_retry(
                &self.config.retry,
                &self.classifier,
                Operation::FetchZones,
                &affected,
                || self.remote.fetch_zones(scope, &unknown),
            )
            .await
            .map_err(|failure| failure.into_error(Operation::FetchZones))?
        };

        let mut dropped = Vec::new();
        {
            let mut scopes = self.scopes.write().await;
            let state = scopes
                .entry(scope)
                .or_insert_with(|| ScopeState::initial(scope));
            if batch.full_resync {
                // A full snapshot lists every zone that still exists.
                dropped = state
                    .zones
                    .iter()
                    .filter(|z| !z.id.is_default() && !batch.changed.contains(&z.id))
                    .map(|z| z.id.clone())
                    .collect();
                for id in &dropped {
                    state.remove_zone(id);
                }
            }
            for zone in fetched {
                state.insert_zone(zone);
            }
            state.pending_zone_ids.clear();
            state.full_resync = false;
            let snapshot = state.clone();
            drop(scopes);
            self.store.save_scope(&snapshot).await?;
        }

        if let Some(listener) = self.listener().await {
            if !dropped.is_empty() {
                listener.zones_deleted(scope, &dropped).await;
            }
            if !batch.changed.is_empty() {
                listener.zones_changed(scope, &batch.changed).await;
            }
        }
        info!(
            scope = %scope,
            changed = batch.changed.len(),
            deleted = batch.deleted.len() + dropped.len(),
            full_resync = batch.full_resync,
            "Synced zones"
        );
        self.post(CacheEvent::zones_changed(scope));
        Ok(())
    }
}

/// Zone deltas of one scope. Acknowledging a page removes its deleted zones
/// and persists the token together with the changed ids still waiting for
/// metadata.
struct ZoneDeltaSource<'a> {
    inner: &'a RegistryInner,
    scope: DatabaseScope,
}

#[async_trait]
impl<'a> DeltaSource for ZoneDeltaSource<'a> {
    type Change = ZoneId;
    type Key = ZoneId;

    fn key(change: &ZoneId) -> ZoneId {
        change.clone()
    }

    fn affected(&self) -> Vec<AffectedItem> {
        Vec::new()
    }

    async fn fetch_page(
        &self,
        token: Option<ChangeToken>,
    ) -> Result<DeltaPage<ZoneId, ZoneId>, RemoteError> {
        self.inner
            .remote
            .fetch_zone_deltas(self.scope, token)
            .await
            .map(DeltaPage::from)
    }

    async fn acknowledge(
        &self,
        page: &DeltaPage<ZoneId, ZoneId>,
        cursor: &DeltaCursor<ZoneId, ZoneId>,
    ) -> CirrusResult<()> {
        let scope = self.scope;
        let mut removed = Vec::new();
        self.inner
            .update_scope(scope, |state| {
                for zone in &page.deleted {
                    if state.remove_zone(zone) {
                        removed.push(zone.clone());
                    }
                }
                state.change_token = cursor.token.clone();
                state.pending_zone_ids = cursor.pending.changed_keys().cloned().collect();
                state.full_resync = cursor.full_resync;
                true
            })
            .await?;

        if !removed.is_empty() {
            debug!(scope = %scope, zones = removed.len(), "Removed deleted zones");
            if let Some(listener) = self.inner.listener().await {
                listener.zones_deleted(scope, &removed).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_storage::InMemorySyncStateStore;
    use cirrus_test_utils::fixtures::test_config;
    use cirrus_test_utils::{Endpoint, FakeRemote};

    fn registry(remote: &FakeRemote) -> (ZoneRegistry, Arc<InMemorySyncStateStore>) {
        let store = Arc::new(InMemorySyncStateStore::new());
        let registry = ZoneRegistry::new(
            Arc::new(remote.clone()),
            store.clone(),
            test_config(),
            ErrorClassifier::new(),
        );
        (registry, store)
    }

    #[tokio::test]
    async fn test_create_zone_only_in_private_scope() {
        let remote = FakeRemote::new();
        let (registry, _) = registry(&remote);

        let err = registry
            .create_zone("Work", "me", DatabaseScope::Shared)
            .await
            .expect_err("shared scope cannot create zones");
        assert!(matches!(
            err,
            cirrus_core::CirrusError::Validation(ValidationError::ZoneNotAllowed { .. })
        ));
        assert_eq!(remote.calls(Endpoint::ModifyZones).await, 0);

        registry
            .create_zone("Work", "me", DatabaseScope::Private)
            .await
            .expect("create should succeed");
        let names: Vec<_> = registry
            .zones(DatabaseScope::Private)
            .await
            .into_iter()
            .map(|z| z.id.name)
            .collect();
        assert_eq!(names, vec!["_defaultZone", "Work"]);
    }

    #[tokio::test]
    async fn test_default_zone_is_immutable() {
        let remote = FakeRemote::new();
        let (registry, _) = registry(&remote);
        let err = registry
            .delete_zone(&ZoneId::default_zone(), DatabaseScope::Private)
            .await
            .expect_err("default zone cannot be deleted");
        assert!(matches!(
            err,
            cirrus_core::CirrusError::Validation(ValidationError::DefaultZoneImmutable)
        ));
    }

    #[tokio::test]
    async fn test_delete_of_missing_zone_succeeds() {
        let remote = FakeRemote::new();
        let (registry, _) = registry(&remote);
        registry
            .delete_zone(&ZoneId::new("Ghost", "me"), DatabaseScope::Private)
            .await
            .expect("not-found on delete is success");
    }

    #[tokio::test]
    async fn test_sync_merges_new_zones_and_drops_deleted() {
        let remote = FakeRemote::new();
        let (registry, store) = registry(&remote);
        let home = ZoneId::new("Home", "me");
        let work = ZoneId::new("Work", "me");
        remote.server_create_zone(DatabaseScope::Private, work.clone()).await;
        remote.server_create_zone(DatabaseScope::Private, home.clone()).await;
        registry
            .sync_zones(DatabaseScope::Private)
            .await
            .expect("sync should succeed");
        assert!(registry.contains(DatabaseScope::Private, &home).await);
        assert!(registry.contains(DatabaseScope::Private, &work).await);

        remote.server_delete_zone(DatabaseScope::Private, &work).await;
        registry
            .sync_zones(DatabaseScope::Private)
            .await
            .expect("sync should succeed");
        assert!(!registry.contains(DatabaseScope::Private, &work).await);

        let persisted = store
            .load_scope(DatabaseScope::Private)
            .await
            .expect("load should succeed")
            .expect("state should be saved");
        assert_eq!(persisted.zones.len(), 2);
        assert_eq!(
            persisted.change_token,
            registry.change_token(DatabaseScope::Private).await
        );
    }

    #[tokio::test]
    async fn test_public_scope_has_no_zone_deltas() {
        let remote = FakeRemote::new();
        let (registry, _) = registry(&remote);
        registry
            .sync_zones(DatabaseScope::Public)
            .await
            .expect("sync should succeed");
        assert_eq!(remote.calls(Endpoint::FetchZoneDeltas).await, 0);
    }
}
