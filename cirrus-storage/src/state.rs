//! Durable sync state and the store trait.
//!
//! Only the zone registry and the active-zone pointer survive a restart.
//! Record content is rebuilt from a full resync on cold start, so its
//! change tokens stay in memory with the cache they describe.

use async_trait::async_trait;
use cirrus_core::{
    sort_zones, ChangeToken, CirrusResult, DatabaseScope, RecordZone, ZoneId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted state of one database scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    pub scope: DatabaseScope,
    /// Last zone-delta token acknowledged by the fetch engine.
    pub change_token: Option<ChangeToken>,
    /// Known zones in display order.
    pub zones: Vec<RecordZone>,
    /// Zones reported changed by pages already acknowledged but whose
    /// metadata has not been fetched yet.
    pub pending_zone_ids: Vec<ZoneId>,
    /// The unfinished cycle started from a nil token, so its result is a
    /// complete snapshot of the scope's zones.
    #[serde(default)]
    pub full_resync: bool,
}

impl ScopeState {
    /// State of a scope that has never synced.
    pub fn initial(scope: DatabaseScope) -> Self {
        let zones = if scope.has_default_zone() {
            vec![RecordZone::default_zone()]
        } else {
            Vec::new()
        };
        Self {
            scope,
            change_token: None,
            zones,
            pending_zone_ids: Vec::new(),
            full_resync: false,
        }
    }

    pub fn contains(&self, zone: &ZoneId) -> bool {
        self.zones.iter().any(|z| &z.id == zone)
    }

    /// Insert a zone unless one with the same id is already known. Returns
    /// whether the set changed.
    pub fn insert_zone(&mut self, zone: RecordZone) -> bool {
        if self.contains(&zone.id) {
            return false;
        }
        self.zones.push(zone);
        sort_zones(&mut self.zones);
        true
    }

    /// Remove a zone. The default zone is never removed.
    pub fn remove_zone(&mut self, zone: &ZoneId) -> bool {
        if zone.is_default() {
            return false;
        }
        let before = self.zones.len();
        self.zones.retain(|z| &z.id != zone);
        self.pending_zone_ids.retain(|id| id != zone);
        self.zones.len() != before
    }
}

/// Which zone the content cache mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveZone {
    pub scope: DatabaseScope,
    pub zone: ZoneId,
}

impl Default for ActiveZone {
    fn default() -> Self {
        Self {
            scope: DatabaseScope::Private,
            zone: ZoneId::default_zone(),
        }
    }
}

/// Storage seam for durable sync state.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Load a scope's state, `None` if it was never saved.
    async fn load_scope(&self, scope: DatabaseScope) -> CirrusResult<Option<ScopeState>>;

    async fn save_scope(&self, state: &ScopeState) -> CirrusResult<()>;

    async fn load_active_zone(&self) -> CirrusResult<Option<ActiveZone>>;

    async fn save_active_zone(&self, active: &ActiveZone) -> CirrusResult<()>;

    /// Token for draining delivered notifications.
    async fn load_notification_token(&self) -> CirrusResult<Option<ChangeToken>>;

    async fn save_notification_token(&self, token: Option<&ChangeToken>) -> CirrusResult<()>;
}

/// In-memory state store for tests and ephemeral sessions.
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug, Default)]
pub struct InMemorySyncStateStore {
    inner: tokio::sync::RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    scopes: HashMap<DatabaseScope, ScopeState>,
    active_zone: Option<ActiveZone>,
    notification_token: Option<ChangeToken>,
    saves: u64,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful save calls; lets tests observe persistence.
    pub async fn save_count(&self) -> u64 {
        self.inner.read().await.saves
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn load_scope(&self, scope: DatabaseScope) -> CirrusResult<Option<ScopeState>> {
        Ok(self.inner.read().await.scopes.get(&scope).cloned())
    }

    async fn save_scope(&self, state: &ScopeState) -> CirrusResult<()> {
        let mut inner = self.inner.write().await;
        inner.scopes.insert(state.scope, state.clone());
        inner.saves += 1;
        Ok(())
    }

    async fn load_active_zone(&self) -> CirrusResult<Option<ActiveZone>> {
        Ok(self.inner.read().await.active_zone.clone())
    }

    async fn save_active_zone(&self, active: &ActiveZone) -> CirrusResult<()> {
        let mut inner = self.inner.write().await;
        inner.active_zone = Some(active.clone());
        inner.saves += 1;
        Ok(())
    }

    async fn load_notification_token(&self) -> CirrusResult<Option<ChangeToken>> {
        Ok(self.inner.read().await.notification_token.clone())
    }

    async fn save_notification_token(&self, token: Option<&ChangeToken>) -> CirrusResult<()> {
        let mut inner = self.inner.write().await;
        inner.notification_token = token.cloned();
        inner.saves += 1;
        Ok(())
    }
}
