//! The container that wires the caches together and routes pushes.

use crate::classify::ErrorClassifier;
use crate::content::ContentCache;
use crate::retry::call_with_retry;
use crate::zones::ZoneRegistry;
use cirrus_core::{
    schema, AffectedItem, CirrusResult, DatabaseScope, Operation, PushNotification, RecordZone,
    RemoteStore, Subscription, SubscriptionId, SyncConfig, ZoneId,
};
use cirrus_storage::{InMemorySyncStateStore, LmdbSyncStateStore, SyncStateStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Subscription ids for a scope, optionally narrowed to a zone and a record
/// type.
///
/// - no zone: `[<scope>]`
/// - with a record type: `[<scope>.<zone>.<type>]`
/// - default zone without a type: one id per engine record type
/// - any other zone: `[<scope>.<zone>]`
pub fn subscription_ids(
    scope: DatabaseScope,
    zone: Option<&ZoneId>,
    record_type: Option<&str>,
) -> Vec<SubscriptionId> {
    let Some(zone) = zone else {
        return vec![SubscriptionId::new(scope.as_str())];
    };
    let prefix = format!("{}.{}", scope, zone);
    match record_type {
        Some(record_type) => vec![SubscriptionId::new(format!("{}.{}", prefix, record_type))],
        None if zone.is_default() => [schema::TOPIC, schema::NOTE]
            .into_iter()
            .map(|record_type| SubscriptionId::new(format!("{}.{}", prefix, record_type)))
            .collect(),
        None => vec![SubscriptionId::new(prefix)],
    }
}

/// Owns the zone registry and the content cache and keeps them in step.
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    classifier: ErrorClassifier,
    zones: ZoneRegistry,
    content: ContentCache,
    subscriptions: RwLock<HashSet<SubscriptionId>>,
}

impl SyncEngine {
    /// Build an engine over `remote` and `store`. Must be called inside a
    /// tokio runtime.
    pub async fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn SyncStateStore>,
        config: SyncConfig,
    ) -> CirrusResult<Self> {
        config.validate()?;
        let classifier = ErrorClassifier::new();
        let zones = ZoneRegistry::new(
            remote.clone(),
            store.clone(),
            config.clone(),
            classifier.clone(),
        );
        let content = ContentCache::new(remote.clone(), store, config.clone(), classifier.clone());
        zones.set_listener(Arc::new(content.clone())).await;
        Ok(Self {
            remote,
            config,
            classifier,
            zones,
            content,
            subscriptions: RwLock::new(HashSet::new()),
        })
    }

    /// Like `new`, with the state store chosen by `config.state_dir`: LMDB
    /// when a directory is set, in-memory otherwise.
    pub async fn open(remote: Arc<dyn RemoteStore>, config: SyncConfig) -> CirrusResult<Self> {
        config.validate()?;
        let store: Arc<dyn SyncStateStore> = match &config.state_dir {
            Some(dir) => Arc::new(LmdbSyncStateStore::open(dir, config.lmdb_map_size_mb)?),
            None => Arc::new(InMemorySyncStateStore::new()),
        };
        Self::new(remote, store, config).await
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether either cache has queued work or an undelivered event.
    pub fn is_updating(&self) -> bool {
        self.zones.is_updating() || self.content.is_updating()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Register subscriptions, restore persisted state, sync zones and load
    /// the active zone.
    pub async fn start(&self) -> CirrusResult<()> {
        for scope in [DatabaseScope::Private, DatabaseScope::Shared] {
            for id in subscription_ids(scope, None, None) {
                self.subscribe(scope, Subscription::Database { id }).await?;
            }
        }
        for scope in [DatabaseScope::Public, DatabaseScope::Private] {
            let zone = ZoneId::default_zone();
            for record_type in [schema::TOPIC, schema::NOTE] {
                for id in subscription_ids(scope, Some(&zone), Some(record_type)) {
                    self.subscribe(
                        scope,
                        Subscription::Query {
                            id,
                            zone: zone.clone(),
                            record_type: record_type.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }

        self.zones.load().await?;
        for scope in [DatabaseScope::Private, DatabaseScope::Shared] {
            self.zones.sync_zones(scope).await?;
        }

        let persisted = self.content.inner.store.load_active_zone().await?;
        let (scope, zone) = match persisted {
            Some(active)
                if (active.zone.is_default() && active.scope.has_default_zone())
                    || self.zones.contains(active.scope, &active.zone).await =>
            {
                (active.scope, active.zone)
            }
            Some(active) => {
                debug!(zone = %active.zone, "Persisted active zone is gone; using fallback");
                active.scope.fallback_zone()
            }
            None => DatabaseScope::Private.fallback_zone(),
        };
        info!(scope = %scope, zone = %zone, "Sync engine started");
        self.switch_zone(scope, zone).await
    }

    /// Re-sync zones and re-read the active zone.
    pub async fn refresh(&self) -> CirrusResult<()> {
        for scope in [DatabaseScope::Private, DatabaseScope::Shared] {
            self.zones.sync_zones(scope).await?;
        }
        if self.content.active_zone().zone.is_default() {
            self.content.fetch_current_zone().join().await?
        } else {
            self.content.fetch_changes().join().await?
        }
    }

    // ========================================================================
    // ZONES
    // ========================================================================

    /// Make `zone` the active zone and wait for it to load. Custom private
    /// zones get a record-zone subscription on first use.
    pub async fn switch_zone(&self, scope: DatabaseScope, zone: ZoneId) -> CirrusResult<()> {
        if scope.supports_custom_zones() && !zone.is_default() {
            for id in subscription_ids(scope, Some(&zone), None) {
                if !self.subscriptions.read().await.contains(&id) {
                    self.subscribe(
                        scope,
                        Subscription::RecordZone {
                            id,
                            zone: zone.clone(),
                        },
                    )
                    .await?;
                }
            }
        }
        self.content.switch_zone(scope, zone).join().await?
    }

    pub async fn create_zone(&self, name: &str, owner: &str) -> CirrusResult<RecordZone> {
        self.zones
            .create_zone(name, owner, DatabaseScope::Private)
            .await
    }

    /// Delete a zone, switching the content cache to the fallback zone
    /// first if the zone is active.
    pub async fn delete_zone(&self, zone: &ZoneId, scope: DatabaseScope) -> CirrusResult<()> {
        let active = self.content.active_zone();
        if active.scope == scope && &active.zone == zone {
            let (fallback_scope, fallback_zone) = scope.fallback_zone();
            self.switch_zone(fallback_scope, fallback_zone).await?;
        }
        self.zones.delete_zone(zone, scope).await?;
        for id in subscription_ids(scope, Some(zone), None) {
            self.unsubscribe(scope, &id).await?;
        }
        Ok(())
    }

    // ========================================================================
    // PUSH
    // ========================================================================

    /// Route a push delivered by the transport layer.
    pub async fn handle_push(&self, push: PushNotification) -> CirrusResult<()> {
        let known = match push.subscription_id() {
            Some(id) => self.subscriptions.read().await.contains(id),
            None => false,
        };
        if !known {
            debug!(subscription = ?push.subscription_id(), "Ignoring push");
            return Ok(());
        }

        let active = self.content.active_zone();
        match push {
            PushNotification::Database { scope, .. } => self.zones.sync_zones(scope).await,
            PushNotification::RecordZone { scope, zone, .. } => {
                if active.scope == scope && active.zone == zone {
                    self.content.fetch_changes().join().await?
                } else {
                    Ok(())
                }
            }
            PushNotification::Query(notification) => {
                let in_active_zone = notification.scope == active.scope
                    && notification
                        .record_id
                        .as_ref()
                        .is_some_and(|id| id.zone == active.zone);
                if in_active_zone {
                    self.content
                        .reconcile_notifications(Some(notification))
                        .join()
                        .await?
                } else {
                    Ok(())
                }
            }
            PushNotification::ReadNotification { .. } => Ok(()),
        }
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Registered subscription ids, sorted.
    pub async fn subscriptions(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.subscriptions.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    async fn subscribe(&self, scope: DatabaseScope, subscription: Subscription) -> CirrusResult<()> {
        let id = subscription.id().clone();
        let affected = [AffectedItem::Subscription(id.clone())];
        call_with_retry(
            &self.config.retry,
            &self.classifier,
            Operation::ModifySubscriptions,
            &affected,
            || self.remote.subscribe(scope, subscription.clone()),
        )
        .await
        .or_else(|failure| {
            if failure.is_success() {
                Ok(())
            } else {
                Err(failure.into_error(Operation::ModifySubscriptions))
            }
        })?;
        debug!(scope = %scope, subscription = %id.as_str(), "Subscribed");
        self.subscriptions.write().await.insert(id);
        Ok(())
    }

    async fn unsubscribe(&self, scope: DatabaseScope, id: &SubscriptionId) -> CirrusResult<()> {
        if !self.subscriptions.write().await.remove(id) {
            return Ok(());
        }
        let affected = [AffectedItem::Subscription(id.clone())];
        call_with_retry(
            &self.config.retry,
            &self.classifier,
            Operation::DeleteSubscriptions,
            &affected,
            || self.remote.unsubscribe(scope, id),
        )
        .await
        .or_else(|failure| {
            if failure.is_success() {
                Ok(())
            } else {
                Err(failure.into_error(Operation::DeleteSubscriptions))
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_subscription_id() {
        assert_eq!(
            subscription_ids(DatabaseScope::Shared, None, None),
            vec![SubscriptionId::new("Shared")]
        );
    }

    #[test]
    fn test_default_zone_subscription_ids() {
        let zone = ZoneId::default_zone();
        assert_eq!(
            subscription_ids(DatabaseScope::Private, Some(&zone), None),
            vec![
                SubscriptionId::new(format!("Private.{}.Topic", zone)),
                SubscriptionId::new(format!("Private.{}.Note", zone)),
            ]
        );
        assert_eq!(
            subscription_ids(DatabaseScope::Public, Some(&zone), Some("Note")),
            vec![SubscriptionId::new(format!("Public.{}.Note", zone))]
        );
    }

    #[test]
    fn test_custom_zone_subscription_id() {
        let zone = ZoneId::new("Work", "me");
        assert_eq!(
            subscription_ids(DatabaseScope::Private, Some(&zone), None),
            vec![SubscriptionId::new("Private.Work-me")]
        );
    }
}
