//! Behaviour shared by every `SyncStateStore` implementation.

use cirrus_core::{zone_order, ChangeToken, DatabaseScope, RecordZone, ZoneId};
use cirrus_storage::{
    ActiveZone, InMemorySyncStateStore, LmdbSyncStateStore, ScopeState, SyncStateStore,
};
use proptest::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

async fn exercise_store(store: Arc<dyn SyncStateStore>) {
    for scope in DatabaseScope::ALL {
        let mut state = ScopeState::initial(scope);
        state.change_token = Some(ChangeToken::new(scope.as_str().as_bytes().to_vec()));
        store.save_scope(&state).await.expect("save should succeed");
    }

    for scope in DatabaseScope::ALL {
        let loaded = store
            .load_scope(scope)
            .await
            .expect("load should succeed")
            .expect("state should exist");
        assert_eq!(
            loaded.change_token,
            Some(ChangeToken::new(scope.as_str().as_bytes().to_vec()))
        );
    }

    let active = ActiveZone {
        scope: DatabaseScope::Shared,
        zone: ZoneId::new("Trip", "bob"),
    };
    store
        .save_active_zone(&active)
        .await
        .expect("save should succeed");
    assert_eq!(
        store.load_active_zone().await.expect("load should succeed"),
        Some(active)
    );
}

#[tokio::test]
async fn in_memory_store_keeps_scopes_apart() {
    exercise_store(Arc::new(InMemorySyncStateStore::new())).await;
}

#[tokio::test]
async fn lmdb_store_keeps_scopes_apart() {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let store = LmdbSyncStateStore::open(dir.path(), 10).expect("store creation should succeed");
    exercise_store(Arc::new(store)).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// However zones arrive, the known set stays deduplicated and in display
    /// order with the default zone first.
    #[test]
    fn zone_set_stays_sorted_and_unique(names in proptest::collection::vec("[a-e]{1,2}", 0..24)) {
        let mut state = ScopeState::initial(DatabaseScope::Private);
        for name in &names {
            state.insert_zone(RecordZone::new(ZoneId::new(name.clone(), "me")));
        }

        prop_assert!(state.zones[0].id.is_default());
        for pair in state.zones.windows(2) {
            prop_assert_eq!(zone_order(&pair[0].id, &pair[1].id), Ordering::Less);
        }
    }
}
