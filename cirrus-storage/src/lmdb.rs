//! LMDB-backed sync state store.
//!
//! Uses the heed crate (Rust bindings for LMDB). State is small and written
//! after every acknowledged page, so each save is its own write transaction.
//!
//! # Layout
//!
//! One unnamed database, JSON values:
//! - `scope/<Scope>` → `ScopeState`
//! - `active_zone` → `ActiveZone`
//! - `notification_token` → `Option<ChangeToken>`

use std::path::Path;

use async_trait::async_trait;
use cirrus_core::{ChangeToken, CirrusResult, DatabaseScope};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::state::{ActiveZone, ScopeState, SyncStateStore};

const ACTIVE_ZONE_KEY: &str = "active_zone";
const NOTIFICATION_TOKEN_KEY: &str = "notification_token";

/// Error type for LMDB state operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStateError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStateError to CirrusError.
impl From<LmdbStateError> for cirrus_core::CirrusError {
    fn from(e: LmdbStateError) -> Self {
        let storage = match e {
            LmdbStateError::Serialization(reason) | LmdbStateError::Deserialization(reason) => {
                cirrus_core::StorageError::Serialization {
                    key: "lmdb".to_string(),
                    reason,
                }
            }
            LmdbStateError::EnvOpen(reason) | LmdbStateError::DbOpen(reason) => {
                cirrus_core::StorageError::Unavailable { reason }
            }
            other => cirrus_core::StorageError::TransactionFailed {
                reason: other.to_string(),
            },
        };
        cirrus_core::CirrusError::Storage(storage)
    }
}

/// Durable `SyncStateStore` on LMDB.
pub struct LmdbSyncStateStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbSyncStateStore {
    /// Open (or create) the state environment in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment or database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStateError> {
        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbStateError::EnvOpen(format!("map size of {} MB overflows", max_size_mb)))?;
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStateError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStateError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    fn scope_key(scope: DatabaseScope) -> String {
        format!("scope/{}", scope.as_str())
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LmdbStateError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        let bytes = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        let value = match bytes {
            Some(bytes) => Some(
                serde_json::from_slice(bytes)
                    .map_err(|e| LmdbStateError::Deserialization(e.to_string()))?,
            ),
            None => None,
        };
        Ok(value)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LmdbStateError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| LmdbStateError::Serialization(e.to_string()))?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStateError::Transaction(e.to_string()))?;

        tracing::trace!(key, bytes = bytes.len(), "Persisted sync state");
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for LmdbSyncStateStore {
    async fn load_scope(&self, scope: DatabaseScope) -> CirrusResult<Option<ScopeState>> {
        Ok(self.read(&Self::scope_key(scope))?)
    }

    async fn save_scope(&self, state: &ScopeState) -> CirrusResult<()> {
        Ok(self.write(&Self::scope_key(state.scope), state)?)
    }

    async fn load_active_zone(&self) -> CirrusResult<Option<ActiveZone>> {
        Ok(self.read(ACTIVE_ZONE_KEY)?)
    }

    async fn save_active_zone(&self, active: &ActiveZone) -> CirrusResult<()> {
        Ok(self.write(ACTIVE_ZONE_KEY, active)?)
    }

    async fn load_notification_token(&self) -> CirrusResult<Option<ChangeToken>> {
        let stored: Option<Option<ChangeToken>> = self.read(NOTIFICATION_TOKEN_KEY)?;
        Ok(stored.flatten())
    }

    async fn save_notification_token(&self, token: Option<&ChangeToken>) -> CirrusResult<()> {
        Ok(self.write(NOTIFICATION_TOKEN_KEY, &token)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::{RecordZone, ZoneId};
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbSyncStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbSyncStateStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[test]
    fn test_overflowing_map_size_is_an_error() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let result = LmdbSyncStateStore::open(dir.path(), usize::MAX / 1024);
        assert!(matches!(result, Err(LmdbStateError::EnvOpen(_))));
    }

    #[tokio::test]
    async fn test_missing_keys_load_as_none() {
        let (store, _dir) = create_test_store();
        assert!(store
            .load_scope(DatabaseScope::Shared)
            .await
            .expect("load should succeed")
            .is_none());
        assert!(store
            .load_active_zone()
            .await
            .expect("load should succeed")
            .is_none());
        assert!(store
            .load_notification_token()
            .await
            .expect("load should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_scope_state_survives_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let mut state = ScopeState::initial(DatabaseScope::Private);
        state.change_token = Some(ChangeToken::new(b"page-1".to_vec()));
        state.insert_zone(RecordZone::new(ZoneId::new("Work", "me")));
        state.pending_zone_ids.push(ZoneId::new("Travel", "me"));

        {
            let store = LmdbSyncStateStore::open(temp_dir.path(), 10)
                .expect("store creation should succeed");
            store.save_scope(&state).await.expect("save should succeed");
            store
                .save_active_zone(&ActiveZone {
                    scope: DatabaseScope::Private,
                    zone: ZoneId::new("Work", "me"),
                })
                .await
                .expect("save should succeed");
        }

        let store =
            LmdbSyncStateStore::open(temp_dir.path(), 10).expect("reopen should succeed");
        let loaded = store
            .load_scope(DatabaseScope::Private)
            .await
            .expect("load should succeed");
        assert_eq!(loaded, Some(state));

        let active = store
            .load_active_zone()
            .await
            .expect("load should succeed")
            .expect("active zone should be stored");
        assert_eq!(active.zone.name, "Work");
    }

    #[tokio::test]
    async fn test_notification_token_can_be_cleared() {
        let (store, _dir) = create_test_store();
        let token = ChangeToken::new(b"n-7".to_vec());
        store
            .save_notification_token(Some(&token))
            .await
            .expect("save should succeed");
        assert_eq!(
            store
                .load_notification_token()
                .await
                .expect("load should succeed"),
            Some(token)
        );

        store
            .save_notification_token(None)
            .await
            .expect("save should succeed");
        assert!(store
            .load_notification_token()
            .await
            .expect("load should succeed")
            .is_none());
    }
}
