//! CIRRUS Storage - Persisted Sync State
//!
//! Defines the `SyncStateStore` seam for the state that must survive a
//! restart (per-scope change tokens, known zones, the active-zone pointer),
//! with an in-memory implementation and an LMDB-backed one.

pub mod lmdb;
pub mod state;

pub use lmdb::{LmdbStateError, LmdbSyncStateStore};
pub use state::{ActiveZone, InMemorySyncStateStore, ScopeState, SyncStateStore};
