//! CIRRUS Sync - Change-Token Sync Engine
//!
//! Keeps two local caches in step with a remote record store:
//!
//! - `ZoneRegistry`: the zones of every database scope, from zone deltas
//! - `ContentCache`: the topics and notes of the active zone, from record
//!   deltas (custom zones) or notifications and full queries (default zones)
//!
//! Each cache runs its work on its own `Lane` and publishes `CacheEvent`s only
//! after that lane has drained. `SyncEngine` wires the two together, registers
//! subscriptions and routes pushes.
//!
//! ```text
//! push ──► SyncEngine ──► ZoneRegistry ──(ZoneListener)──► ContentCache
//!                │                                             ▲
//!                └──────────── record / query pushes ──────────┘
//! ```

pub mod classify;
pub mod content;
pub mod engine;
pub mod fetch;
pub mod lane;
pub mod mutation;
pub mod notify;
pub mod retry;
pub mod telemetry;
pub mod zones;

pub use classify::{Alert, AlertSlot, Classified, ErrorClassifier, RecoverableKind};
pub use content::ContentCache;
pub use engine::{subscription_ids, SyncEngine};
pub use fetch::{
    DeltaBatch, DeltaCursor, DeltaPage, DeltaSource, FetchOutcome, PendingDelta,
    RecordDeltaSource,
};
pub use lane::{JobHandle, Lane};
pub use mutation::MutationOutcome;
pub use notify::NotificationPlan;
pub use retry::{call_with_retry, RemoteFailure};
pub use telemetry::init_tracing;
pub use zones::{ZoneListener, ZoneRegistry};
