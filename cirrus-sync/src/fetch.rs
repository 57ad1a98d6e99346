//! Change-token fetch engine.
//!
//! Drives a `DeltaSource` page by page from a `DeltaCursor`. Each page is
//! folded into the cursor's pending delta and its token becomes the cursor's
//! token before the source is asked to acknowledge it, so a cycle cut short
//! at any point resumes from the last acknowledged page without losing the
//! pages before it.
//!
//! ```text
//!  token ──► fetch_page ──► fold into pending ──► cursor.token = new_token ──► acknowledge
//!    ▲                                                                            │
//!    └──────────────────────────── more_coming ◄──────────────────────────────────┘
//! ```

use crate::classify::{Classified, ErrorClassifier, RecoverableKind};
use async_trait::async_trait;
use cirrus_core::{
    AffectedItem, ChangeToken, CirrusResult, DatabaseScope, Operation, RecordDeltaPage, RecordId,
    RemoteError, RemoteRecord, RemoteStore, SyncConfig, SyncError, ZoneDeltaPage, ZoneId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

/// One page of a delta stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaPage<C, K> {
    pub changed: Vec<C>,
    pub deleted: Vec<K>,
    pub new_token: ChangeToken,
    pub more_coming: bool,
}

impl From<ZoneDeltaPage> for DeltaPage<ZoneId, ZoneId> {
    fn from(page: ZoneDeltaPage) -> Self {
        Self {
            changed: page.changed,
            deleted: page.deleted,
            new_token: page.new_token,
            more_coming: page.more_coming,
        }
    }
}

impl From<RecordDeltaPage> for DeltaPage<RemoteRecord, RecordId> {
    fn from(page: RecordDeltaPage) -> Self {
        Self {
            changed: page.changed,
            deleted: page.deleted,
            new_token: page.new_token,
            more_coming: page.more_coming,
        }
    }
}

/// Changes accumulated over the acknowledged pages of an unfinished cycle,
/// keyed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelta<C, K: Ord> {
    changed: BTreeMap<K, C>,
    deleted: BTreeSet<K>,
}

impl<C, K: Ord> Default for PendingDelta<C, K> {
    fn default() -> Self {
        Self {
            changed: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }
}

impl<C, K: Ord + Clone> PendingDelta<C, K> {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Ids currently held as changed.
    pub fn changed_keys(&self) -> impl Iterator<Item = &K> {
        self.changed.keys()
    }

    pub fn deleted_keys(&self) -> impl Iterator<Item = &K> {
        self.deleted.iter()
    }

    /// Fold one page in. A deletion cancels an earlier change of the same
    /// id; a change after a deletion is kept alongside it, and since
    /// deletions are applied first the entity ends up present.
    pub fn fold(&mut self, changed: Vec<C>, deleted: Vec<K>, key: impl Fn(&C) -> K) {
        for id in deleted {
            self.changed.remove(&id);
            self.deleted.insert(id);
        }
        for change in changed {
            self.changed.insert(key(&change), change);
        }
    }

    fn clear(&mut self) {
        self.changed.clear();
        self.deleted.clear();
    }
}

impl<C, K: Ord> PendingDelta<C, K> {
    /// Seed with changes known from a previous run whose bodies were never
    /// fetched; `placeholder` stands in for the body.
    pub fn seed_changed(&mut self, keys: impl IntoIterator<Item = K>, placeholder: impl Fn(&K) -> C) {
        for key in keys {
            let change = placeholder(&key);
            self.changed.insert(key, change);
        }
    }
}

/// Position in a delta stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaCursor<C, K: Ord> {
    /// Last acknowledged token. `None` fetches everything from scratch.
    pub token: Option<ChangeToken>,
    pub pending: PendingDelta<C, K>,
    /// Set while the cycle in progress started from a nil token.
    pub full_resync: bool,
}

impl<C, K: Ord> Default for DeltaCursor<C, K> {
    fn default() -> Self {
        Self {
            token: None,
            pending: PendingDelta::default(),
            full_resync: false,
        }
    }
}

impl<C, K: Ord + Clone> DeltaCursor<C, K> {
    pub fn resume_from(token: Option<ChangeToken>) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Drop the token and everything pending.
    pub fn reset(&mut self) {
        self.token = None;
        self.pending.clear();
        self.full_resync = false;
    }

    fn take_batch(&mut self) -> DeltaBatch<C, K> {
        let pending = std::mem::take(&mut self.pending);
        let batch = DeltaBatch {
            changed: pending.changed.into_values().collect(),
            deleted: pending.deleted.into_iter().collect(),
            full_resync: self.full_resync,
        };
        self.full_resync = false;
        batch
    }
}

/// Result of a completed cycle. Apply `deleted` before `changed`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch<C, K> {
    pub changed: Vec<C>,
    pub deleted: Vec<K>,
    /// The batch is a complete snapshot and replaces the cached contents.
    pub full_resync: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<C, K> {
    Completed(DeltaBatch<C, K>),
    /// The zone being fetched no longer exists.
    ZoneNotFound,
}

/// A paged stream of changes since a token.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    type Change: Clone + Send + Sync + Debug;
    type Key: Ord + Clone + Send + Sync + Debug;

    fn key(change: &Self::Change) -> Self::Key;

    /// Items to match against per-item errors when classifying failures.
    fn affected(&self) -> Vec<AffectedItem>;

    async fn fetch_page(
        &self,
        token: Option<ChangeToken>,
    ) -> Result<DeltaPage<Self::Change, Self::Key>, RemoteError>;

    /// Called after each page has been folded into `cursor`. This is where a
    /// durable source persists the cursor.
    async fn acknowledge(
        &self,
        _page: &DeltaPage<Self::Change, Self::Key>,
        _cursor: &DeltaCursor<Self::Change, Self::Key>,
    ) -> CirrusResult<()> {
        Ok(())
    }
}

/// Run one fetch cycle to completion.
///
/// On error the cursor keeps whatever was acknowledged, so the next call
/// resumes where this one stopped.
pub async fn run<S: DeltaSource>(
    source: &S,
    cursor: &mut DeltaCursor<S::Change, S::Key>,
    config: &SyncConfig,
    classifier: &ErrorClassifier,
) -> CirrusResult<FetchOutcome<S::Change, S::Key>> {
    if cursor.token.is_none() && cursor.pending.is_empty() {
        cursor.full_resync = true;
    }
    let affected = source.affected();
    let mut resets = 0u32;
    let mut attempt = 0u32;

    loop {
        let err = match source.fetch_page(cursor.token.clone()).await {
            Ok(page) => {
                attempt = 0;
                let more_coming = page.more_coming;
                cursor
                    .pending
                    .fold(page.changed.clone(), page.deleted.clone(), S::key);
                cursor.token = Some(page.new_token.clone());
                source.acknowledge(&page, cursor).await?;
                tracing::debug!(
                    changed = page.changed.len(),
                    deleted = page.deleted.len(),
                    more_coming,
                    "Fetched delta page"
                );
                if !more_coming {
                    return Ok(FetchOutcome::Completed(cursor.take_batch()));
                }
                continue;
            }
            Err(err) => err,
        };

        match classifier.classify(Some(&err), Operation::FetchChanges, &affected, true) {
            Classified::Recoverable(RecoverableKind::TokenExpired) => {
                resets += 1;
                if resets > config.max_token_resets {
                    return Err(SyncError::TokenResetLimit { resets }.into());
                }
                tracing::info!(resets, "Change token expired; restarting from scratch");
                cursor.reset();
                cursor.full_resync = true;
            }
            Classified::Recoverable(RecoverableKind::ZoneMissing) => {
                return Ok(FetchOutcome::ZoneNotFound);
            }
            Classified::Transient { retry_after } => {
                if attempt >= config.retry.max_retries {
                    return Err(SyncError::RetriesExhausted {
                        operation: Operation::FetchChanges,
                        attempts: attempt + 1,
                    }
                    .into());
                }
                let delay = retry_after.unwrap_or_else(|| config.retry.backoff_for(attempt));
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient fetch failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            verdict => return Err(verdict.into_error(Operation::FetchChanges).into()),
        }
    }
}

// ============================================================================
// SOURCES
// ============================================================================

/// Record changes inside one zone.
pub struct RecordDeltaSource {
    pub remote: Arc<dyn RemoteStore>,
    pub scope: DatabaseScope,
    pub zone: ZoneId,
}

#[async_trait]
impl DeltaSource for RecordDeltaSource {
    type Change = RemoteRecord;
    type Key = RecordId;

    fn key(change: &RemoteRecord) -> RecordId {
        change.id.clone()
    }

    fn affected(&self) -> Vec<AffectedItem> {
        vec![AffectedItem::Zone(self.zone.clone())]
    }

    async fn fetch_page(
        &self,
        token: Option<ChangeToken>,
    ) -> Result<DeltaPage<RemoteRecord, RecordId>, RemoteError> {
        self.remote
            .fetch_record_deltas(self.scope, &self.zone, token)
            .await
            .map(DeltaPage::from)
    }
}
