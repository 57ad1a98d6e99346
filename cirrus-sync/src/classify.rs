//! Error classification at the remote boundary.
//!
//! Every remote result passes through `ErrorClassifier::classify` exactly once.
//! Callers act on the `Classified` verdict and never inspect a `RemoteError`
//! themselves.

use cirrus_core::{AffectedItem, Operation, RemoteError, RemoteErrorCode, RemoteRecord, SyncError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

/// Recoverable failures the fetch engine handles on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    /// Restart the cycle from a nil token.
    TokenExpired,
    /// The zone is gone; the caller switches away from it.
    ZoneMissing,
}

/// Verdict on a remote result.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    NoError,
    /// Benign race with a peer (the record was deleted before we fetched it).
    Ignorable,
    /// The server holds a newer version of `item`.
    Conflict {
        item: Option<AffectedItem>,
        server_record: Option<RemoteRecord>,
    },
    Recoverable(RecoverableKind),
    Transient { retry_after: Option<Duration> },
    PermissionDenied { message: String },
    Unhandled(RemoteError),
}

impl Classified {
    pub fn is_success(&self) -> bool {
        matches!(self, Classified::NoError | Classified::Ignorable)
    }

    /// Surface a verdict the caller could not absorb as an engine error.
    pub fn into_error(self, operation: Operation) -> SyncError {
        match self {
            Classified::PermissionDenied { message } => {
                SyncError::PermissionDenied { operation, message }
            }
            Classified::Unhandled(source) => SyncError::Unhandled { operation, source },
            other => SyncError::Unhandled {
                operation,
                source: RemoteError::new(RemoteErrorCode::InternalError, format!("{:?}", other)),
            },
        }
    }
}

/// A failure report waiting for someone to look at it.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub operation: Operation,
    pub error: RemoteError,
}

/// Holds at most one outstanding alert. Further reports while one is shown
/// are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct AlertSlot {
    current: Arc<Mutex<Option<Alert>>>,
}

impl AlertSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an alert. Returns false if another one is already showing.
    pub fn offer(&self, alert: Alert) -> bool {
        let Ok(mut current) = self.current.lock() else {
            return false;
        };
        if let Some(showing) = current.as_ref() {
            warn!(
                operation = %alert.operation,
                showing = %showing.operation,
                error = %alert.error,
                "Alert already showing; dropping report"
            );
            return false;
        }
        *current = Some(alert);
        true
    }

    pub fn current(&self) -> Option<Alert> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    /// Dismiss the showing alert, freeing the slot.
    pub fn acknowledge(&self) -> Option<Alert> {
        self.current.lock().ok().and_then(|mut c| c.take())
    }
}

/// Maps raw remote errors to `Classified` verdicts.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    alerts: AlertSlot,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> &AlertSlot {
        &self.alerts
    }

    /// Classify the result of `operation`.
    ///
    /// For partial failures, `affected` lists the items the call touched in
    /// the order the caller cares about; the first one with its own error is
    /// the one classified.
    pub fn classify(
        &self,
        err: Option<&RemoteError>,
        operation: Operation,
        affected: &[AffectedItem],
        escalate: bool,
    ) -> Classified {
        let Some(err) = err else {
            return Classified::NoError;
        };

        if err.is_partial() {
            let first = affected
                .iter()
                .find_map(|item| err.partial.get(item).map(|e| (Some(item.clone()), e)))
                .or_else(|| {
                    err.partial
                        .iter()
                        .next()
                        .map(|(item, e)| (Some(item.clone()), e))
                });
            if let Some((item, inner)) = first {
                return self.classify_single(inner, operation, item, escalate);
            }
        }
        self.classify_single(err, operation, affected.first().cloned(), escalate)
    }

    fn classify_single(
        &self,
        err: &RemoteError,
        operation: Operation,
        item: Option<AffectedItem>,
        escalate: bool,
    ) -> Classified {
        use RemoteErrorCode::*;

        match (err.code, operation) {
            (ServerRecordChanged, _) => Classified::Conflict {
                item,
                server_record: err.server_record.as_deref().cloned(),
            },
            (UnknownItem | ZoneNotFound, op) if op.is_delete() => Classified::NoError,
            (ChangeTokenExpired, Operation::FetchChanges) => {
                Classified::Recoverable(RecoverableKind::TokenExpired)
            }
            (ZoneNotFound, Operation::FetchChanges) => {
                Classified::Recoverable(RecoverableKind::ZoneMissing)
            }
            (_, Operation::MarkRead) => Classified::NoError,
            (UnknownItem, Operation::FetchRecords | Operation::FetchChanges) => Classified::Ignorable,
            (code, _) if code.is_transient() => Classified::Transient {
                retry_after: err.retry_after,
            },
            (PermissionFailure, _) => Classified::PermissionDenied {
                message: err.message.clone(),
            },
            _ => {
                error!(
                    operation = %operation,
                    code = ?err.code,
                    item = ?item,
                    error = %err,
                    "Unhandled remote error"
                );
                if escalate {
                    self.alerts.offer(Alert {
                        operation,
                        error: err.clone(),
                    });
                }
                Classified::Unhandled(err.clone())
            }
        }
    }
}
