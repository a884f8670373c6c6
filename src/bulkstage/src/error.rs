use std::result;

use thiserror::Error;

use crate::storage::storage_utils::{SeqNum, TabletId};

/// Custom error type for bulkstage.
///
/// Every status the log-apply, ingestion and checkpoint paths can observe is
/// a variant here; retry loops branch on the predicates below instead of
/// matching variants at each call site.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The operation belongs to a direct-load task older than the one
    /// currently installed. Safe to ignore wherever idempotency is expected.
    #[error("direct-load task expired: start sn {requested} behind current {current}")]
    TaskExpired { requested: SeqNum, current: SeqNum },

    /// Transient condition, caller should retry shortly: {0}
    #[error("retry later: {0}")]
    Again(&'static str),

    /// The merge scheduler's queue is full.
    #[error("merge scheduler queue overflow")]
    SizeOverflow,

    /// The buffer ring is full; the release path has fallen behind freezing.
    #[error("buffer ring at capacity {capacity}, release is lagging freeze")]
    ResourceExhausted { capacity: usize },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The tablet has been migrated away or was never loaded here.
    #[error("tablet {0} does not exist")]
    TabletNotExist(TabletId),

    /// A lifecycle operation arrived before the task's start was applied.
    #[error("direct-load task not started")]
    NotStarted,

    #[error("no buffer frozen at sn {0}")]
    BufferNotFound(SeqNum),

    /// A write reached a buffer that is no longer mutable.
    #[error("buffer already frozen at sn {0}")]
    BufferFrozen(SeqNum),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Whether the error is a backpressure signal rather than a failure.
    /// Backpressure is absorbed by retry loops and never surfaced to the
    /// log-apply layer as a hard error.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::Again(_) | Error::SizeOverflow)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Error::TaskExpired { .. })
    }
}
