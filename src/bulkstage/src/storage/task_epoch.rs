//! Fencing rules for direct-load task epochs.
//!
//! The replicated log may re-deliver start/prepare/commit records out of
//! real-time order after a crash, a leader change or a task retry. Every
//! lifecycle operation is admitted or rejected here by comparing the epoch
//! it carries against the currently installed one, so that a stale record is
//! never applied and a newer one is never lost. The rules are pure functions
//! evaluated by the manager under its write lock.

use crate::error::{Error, Result};
use crate::storage::storage_utils::{SeqNum, TaskEpoch};

/// Decision for a `start` record carrying a full epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartAdmission {
    /// Install the epoch, discarding any prior task's state. An equal epoch
    /// is also brand-new: a restarted task wipes its own half-done buffers.
    BrandNew,
    /// Older than the installed epoch; ignore or report expired.
    Stale,
}

/// Decision for an operation carrying only its epoch's start sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SnAdmission {
    InEpoch,
    Stale,
    /// Ahead of an unset epoch: the task may have been torn down by a
    /// concurrent offline/online cycle, the caller should retry.
    Retry,
    /// Ahead of a live epoch, which the log's ordering makes impossible.
    Inconsistent,
}

pub(crate) fn admit_start(current: TaskEpoch, candidate: TaskEpoch) -> StartAdmission {
    if !current.is_set()
        || (candidate.execution_id >= current.execution_id
            && candidate.start_sn >= current.start_sn)
    {
        StartAdmission::BrandNew
    } else {
        StartAdmission::Stale
    }
}

pub(crate) fn admit_sn(current: TaskEpoch, start_sn: SeqNum) -> SnAdmission {
    if start_sn < current.start_sn {
        SnAdmission::Stale
    } else if start_sn == current.start_sn {
        SnAdmission::InEpoch
    } else if !current.is_set() {
        SnAdmission::Retry
    } else {
        SnAdmission::Inconsistent
    }
}

/// Map [`admit_sn`] onto the error taxonomy shared by prepare, commit,
/// set-commit-success and tablet registration.
pub(crate) fn check_in_epoch(current: TaskEpoch, start_sn: SeqNum) -> Result<()> {
    match admit_sn(current, start_sn) {
        SnAdmission::InEpoch => Ok(()),
        SnAdmission::Stale => Err(Error::TaskExpired {
            requested: start_sn,
            current: current.start_sn,
        }),
        SnAdmission::Retry => Err(Error::Again(
            "direct-load epoch not installed, tablet may be offline",
        )),
        SnAdmission::Inconsistent => Err(Error::Internal(format!(
            "start sn {start_sn} ahead of installed epoch start {}",
            current.start_sn
        ))),
    }
}
