/// This module defines the seam to the external compaction scheduler, which
/// turns frozen write buffers into an immutable sorted table.
use async_trait::async_trait;

use crate::error::Result;
use crate::storage::storage_utils::{LogStreamId, SeqNum, TabletId};

#[cfg(test)]
use mockall::*;

/// Parameters of one direct-load merge job submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeJobParams {
    pub ls_id: LogStreamId,
    pub tablet_id: TabletId,
    /// Sequence number the merged table must cover up to.
    pub rec_sn: SeqNum,
    pub is_commit: bool,
    pub start_sn: SeqNum,
    pub table_id: u64,
    pub execution_id: i64,
    pub task_id: i64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MergeScheduler: Send + Sync {
    /// Submit a merge job. Acceptance is `Ok(())`; a congested scheduler
    /// reports backpressure as `Error::SizeOverflow` or `Error::Again`,
    /// which callers absorb by retrying after a short delay. Anything else
    /// is a hard error and propagates.
    async fn schedule_merge(&self, params: MergeJobParams) -> Result<()>;
}
