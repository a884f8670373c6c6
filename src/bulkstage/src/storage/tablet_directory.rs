/// This module defines the seams to the tablet directory and the tablet's
/// durable metadata. The directory resolves a tablet id to a handle; the
/// handle reads and persists direct-load progress and carries the
/// registration point for a tablet's buffer manager.
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::buffer_manager::TabletBufferManager;
use crate::storage::storage_utils::{SeqNum, TabletId};

#[cfg(test)]
use mockall::*;

/// Direct-load progress recorded in a tablet's durable metadata. The fields
/// are opaque scalars to this crate; they round-trip through the metadata
/// store unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectLoadMeta {
    pub start_sn: SeqNum,
    pub snapshot_version: i64,
    pub checkpoint_sn: SeqNum,
    pub execution_id: i64,
    pub cluster_version: i64,
}

impl Default for DirectLoadMeta {
    fn default() -> Self {
        DirectLoadMeta {
            start_sn: SeqNum::MIN,
            snapshot_version: 0,
            checkpoint_sn: SeqNum::MIN,
            execution_id: -1,
            cluster_version: 0,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TabletHandle: Send + Sync {
    /// Direct-load progress currently recorded for the tablet.
    fn direct_load_meta(&self) -> DirectLoadMeta;

    /// Atomically persist new direct-load progress, replacing any sorted
    /// table reference left behind by a superseded epoch.
    async fn update_direct_load_meta(&self, meta: DirectLoadMeta) -> Result<()>;

    /// Attach the buffer manager to the tablet's metadata object.
    fn attach_buffer_manager(&self, manager: Arc<TabletBufferManager>) -> Result<()>;

    /// Detach a previously attached buffer manager.
    fn detach_buffer_manager(&self, manager: &Arc<TabletBufferManager>) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TabletDirectory: Send + Sync {
    /// Resolve a tablet to a handle on its metadata. Fails with
    /// `Error::TabletNotExist` when the tablet has been migrated away.
    async fn get_tablet(&self, tablet_id: TabletId) -> Result<Arc<dyn TabletHandle>>;
}
