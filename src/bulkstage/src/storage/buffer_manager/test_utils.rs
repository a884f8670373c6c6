use std::sync::Arc;

use crate::storage::buffer_manager::{BufferManagerConfig, TabletBufferManager};
use crate::storage::merge_scheduler::MockMergeScheduler;
use crate::storage::storage_utils::{LogStreamId, SeqNum, TabletId};
use crate::storage::tablet_directory::{
    DirectLoadMeta, MockTabletDirectory, MockTabletHandle, TabletHandle,
};

pub(crate) const LS_ID: LogStreamId = LogStreamId(1);
pub(crate) const TABLET_ID: TabletId = TabletId(200);
pub(crate) const SNAPSHOT_VERSION: i64 = 5;
pub(crate) const CLUSTER_VERSION: i64 = 4;

pub(crate) fn sn(value: u64) -> SeqNum {
    SeqNum::new(value)
}

/// A directory whose tablet reports `meta` and accepts any number of
/// metadata updates and manager registrations.
pub(crate) fn directory_with_meta(meta: DirectLoadMeta) -> MockTabletDirectory {
    let mut directory = MockTabletDirectory::new();
    directory.expect_get_tablet().returning(move |_| {
        let mut handle = MockTabletHandle::new();
        handle.expect_direct_load_meta().return_const(meta);
        handle
            .expect_update_direct_load_meta()
            .returning(|_| Ok(()));
        handle.expect_attach_buffer_manager().returning(|_| Ok(()));
        handle.expect_detach_buffer_manager().returning(|_| Ok(()));
        Ok(Arc::new(handle) as Arc<dyn TabletHandle>)
    });
    directory
}

/// A directory for tablets with no recorded direct-load task.
pub(crate) fn accepting_directory() -> MockTabletDirectory {
    directory_with_meta(DirectLoadMeta::default())
}

/// A scheduler that accepts every merge job.
pub(crate) fn accepting_scheduler() -> MockMergeScheduler {
    let mut scheduler = MockMergeScheduler::new();
    scheduler.expect_schedule_merge().returning(|_| Ok(()));
    scheduler
}

pub(crate) fn manager_with_config(
    config: BufferManagerConfig,
    scheduler: MockMergeScheduler,
    directory: MockTabletDirectory,
) -> Arc<TabletBufferManager> {
    Arc::new(
        TabletBufferManager::new(
            LS_ID,
            TABLET_ID,
            config,
            Arc::new(scheduler),
            Arc::new(directory),
        )
        .unwrap(),
    )
}

pub(crate) fn manager(
    scheduler: MockMergeScheduler,
    directory: MockTabletDirectory,
) -> Arc<TabletBufferManager> {
    manager_with_config(BufferManagerConfig::default(), scheduler, directory)
}

/// A manager with epoch `(1, 100)` already installed.
pub(crate) async fn started_manager(scheduler: MockMergeScheduler) -> Arc<TabletBufferManager> {
    let mgr = manager(scheduler, accepting_directory());
    mgr.start(1, sn(100), SeqNum::MIN, SNAPSHOT_VERSION, CLUSTER_VERSION)
        .await
        .unwrap();
    mgr
}
