pub(crate) mod buffer_manager_config;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use buffer_manager_config::BufferManagerConfig;

use crate::error::{Error, Result};
use crate::storage::buffer_ring::BufferRing;
use crate::storage::merge_scheduler::{MergeJobParams, MergeScheduler};
use crate::storage::retry::poll_backpressure;
use crate::storage::storage_utils::{LogStreamId, SeqNum, TabletId, TaskEpoch};
use crate::storage::tablet_directory::{DirectLoadMeta, TabletDirectory, TabletHandle};
use crate::storage::task_epoch::{self, StartAdmission};
use crate::storage::write_buffer::{WriteBuffer, WriteBufferRef};

/// Parameters the compactor needs to describe the current direct-load task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectLoadParams {
    pub ls_id: LogStreamId,
    pub tablet_id: TabletId,
    pub start_sn: SeqNum,
    pub snapshot_version: i64,
    pub cluster_version: i64,
}

/// Epoch state and buffer ring of one tablet, everything the manager's lock
/// protects.
struct Inner {
    epoch: TaskEpoch,
    table_id: u64,
    task_id: i64,
    snapshot_version: i64,
    cluster_version: i64,
    /// High-water mark of every freeze issued so far, monotone non-decreasing
    /// within an epoch.
    max_freeze_sn: SeqNum,
    /// Start sequence number of the task whose final commit durably
    /// succeeded; unset until then.
    success_start_sn: SeqNum,
    ring: BufferRing,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Inner {
            epoch: TaskEpoch::UNSET,
            table_id: 0,
            task_id: 0,
            snapshot_version: 0,
            cluster_version: 0,
            max_freeze_sn: SeqNum::MIN,
            success_start_sn: SeqNum::MIN,
            ring: BufferRing::new(capacity),
        }
    }

    /// Evict every buffer and forget the installed task. Returns how many
    /// buffers were dropped from the ring.
    fn reset(&mut self) -> usize {
        let evicted = self.ring.clear();
        self.epoch = TaskEpoch::UNSET;
        self.table_id = 0;
        self.task_id = 0;
        self.snapshot_version = 0;
        self.cluster_version = 0;
        self.max_freeze_sn = SeqNum::MIN;
        self.success_start_sn = SeqNum::MIN;
        evicted
    }

    fn is_commit_success(&self) -> bool {
        // A success marker from a superseded epoch must not count, so the
        // recorded sequence number is compared against the installed one.
        self.success_start_sn.is_set() && self.success_start_sn == self.epoch.start_sn
    }
}

/// Per-tablet manager of direct-load write buffers.
///
/// The log-apply path drives the task lifecycle (`start`, `prepare`,
/// `commit`), the row-ingestion path obtains the mutable buffer through
/// [`get_or_create_active`](Self::get_or_create_active), and the checkpoint
/// path trims durably persisted buffers with
/// [`release_up_to`](Self::release_up_to). The replicated log may re-deliver
/// any of the lifecycle records after a crash or leadership change; every
/// operation is fenced against the installed [`TaskEpoch`] so a stale record
/// is never applied and a newer one is never lost.
pub struct TabletBufferManager {
    ls_id: LogStreamId,
    tablet_id: TabletId,
    config: BufferManagerConfig,
    merge_scheduler: Arc<dyn MergeScheduler>,
    tablet_directory: Arc<dyn TabletDirectory>,
    inner: RwLock<Inner>,
}

impl TabletBufferManager {
    pub fn new(
        ls_id: LogStreamId,
        tablet_id: TabletId,
        config: BufferManagerConfig,
        merge_scheduler: Arc<dyn MergeScheduler>,
        tablet_directory: Arc<dyn TabletDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Inner::new(config.ring_capacity);
        Ok(TabletBufferManager {
            ls_id,
            tablet_id,
            config,
            merge_scheduler,
            tablet_directory,
            inner: RwLock::new(inner),
        })
    }

    pub fn ls_id(&self) -> LogStreamId {
        self.ls_id
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// Apply a start record, installing `(execution_id, start_sn)` as the
    /// current task epoch.
    ///
    /// A candidate at or above the installed epoch on both axes wins and
    /// discards all prior state, including the buffers of an equal epoch: a
    /// task restarted from scratch begins with an empty ring. A losing
    /// candidate fails with [`Error::TaskExpired`], except when replaying
    /// from a checkpoint (`checkpoint_sn` set), where the checkpoint already
    /// reflects a newer state and the record is a silent no-op.
    ///
    /// On a brand-new epoch not from a checkpoint the new start is persisted
    /// into tablet metadata before returning, wiping any sorted table left
    /// behind by a superseded task.
    pub async fn start(
        &self,
        execution_id: i64,
        start_sn: SeqNum,
        checkpoint_sn: SeqNum,
        snapshot_version: i64,
        cluster_version: i64,
    ) -> Result<()> {
        if !start_sn.is_concrete() || execution_id < 0 || cluster_version < 0 {
            return Err(Error::InvalidArgument(format!(
                "bad start record: start sn {start_sn}, execution id {execution_id}"
            )));
        }
        if checkpoint_sn.is_set() && checkpoint_sn < start_sn {
            return Err(Error::InvalidArgument(format!(
                "checkpoint sn {checkpoint_sn} behind start sn {start_sn}"
            )));
        }
        let from_checkpoint = checkpoint_sn.is_set();
        let candidate = TaskEpoch::new(execution_id, start_sn);
        {
            let mut inner = self.inner.write().await;
            match task_epoch::admit_start(inner.epoch, candidate) {
                StartAdmission::Stale => {
                    tracing::info!(
                        tablet_id = %self.tablet_id,
                        current = %inner.epoch,
                        candidate = %candidate,
                        "direct-load start ignored"
                    );
                    return if from_checkpoint {
                        Ok(())
                    } else {
                        Err(Error::TaskExpired {
                            requested: start_sn,
                            current: inner.epoch.start_sn,
                        })
                    };
                }
                StartAdmission::BrandNew => {
                    let evicted = inner.reset();
                    inner.epoch = candidate;
                    inner.snapshot_version = snapshot_version;
                    inner.cluster_version = cluster_version;
                    inner.max_freeze_sn = start_sn.max(checkpoint_sn);
                    tracing::info!(
                        tablet_id = %self.tablet_id,
                        epoch = %candidate,
                        %checkpoint_sn,
                        evicted,
                        "installed direct-load epoch"
                    );
                }
            }
        }
        if !from_checkpoint {
            self.update_tablet(start_sn, snapshot_version, start_sn)
                .await?;
        }
        Ok(())
    }

    /// Apply a prepare record: freeze the active buffer at `prepare_sn` and
    /// submit the merge job that turns the frozen buffers into a sorted
    /// table.
    ///
    /// A congested scheduler is backpressure, not failure: submission is
    /// retried every few milliseconds until accepted. The wait terminates
    /// early, successfully, if a newer epoch supersedes this one, since the
    /// new task's own prepare drives its own merge. Any hard scheduler error
    /// propagates.
    pub async fn prepare(
        &self,
        start_sn: SeqNum,
        prepare_sn: SeqNum,
        table_id: u64,
        task_id: i64,
    ) -> Result<()> {
        if !start_sn.is_concrete() || !prepare_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad prepare record: start sn {start_sn}, prepare sn {prepare_sn}"
            )));
        }
        let params = {
            let mut inner = self.inner.write().await;
            if !inner.epoch.is_set() {
                return Err(Error::NotStarted);
            }
            task_epoch::check_in_epoch(inner.epoch, start_sn)?;
            self.freeze_active_locked(&mut inner, prepare_sn)?;
            inner.table_id = table_id;
            inner.task_id = task_id;
            MergeJobParams {
                ls_id: self.ls_id,
                tablet_id: self.tablet_id,
                rec_sn: prepare_sn,
                is_commit: true,
                start_sn,
                table_id,
                execution_id: inner.epoch.execution_id,
                task_id,
            }
        };
        poll_backpressure(
            self.config.schedule_retry_interval(),
            "merge job submission",
            || async move {
                if self.inner.read().await.epoch.start_sn != start_sn {
                    // Superseded mid-wait; nothing left to submit for.
                    return Ok(());
                }
                self.merge_scheduler.schedule_merge(params).await?;
                tracing::info!(
                    tablet_id = %self.tablet_id,
                    %start_sn,
                    %prepare_sn,
                    "merge job accepted"
                );
                Ok(())
            },
        )
        .await
    }

    /// Apply a commit record.
    ///
    /// Once [`is_commit_success`](Self::is_commit_success) is true this is an
    /// idempotent no-op. Otherwise the merge job is re-submitted (the
    /// previous submission may have been lost with a crashed scheduler) and
    /// the result is [`Error::Again`] until the compactor reports the sorted
    /// table ready through [`set_commit_success`](Self::set_commit_success).
    ///
    /// During log replay a replica catching up from a later checkpoint cannot
    /// re-derive a stale task, so `TaskExpired` and `TabletNotExist` convert
    /// to success; every other error converts to `Again` for the replay
    /// driver to retry.
    pub async fn commit(&self, start_sn: SeqNum, prepare_sn: SeqNum, is_replay: bool) -> Result<()> {
        match self.try_commit(start_sn, prepare_sn).await {
            Ok(()) => Ok(()),
            Err(err) if is_replay => match err {
                Error::TaskExpired { .. } | Error::TabletNotExist(_) => Ok(()),
                _ => Err(Error::Again("direct-load commit not replayable yet")),
            },
            Err(err) => Err(err),
        }
    }

    async fn try_commit(&self, start_sn: SeqNum, prepare_sn: SeqNum) -> Result<()> {
        let params = {
            let inner = self.inner.read().await;
            if inner.is_commit_success() {
                return Ok(());
            }
            task_epoch::check_in_epoch(inner.epoch, start_sn)?;
            MergeJobParams {
                ls_id: self.ls_id,
                tablet_id: self.tablet_id,
                rec_sn: prepare_sn,
                is_commit: true,
                start_sn,
                table_id: inner.table_id,
                execution_id: inner.epoch.execution_id,
                task_id: inner.task_id,
            }
        };
        // A concurrently migrated tablet must surface here rather than read
        // as a lost submission.
        self.tablet_directory.get_tablet(self.tablet_id).await?;
        match self.merge_scheduler.schedule_merge(params).await {
            Ok(()) => Err(Error::Again("waiting for the sorted table")),
            Err(err) if err.is_backpressure() => Err(Error::Again("merge scheduler congested")),
            Err(err) => Err(err),
        }
    }

    /// Poll [`commit`](Self::commit) until the sorted table is ready,
    /// sleeping briefly between attempts and logging progress at a coarse
    /// interval. Supersession of the epoch surfaces as `TaskExpired` from
    /// the underlying commit and aborts the wait.
    pub async fn wait_commit(&self, start_sn: SeqNum, prepare_sn: SeqNum) -> Result<()> {
        if !start_sn.is_concrete() || !prepare_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad commit wait: start sn {start_sn}, prepare sn {prepare_sn}"
            )));
        }
        {
            let inner = self.inner.read().await;
            if !inner.epoch.is_set() {
                return Err(Error::NotStarted);
            }
            if start_sn > inner.epoch.start_sn {
                return Err(Error::Internal(format!(
                    "waiting on start sn {start_sn} ahead of installed epoch {}",
                    inner.epoch
                )));
            }
        }
        poll_backpressure(
            self.config.schedule_retry_interval(),
            "direct-load commit",
            || self.commit(start_sn, prepare_sn, false),
        )
        .await
    }

    /// Record that the task's sorted table is durable. Called by the
    /// compactor once the final merge lands.
    pub async fn set_commit_success(&self, start_sn: SeqNum) -> Result<()> {
        if !start_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad commit success marker: start sn {start_sn}"
            )));
        }
        let mut inner = self.inner.write().await;
        task_epoch::check_in_epoch(inner.epoch, start_sn)?;
        inner.success_start_sn = start_sn;
        tracing::info!(tablet_id = %self.tablet_id, %start_sn, "direct-load commit succeeded");
        Ok(())
    }

    /// Whether the currently installed task has durably committed.
    pub async fn is_commit_success(&self) -> bool {
        self.inner.read().await.is_commit_success()
    }

    /// Freeze the active buffer at `freeze_sn`.
    ///
    /// With no active buffer and a freeze point above the watermark, a
    /// buffer is allocated solely to record the advance, so a later lookup
    /// for an older sequence number still finds a home. A buffer that
    /// refuses to freeze because of in-flight writers leaves the watermark
    /// unchanged and reports success; the next freeze attempt will land.
    pub async fn freeze_active(&self, freeze_sn: SeqNum) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.freeze_active_locked(&mut inner, freeze_sn)
    }

    fn freeze_active_locked(&self, inner: &mut Inner, freeze_sn: SeqNum) -> Result<()> {
        if !freeze_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "freeze sequence number {freeze_sn} is not concrete"
            )));
        }
        let mut target = inner.ring.active();
        if target.is_none() && freeze_sn > inner.max_freeze_sn {
            target = Some(self.alloc_buffer(inner)?);
        }
        if let Some(buffer) = target {
            match buffer.freeze(freeze_sn) {
                Ok(()) => {
                    inner.max_freeze_sn = inner.max_freeze_sn.max(buffer.freeze_sn());
                    tracing::info!(tablet_id = %self.tablet_id, %freeze_sn, "froze write buffer");
                }
                Err(err) if err.is_backpressure() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Buffer whose span covers `sn`, creating a new active buffer at the
    /// tail when no live buffer does. Most calls resolve on the read-lock
    /// fast path; allocation re-checks under the write lock.
    pub async fn get_or_create_active(&self, sn: SeqNum) -> Result<WriteBufferRef> {
        if !sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "sequence number {sn} is not concrete"
            )));
        }
        {
            let inner = self.inner.read().await;
            if let Some(buffer) = inner.ring.lookup(sn) {
                return Ok(buffer);
            }
        }
        let mut inner = self.inner.write().await;
        if let Some(buffer) = inner.ring.lookup(sn) {
            return Ok(buffer);
        }
        self.alloc_buffer(&mut inner)
    }

    fn alloc_buffer(&self, inner: &mut Inner) -> Result<WriteBufferRef> {
        if !inner.epoch.is_set() {
            return Err(Error::Internal(
                "buffer allocation before direct-load start".to_string(),
            ));
        }
        let buffer: WriteBufferRef = Arc::new(WriteBuffer::new(
            self.ls_id,
            self.tablet_id,
            inner.epoch.start_sn,
            inner.snapshot_version,
        ));
        inner.ring.push(buffer.clone())?;
        tracing::info!(
            tablet_id = %self.tablet_id,
            buffers = inner.ring.len(),
            "allocated write buffer"
        );
        Ok(buffer)
    }

    /// Evict closed buffers whose data is durable up to `end_sn`. Returns
    /// how many buffers left the ring.
    pub async fn release_up_to(&self, end_sn: SeqNum) -> usize {
        let mut inner = self.inner.write().await;
        let evicted = inner.ring.release_up_to(end_sn);
        if evicted > 0 {
            tracing::info!(
                tablet_id = %self.tablet_id,
                %end_sn,
                evicted,
                "released closed write buffers"
            );
        }
        evicted
    }

    /// Lowest staged sequence number across live buffers, bounding how far
    /// back recovery must scan. `SeqNum::MAX` with no buffers.
    pub async fn min_sn(&self) -> SeqNum {
        self.inner.read().await.ring.min_sn()
    }

    /// References to all live buffers, each valid past the lock.
    pub async fn snapshot(&self, frozen_only: bool) -> Vec<WriteBufferRef> {
        self.inner.read().await.ring.snapshot(frozen_only)
    }

    pub async fn get_frozen_buffer(&self, freeze_sn: SeqNum) -> Result<WriteBufferRef> {
        self.inner.read().await.ring.get_frozen(freeze_sn)
    }

    pub async fn has_any_buffer(&self) -> bool {
        !self.inner.read().await.ring.is_empty()
    }

    pub async fn buffer_count(&self) -> usize {
        self.inner.read().await.ring.len()
    }

    /// Whether `execution_id` belongs to an older attempt than the one
    /// installed. Retry drivers use this to drop obsolete work early.
    pub async fn is_execution_id_older(&self, execution_id: i64) -> bool {
        execution_id < self.inner.read().await.epoch.execution_id
    }

    pub async fn direct_load_params(&self) -> Result<DirectLoadParams> {
        let inner = self.inner.read().await;
        if !inner.epoch.is_set() {
            return Err(Error::NotStarted);
        }
        Ok(DirectLoadParams {
            ls_id: self.ls_id,
            tablet_id: self.tablet_id,
            start_sn: inner.epoch.start_sn,
            snapshot_version: inner.snapshot_version,
            cluster_version: inner.cluster_version,
        })
    }

    /// Re-derive the epoch from persisted tablet metadata on tablet load.
    ///
    /// Metadata with no recorded start means no direct-load task was ever
    /// logged for this tablet, a no-op. A `TaskExpired` from the replayed
    /// start is success: the metadata is already ahead of this manager.
    pub async fn online(&self) -> Result<()> {
        let tablet = self.tablet_directory.get_tablet(self.tablet_id).await?;
        let meta = tablet.direct_load_meta();
        if !meta.start_sn.is_set() {
            return Ok(());
        }
        match self
            .start(
                meta.execution_id,
                meta.start_sn,
                meta.checkpoint_sn,
                meta.snapshot_version,
                meta.cluster_version,
            )
            .await
        {
            Err(err) if err.is_expired() => Ok(()),
            result => result,
        }
    }

    /// Tear down all state when the tablet is unloaded or migrated away.
    /// Outstanding buffer references held by callers stay readable.
    pub async fn offline(&self) {
        let mut inner = self.inner.write().await;
        let evicted = inner.reset();
        tracing::info!(tablet_id = %self.tablet_id, evicted, "direct-load state torn down");
    }

    /// Attach this manager to the tablet's metadata object. The caller
    /// resolves the tablet handle itself so a stale handle cannot be
    /// attached to; the operation is fenced like any in-epoch record.
    pub async fn register_to_tablet(
        self: &Arc<Self>,
        start_sn: SeqNum,
        tablet: &Arc<dyn TabletHandle>,
    ) -> Result<()> {
        if !start_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad registration: start sn {start_sn}"
            )));
        }
        let inner = self.inner.write().await;
        task_epoch::check_in_epoch(inner.epoch, start_sn)?;
        tablet.attach_buffer_manager(self.clone())
    }

    pub async fn unregister_from_tablet(
        self: &Arc<Self>,
        start_sn: SeqNum,
        tablet: &Arc<dyn TabletHandle>,
    ) -> Result<()> {
        if !start_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad deregistration: start sn {start_sn}"
            )));
        }
        let inner = self.inner.write().await;
        task_epoch::check_in_epoch(inner.epoch, start_sn)?;
        tablet.detach_buffer_manager(self)
    }

    /// Persist the epoch's progress into the tablet's durable metadata,
    /// atomically replacing any sorted-table reference of a superseded task.
    async fn update_tablet(
        &self,
        start_sn: SeqNum,
        snapshot_version: i64,
        checkpoint_sn: SeqNum,
    ) -> Result<()> {
        if !start_sn.is_concrete() || snapshot_version <= 0 || !checkpoint_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "bad tablet update: start sn {start_sn}, snapshot version {snapshot_version}, \
                 checkpoint sn {checkpoint_sn}"
            )));
        }
        let (execution_id, cluster_version) = {
            let inner = self.inner.read().await;
            (inner.epoch.execution_id, inner.cluster_version)
        };
        let tablet = self.tablet_directory.get_tablet(self.tablet_id).await?;
        tablet
            .update_direct_load_meta(DirectLoadMeta {
                start_sn,
                snapshot_version,
                checkpoint_sn,
                execution_id,
                cluster_version,
            })
            .await
    }
}

#[cfg(test)]
impl TabletBufferManager {
    pub(crate) async fn current_epoch(&self) -> TaskEpoch {
        self.inner.read().await.epoch
    }

    pub(crate) async fn max_freeze_sn(&self) -> SeqNum {
        self.inner.read().await.max_freeze_sn
    }
}
