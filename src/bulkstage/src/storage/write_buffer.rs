use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::storage_utils::{LogStreamId, SeqNum, StagedRow, TabletId};

/// Lifecycle state of a write buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Mutable, accepting staged rows. `freeze_sn` is unbounded.
    Active,
    /// Immutable with a recorded `freeze_sn`, waiting to be flushed.
    Frozen,
    /// Flushed into a sorted table by the compactor, eligible for eviction.
    Closed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_FROZEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// In-memory staging buffer for the rows of one direct-load sequence span.
///
/// A buffer owns the half-open span `[start_sn, freeze_sn)`. It starts
/// `Active`, is frozen once the log decides its upper bound, and is closed by
/// the compactor after its rows land in a sorted table.
///
/// Shared ownership is an [`Arc`]: the buffer ring holds one strong
/// reference, every caller that looked a buffer up holds another, and the
/// buffer is destroyed only when the last reference drops. Eviction from the
/// ring therefore never invalidates an outstanding reference.
#[derive(Debug)]
pub struct WriteBuffer {
    ls_id: LogStreamId,
    tablet_id: TabletId,
    start_sn: SeqNum,
    snapshot_version: i64,
    state: AtomicU8,
    /// `SeqNum::MAX` while the buffer is active.
    freeze_sn: AtomicU64,
    /// Lowest staged row sequence number; `SeqNum::MAX` while empty.
    min_sn: AtomicU64,
    num_rows: AtomicUsize,
    staged_bytes: AtomicU64,
    inflight_writers: AtomicUsize,
    rows: Mutex<Vec<StagedRow>>,
}

pub type WriteBufferRef = Arc<WriteBuffer>;

/// Registration of one in-flight write. While any pin is alive the buffer
/// refuses to freeze.
pub struct WriterPin<'a> {
    buffer: &'a WriteBuffer,
}

impl Drop for WriterPin<'_> {
    fn drop(&mut self) {
        self.buffer.inflight_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WriteBuffer {
    pub(crate) fn new(
        ls_id: LogStreamId,
        tablet_id: TabletId,
        start_sn: SeqNum,
        snapshot_version: i64,
    ) -> Self {
        WriteBuffer {
            ls_id,
            tablet_id,
            start_sn,
            snapshot_version,
            state: AtomicU8::new(STATE_ACTIVE),
            freeze_sn: AtomicU64::new(SeqNum::MAX.value()),
            min_sn: AtomicU64::new(SeqNum::MAX.value()),
            num_rows: AtomicUsize::new(0),
            staged_bytes: AtomicU64::new(0),
            inflight_writers: AtomicUsize::new(0),
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn ls_id(&self) -> LogStreamId {
        self.ls_id
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn start_sn(&self) -> SeqNum {
        self.start_sn
    }

    pub fn snapshot_version(&self) -> i64 {
        self.snapshot_version
    }

    pub fn state(&self) -> BufferState {
        match self.state.load(Ordering::SeqCst) {
            STATE_ACTIVE => BufferState::Active,
            STATE_FROZEN => BufferState::Frozen,
            _ => BufferState::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == BufferState::Active
    }

    pub fn is_frozen(&self) -> bool {
        self.state() != BufferState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BufferState::Closed
    }

    /// Upper bound of the buffer's span; `SeqNum::MAX` while still active.
    pub fn freeze_sn(&self) -> SeqNum {
        SeqNum::new(self.freeze_sn.load(Ordering::SeqCst))
    }

    /// Lowest sequence number staged in this buffer, `SeqNum::MAX` if none.
    /// The checkpoint path uses this to bound how far back recovery scans.
    pub fn min_sn(&self) -> SeqNum {
        SeqNum::new(self.min_sn.load(Ordering::SeqCst))
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows.load(Ordering::SeqCst)
    }

    pub fn staged_bytes(&self) -> u64 {
        self.staged_bytes.load(Ordering::SeqCst)
    }

    /// Register an in-flight writer. Fails once the buffer is no longer
    /// mutable.
    pub fn pin_writer(&self) -> Result<WriterPin<'_>> {
        self.inflight_writers.fetch_add(1, Ordering::SeqCst);
        // The pin must be visible before the state check so that a
        // concurrent freeze either sees the pin or this check sees the flip.
        if self.state.load(Ordering::SeqCst) != STATE_ACTIVE {
            self.inflight_writers.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::BufferFrozen(self.freeze_sn()));
        }
        Ok(WriterPin { buffer: self })
    }

    /// Stage one row. Only valid while the buffer is active.
    pub async fn append_row(&self, seq_num: SeqNum, payload: Vec<u8>) -> Result<()> {
        if !seq_num.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "staged row sequence number {seq_num} is not concrete"
            )));
        }
        let _pin = self.pin_writer()?;
        let bytes = payload.len() as u64;
        {
            let mut rows = self.rows.lock().await;
            rows.push(StagedRow { seq_num, payload });
        }
        self.min_sn.fetch_min(seq_num.value(), Ordering::SeqCst);
        self.num_rows.fetch_add(1, Ordering::SeqCst);
        self.staged_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Transition `Active -> Frozen` at the given upper bound.
    ///
    /// Refused with a backpressure error while writers are in flight; the
    /// caller treats that as "not yet" and leaves the buffer active. Freezing
    /// an already-frozen buffer is a no-op when the recorded bound matches.
    pub fn freeze(&self, freeze_sn: SeqNum) -> Result<()> {
        if !freeze_sn.is_concrete() {
            return Err(Error::InvalidArgument(format!(
                "freeze sequence number {freeze_sn} is not concrete"
            )));
        }
        match self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_FROZEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                if self.inflight_writers.load(Ordering::SeqCst) > 0 {
                    // A writer raced in before the flip landed; back out.
                    self.state.store(STATE_ACTIVE, Ordering::SeqCst);
                    return Err(Error::Again("buffer has in-flight writers"));
                }
                self.freeze_sn.store(freeze_sn.value(), Ordering::SeqCst);
                Ok(())
            }
            Err(_) => {
                if self.freeze_sn() == freeze_sn {
                    Ok(())
                } else {
                    Err(Error::Internal(format!(
                        "buffer already frozen at {}, refusing refreeze at {freeze_sn}",
                        self.freeze_sn()
                    )))
                }
            }
        }
    }

    /// Transition `Frozen -> Closed`, called by the compactor once the
    /// buffer's rows are durable in a sorted table.
    pub fn close(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_FROZEN,
            STATE_CLOSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(state) if state == STATE_CLOSED => Ok(()),
            Err(_) => Err(Error::Internal(
                "close on a buffer that was never frozen".to_string(),
            )),
        }
    }

    /// Copy of the staged rows, for the compactor's flush.
    pub async fn staged_rows(&self) -> Vec<StagedRow> {
        self.rows.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> WriteBuffer {
        WriteBuffer::new(LogStreamId(1), TabletId(200), SeqNum::new(100), 5)
    }

    #[tokio::test]
    async fn test_append_tracks_min_sn_and_counts() {
        let buf = buffer();
        assert_eq!(buf.min_sn(), SeqNum::MAX);
        buf.append_row(SeqNum::new(130), vec![1, 2, 3]).await.unwrap();
        buf.append_row(SeqNum::new(110), vec![4]).await.unwrap();
        assert_eq!(buf.min_sn(), SeqNum::new(110));
        assert_eq!(buf.num_rows(), 2);
        assert_eq!(buf.staged_bytes(), 4);
        assert_eq!(buf.staged_rows().await.len(), 2);
    }

    #[tokio::test]
    async fn test_freeze_rejects_later_writes() {
        let buf = buffer();
        buf.append_row(SeqNum::new(110), vec![1]).await.unwrap();
        buf.freeze(SeqNum::new(200)).unwrap();
        assert_eq!(buf.state(), BufferState::Frozen);
        assert_eq!(buf.freeze_sn(), SeqNum::new(200));
        let err = buf.append_row(SeqNum::new(120), vec![2]).await.unwrap_err();
        assert_eq!(err, Error::BufferFrozen(SeqNum::new(200)));
    }

    #[test]
    fn test_freeze_refused_while_writer_pinned() {
        let buf = buffer();
        let pin = buf.pin_writer().unwrap();
        let err = buf.freeze(SeqNum::new(200)).unwrap_err();
        assert!(err.is_backpressure());
        assert!(buf.is_active());
        drop(pin);
        buf.freeze(SeqNum::new(200)).unwrap();
        assert!(buf.is_frozen());
        assert!(buf.pin_writer().is_err());
    }

    #[test]
    fn test_refreeze_same_bound_is_noop() {
        let buf = buffer();
        buf.freeze(SeqNum::new(200)).unwrap();
        buf.freeze(SeqNum::new(200)).unwrap();
        assert!(buf.freeze(SeqNum::new(300)).is_err());
    }

    #[test]
    fn test_close_requires_frozen() {
        let buf = buffer();
        assert!(buf.close().is_err());
        buf.freeze(SeqNum::new(200)).unwrap();
        buf.close().unwrap();
        // Idempotent for a lost compactor acknowledgement.
        buf.close().unwrap();
        assert!(buf.is_closed());
    }

    #[test]
    fn test_freeze_validates_bound() {
        let buf = buffer();
        assert!(buf.freeze(SeqNum::MIN).is_err());
        assert!(buf.freeze(SeqNum::MAX).is_err());
    }
}
