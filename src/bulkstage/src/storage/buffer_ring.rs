use crate::error::{Error, Result};
use crate::storage::storage_utils::SeqNum;
use crate::storage::write_buffer::WriteBufferRef;

/// Fixed-capacity circular index of one tablet's write buffers, ordered by
/// non-decreasing freeze sequence number.
///
/// `head` and `tail` are monotonically increasing logical positions; the
/// physical slot of a position is `position & (capacity - 1)`. At most
/// `capacity` buffers are live at once, and the buffer at `tail - 1`, if
/// still active, is the tablet's unique mutable buffer.
///
/// The ring is a plain data structure: the owning manager's lock provides
/// all synchronization. Slots hold owned references, so evicting a buffer
/// here only drops the ring's reference, never a caller's.
pub(crate) struct BufferRing {
    capacity: usize,
    head: u64,
    tail: u64,
    slots: Box<[Option<WriteBufferRef>]>,
}

impl BufferRing {
    /// `capacity` must be a power of two; the manager's config validation
    /// guarantees it.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        BufferRing {
            capacity,
            head: 0,
            tail: 0,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn slot(&self, position: u64) -> usize {
        (position & (self.capacity as u64 - 1)) as usize
    }

    fn get(&self, position: u64) -> Option<&WriteBufferRef> {
        self.slots[self.slot(position)].as_ref()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn buffers(&self) -> impl Iterator<Item = &WriteBufferRef> {
        (self.head..self.tail).filter_map(|pos| self.get(pos))
    }

    /// Append a buffer at the tail. The ring is never silently overwritten:
    /// exceeding capacity means the release path has fallen behind freezing,
    /// and the caller surfaces that as a hard error with the ring unchanged.
    pub(crate) fn push(&mut self, buffer: WriteBufferRef) -> Result<()> {
        if self.len() == self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        let slot = self.slot(self.tail);
        self.slots[slot] = Some(buffer);
        self.tail += 1;
        Ok(())
    }

    /// The tail buffer, if it is still mutable.
    pub(crate) fn active(&self) -> Option<WriteBufferRef> {
        if self.is_empty() {
            return None;
        }
        self.get(self.tail - 1)
            .filter(|buf| buf.is_active())
            .cloned()
    }

    /// Find the buffer whose span covers `sn`.
    ///
    /// Walks newest to oldest (most lookups target the active buffer): keep
    /// the latest candidate whose freeze bound is at or above `sn` and stop
    /// at the first buffer frozen below it. With the ring's freeze ordering
    /// this yields the oldest buffer with `freeze_sn >= sn`.
    pub(crate) fn lookup(&self, sn: SeqNum) -> Option<WriteBufferRef> {
        let mut found = None;
        for pos in (self.head..self.tail).rev() {
            match self.get(pos) {
                Some(buf) if buf.freeze_sn() >= sn => found = Some(buf.clone()),
                _ => break,
            }
        }
        found
    }

    /// Evict closed buffers with `freeze_sn <= end_sn` from the head,
    /// stopping at the first buffer that does not qualify. Returns how many
    /// buffers were evicted.
    pub(crate) fn release_up_to(&mut self, end_sn: SeqNum) -> usize {
        let mut evicted = 0;
        while self.head < self.tail {
            let qualifies = self
                .get(self.head)
                .is_some_and(|buf| buf.is_closed() && buf.freeze_sn() <= end_sn);
            if !qualifies {
                break;
            }
            let slot = self.slot(self.head);
            self.slots[slot] = None;
            self.head += 1;
            evicted += 1;
        }
        evicted
    }

    /// Drop every buffer and reset the positions. Returns how many buffers
    /// were evicted.
    pub(crate) fn clear(&mut self) -> usize {
        let evicted = self.len();
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        evicted
    }

    /// Minimum staged sequence number across all live buffers; `SeqNum::MAX`
    /// when the ring is empty.
    pub(crate) fn min_sn(&self) -> SeqNum {
        self.buffers()
            .fold(SeqNum::MAX, |acc, buf| acc.min(buf.min_sn()))
    }

    /// References to all live buffers in position order, optionally only the
    /// ones no longer mutable. Each reference stays valid after the manager
    /// lock is released.
    pub(crate) fn snapshot(&self, frozen_only: bool) -> Vec<WriteBufferRef> {
        self.buffers()
            .filter(|buf| !frozen_only || buf.is_frozen())
            .cloned()
            .collect()
    }

    /// The buffer frozen exactly at `freeze_sn`.
    pub(crate) fn get_frozen(&self, freeze_sn: SeqNum) -> Result<WriteBufferRef> {
        self.buffers()
            .find(|buf| buf.freeze_sn() == freeze_sn)
            .cloned()
            .ok_or(Error::BufferNotFound(freeze_sn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::storage_utils::{LogStreamId, TabletId};
    use crate::storage::write_buffer::WriteBuffer;
    use std::sync::Arc;

    fn buffer() -> WriteBufferRef {
        Arc::new(WriteBuffer::new(
            LogStreamId(1),
            TabletId(200),
            SeqNum::new(100),
            5,
        ))
    }

    fn frozen(freeze_sn: u64) -> WriteBufferRef {
        let buf = buffer();
        buf.freeze(SeqNum::new(freeze_sn)).unwrap();
        buf
    }

    fn closed(freeze_sn: u64) -> WriteBufferRef {
        let buf = frozen(freeze_sn);
        buf.close().unwrap();
        buf
    }

    #[test]
    fn test_push_to_capacity_then_exhausted() {
        let mut ring = BufferRing::new(2);
        ring.push(frozen(110)).unwrap();
        ring.push(frozen(120)).unwrap();
        let err = ring.push(buffer()).unwrap_err();
        assert_eq!(err, Error::ResourceExhausted { capacity: 2 });
        // The failed push left the ring unchanged.
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get_frozen(SeqNum::new(110)).unwrap().freeze_sn(), SeqNum::new(110));
        assert_eq!(ring.get_frozen(SeqNum::new(120)).unwrap().freeze_sn(), SeqNum::new(120));
    }

    #[test]
    fn test_slots_wrap_around() {
        let mut ring = BufferRing::new(2);
        for sn in [110, 120, 130, 140, 150] {
            if ring.len() == ring.capacity() {
                let head = ring.snapshot(false)[0].clone();
                head.close().unwrap();
                assert_eq!(ring.release_up_to(head.freeze_sn()), 1);
            }
            ring.push(frozen(sn)).unwrap();
        }
        let spans: Vec<SeqNum> = ring.snapshot(false).iter().map(|b| b.freeze_sn()).collect();
        assert_eq!(spans, vec![SeqNum::new(140), SeqNum::new(150)]);
    }

    #[test]
    fn test_lookup_matches_covering_span() {
        let mut ring = BufferRing::new(4);
        ring.push(frozen(100)).unwrap();
        ring.push(frozen(200)).unwrap();
        ring.push(buffer()).unwrap();

        assert_eq!(ring.lookup(SeqNum::new(50)).unwrap().freeze_sn(), SeqNum::new(100));
        assert_eq!(ring.lookup(SeqNum::new(100)).unwrap().freeze_sn(), SeqNum::new(100));
        assert_eq!(ring.lookup(SeqNum::new(150)).unwrap().freeze_sn(), SeqNum::new(200));
        assert_eq!(ring.lookup(SeqNum::new(201)).unwrap().freeze_sn(), SeqNum::MAX);
        assert!(ring.lookup(SeqNum::new(999)).unwrap().is_active());
    }

    #[test]
    fn test_lookup_empty_ring() {
        let ring = BufferRing::new(4);
        assert!(ring.lookup(SeqNum::new(100)).is_none());
        assert!(ring.active().is_none());
        assert_eq!(ring.min_sn(), SeqNum::MAX);
    }

    #[test]
    fn test_active_is_tail_only() {
        let mut ring = BufferRing::new(4);
        ring.push(frozen(100)).unwrap();
        assert!(ring.active().is_none());
        let act = buffer();
        ring.push(act.clone()).unwrap();
        assert!(Arc::ptr_eq(&ring.active().unwrap(), &act));
        act.freeze(SeqNum::new(200)).unwrap();
        assert!(ring.active().is_none());
    }

    #[test]
    fn test_release_stops_at_first_non_qualifying() {
        let mut ring = BufferRing::new(4);
        ring.push(closed(100)).unwrap();
        ring.push(frozen(200)).unwrap();
        ring.push(closed(300)).unwrap();

        // The frozen buffer at 200 blocks the closed one behind it.
        assert_eq!(ring.release_up_to(SeqNum::new(1000)), 1);
        assert_eq!(ring.len(), 2);

        ring.snapshot(false)[0].close().unwrap();
        assert_eq!(ring.release_up_to(SeqNum::new(250)), 1);
        assert_eq!(ring.release_up_to(SeqNum::new(1000)), 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_release_respects_end_sn() {
        let mut ring = BufferRing::new(4);
        ring.push(closed(100)).unwrap();
        ring.push(closed(200)).unwrap();
        assert_eq!(ring.release_up_to(SeqNum::new(99)), 0);
        assert_eq!(ring.release_up_to(SeqNum::new(100)), 1);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn test_min_sn_over_live_buffers() {
        let mut ring = BufferRing::new(4);
        let a = buffer();
        a.append_row(SeqNum::new(130), vec![1]).await.unwrap();
        a.freeze(SeqNum::new(150)).unwrap();
        let b = buffer();
        b.append_row(SeqNum::new(170), vec![2]).await.unwrap();
        ring.push(a).unwrap();
        ring.push(b).unwrap();
        assert_eq!(ring.min_sn(), SeqNum::new(130));
    }

    #[test]
    fn test_snapshot_frozen_only_excludes_active() {
        let mut ring = BufferRing::new(4);
        ring.push(frozen(100)).unwrap();
        ring.push(closed(200)).unwrap();
        ring.push(buffer()).unwrap();
        assert_eq!(ring.snapshot(false).len(), 3);
        let frozen_refs = ring.snapshot(true);
        assert_eq!(frozen_refs.len(), 2);
        assert!(frozen_refs.iter().all(|buf| buf.is_frozen()));
    }

    #[test]
    fn test_get_frozen_not_found() {
        let mut ring = BufferRing::new(4);
        ring.push(frozen(100)).unwrap();
        assert_eq!(
            ring.get_frozen(SeqNum::new(101)).unwrap_err(),
            Error::BufferNotFound(SeqNum::new(101))
        );
    }

    #[test]
    fn test_clear_resets_positions() {
        let mut ring = BufferRing::new(2);
        ring.push(frozen(100)).unwrap();
        ring.push(frozen(200)).unwrap();
        assert_eq!(ring.clear(), 2);
        assert!(ring.is_empty());
        ring.push(frozen(300)).unwrap();
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_evicted_reference_stays_readable() {
        let mut ring = BufferRing::new(2);
        let buf = closed(100);
        ring.push(buf.clone()).unwrap();
        assert_eq!(ring.release_up_to(SeqNum::new(100)), 1);
        // The caller's reference outlives eviction.
        assert!(buf.is_closed());
        assert_eq!(buf.freeze_sn(), SeqNum::new(100));
        assert_eq!(Arc::strong_count(&buf), 1);
    }
}
