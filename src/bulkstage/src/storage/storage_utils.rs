use std::fmt;

/// Logical timestamp assigned by the tablet's replicated operation log.
///
/// All ordering, fencing and idempotency decisions in this crate are
/// comparisons between sequence numbers. Two values are reserved:
/// [`SeqNum::MIN`] means "unset" and [`SeqNum::MAX`] means "unbounded".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Sentinel for a sequence number that has not been assigned yet.
    pub const MIN: SeqNum = SeqNum(0);
    /// Sentinel for an unbounded upper limit.
    pub const MAX: SeqNum = SeqNum(u64::MAX);

    pub const fn new(value: u64) -> Self {
        SeqNum(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Whether a real sequence number has been assigned.
    pub const fn is_set(&self) -> bool {
        self.0 != Self::MIN.0
    }

    pub const fn is_unbounded(&self) -> bool {
        self.0 == Self::MAX.0
    }

    /// Set, and not the unbounded sentinel: usable as a concrete log position.
    pub const fn is_concrete(&self) -> bool {
        self.is_set() && !self.is_unbounded()
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "unbounded")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TabletId(pub u64);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the log stream a tablet belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LogStreamId(pub u64);

impl fmt::Display for LogStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attempt of a direct-load task on a tablet.
///
/// `execution_id` increases every time the task is retried from scratch;
/// `start_sn` is the sequence number of the attempt's start record. The
/// epoch is unset while `start_sn` is unset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskEpoch {
    pub execution_id: i64,
    pub start_sn: SeqNum,
}

impl TaskEpoch {
    pub const UNSET: TaskEpoch = TaskEpoch {
        execution_id: -1,
        start_sn: SeqNum::MIN,
    };

    pub const fn new(execution_id: i64, start_sn: SeqNum) -> Self {
        TaskEpoch {
            execution_id,
            start_sn,
        }
    }

    pub const fn is_set(&self) -> bool {
        self.start_sn.is_set()
    }
}

impl fmt::Display for TaskEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.execution_id, self.start_sn)
    }
}

/// A bulk-loaded row staged in a write buffer, opaque to this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedRow {
    pub seq_num: SeqNum,
    pub payload: Vec<u8>,
}
