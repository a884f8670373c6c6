pub mod error;
mod storage;

pub use error::*;
pub use storage::{
    BufferManagerConfig, BufferState, DirectLoadMeta, DirectLoadParams, LogStreamId,
    MergeJobParams, MergeScheduler, SeqNum, StagedRow, TabletBufferManager, TabletDirectory,
    TabletHandle, TabletId, TaskEpoch, WriteBuffer, WriteBufferRef,
};
