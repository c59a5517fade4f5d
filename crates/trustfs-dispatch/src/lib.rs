#![warn(missing_docs)]

//! TrustFS dispatch subsystem: cooperative multi-lane scheduler with FIFO
//! lanes, O(1) batch splicing and deadline-ordered timed work.

pub mod dispatch;
pub mod error;
pub mod lane;
pub mod pool;
pub mod timer;
pub mod work;

pub use dispatch::{
    current_dispatch_id, global, my_qid, new_dispatch_id, set_dispatch_id, set_my_cpu_qid,
    DispatchConfig, DispatchStatsSnapshot, GlobalDispatch,
};
pub use error::{DispatchError, DispatchResult, WorkError};
pub use lane::{CpuQid, LANE_COUNT};
pub use pool::DispatchPool;
pub use timer::TimedQueue;
pub use work::{
    current_time_millis, current_time_seconds, Callback, Completion, DispatchId, WorkBatch,
    WorkItem,
};
