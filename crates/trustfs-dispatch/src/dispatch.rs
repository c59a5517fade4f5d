//! The cooperative multi-lane dispatcher.
//!
//! Every lane owns a FIFO of pending work. Threads bound to a lane pop and run
//! callbacks to completion one at a time; long work re-schedules continuations
//! instead of blocking. Timed work sits in a deadline-ordered list until due,
//! then moves to the tail of its lane.

use std::cell::Cell;
use std::collections::{LinkedList, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{DispatchError, DispatchResult};
use crate::lane::{CpuQid, LANE_COUNT};
use crate::timer::TimedQueue;
use crate::work::{current_time_millis, DispatchId, WorkBatch, WorkItem};

thread_local! {
    static MY_QID: Cell<CpuQid> = const { Cell::new(CpuQid::Unknown) };
    static CURRENT_DISPATCH_ID: Cell<DispatchId> = const { Cell::new(0) };
}

static DISPATCH_SEQ: AtomicU64 = AtomicU64::new(0);
static GLOBAL: OnceLock<Arc<GlobalDispatch>> = OnceLock::new();

/// Allocates a fresh process-wide dispatch id.
pub fn new_dispatch_id() -> DispatchId {
    DISPATCH_SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

/// Dispatch id of the work currently running on this thread.
pub fn current_dispatch_id() -> DispatchId {
    CURRENT_DISPATCH_ID.with(|c| c.get())
}

/// Overrides the dispatch id for this thread.
pub fn set_dispatch_id(id: DispatchId) {
    CURRENT_DISPATCH_ID.with(|c| c.set(id));
}

/// Lane this thread is bound to.
pub fn my_qid() -> CpuQid {
    MY_QID.with(|q| q.get())
}

/// Binds the calling thread to `qid`.
pub fn set_my_cpu_qid(qid: CpuQid) {
    MY_QID.with(|q| q.set(qid));
}

/// Process-wide dispatcher.
pub fn global() -> &'static Arc<GlobalDispatch> {
    GLOBAL.get_or_init(|| Arc::new(GlobalDispatch::new(DispatchConfig::default())))
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Longest a forever-dispatching thread sleeps without a doorbell or timer.
    pub idle_wait_ms: u64,
    /// Number of recently run labels kept per lane.
    pub history_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 100,
            history_depth: 16,
        }
    }
}

#[derive(Default)]
struct Lane {
    pending: Mutex<LinkedList<WorkItem>>,
    history: Mutex<VecDeque<&'static str>>,
}

#[derive(Debug, Default)]
struct DispatchStats {
    enqueued: [AtomicU64; LANE_COUNT],
    executed: [AtomicU64; LANE_COUNT],
    panicked: AtomicU64,
    timed_fired: AtomicU64,
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    /// Items enqueued per lane.
    pub enqueued: [u64; LANE_COUNT],
    /// Items executed per lane.
    pub executed: [u64; LANE_COUNT],
    /// Callbacks that panicked.
    pub panicked: u64,
    /// Timed items moved onto their lane.
    pub timed_fired: u64,
}

/// Cooperative dispatcher over the fixed lane table.
pub struct GlobalDispatch {
    config: DispatchConfig,
    lanes: Vec<Lane>,
    timed: Mutex<TimedQueue>,
    doorbell: Mutex<u64>,
    doorbell_cv: Condvar,
    shutdown: AtomicBool,
    stats: DispatchStats,
}

impl GlobalDispatch {
    /// Creates a dispatcher with empty lanes.
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            lanes: (0..LANE_COUNT).map(|_| Lane::default()).collect(),
            timed: Mutex::new(TimedQueue::new()),
            doorbell: Mutex::new(0),
            doorbell_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            stats: DispatchStats::default(),
        }
    }

    fn stamp(&self, wa: &mut WorkItem, now_ms: u64) {
        if wa.dispatch_id == 0 {
            wa.dispatch_id = current_dispatch_id();
        }
        wa.dispatch_time_ms = now_ms;
    }

    fn ring(&self) {
        let mut gen = self.doorbell.lock();
        *gen = gen.wrapping_add(1);
        self.doorbell_cv.notify_all();
    }

    /// Appends `wa` to the tail of lane `qid`. Never blocks on the work itself.
    pub fn execute_at(&self, qid: CpuQid, mut wa: WorkItem) -> DispatchResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        self.stamp(&mut wa, current_time_millis());
        self.lanes[qid.index()].pending.lock().push_back(wa);
        self.stats.enqueued[qid.index()].fetch_add(1, Ordering::Relaxed);
        self.ring();
        Ok(())
    }

    /// Schedules `wa` on the calling thread's own lane ("continue later").
    /// Threads without a lane fall back to the RPC lane.
    pub fn execute(&self, wa: WorkItem) -> DispatchResult<()> {
        let qid = match my_qid() {
            CpuQid::Unknown => CpuQid::Rpc,
            q => q,
        };
        self.execute_at(qid, wa)
    }

    /// Records the caller's lane in `saved` and schedules `wa` on `qid`.
    pub fn save_cpu_qid_and_execute_at(
        &self,
        qid: CpuQid,
        saved: &mut CpuQid,
        wa: WorkItem,
    ) -> DispatchResult<()> {
        *saved = my_qid();
        self.execute_at(qid, wa)
    }

    /// Splices a pre-built batch onto the tail of lane `qid`, keeping the
    /// batch's internal order. The splice itself is O(1) under the lane lock.
    pub fn execute_batch(&self, qid: CpuQid, mut batch: WorkBatch) -> DispatchResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        if batch.is_empty() {
            return Ok(());
        }
        let now = current_time_millis();
        for wa in batch.items.iter_mut() {
            self.stamp(wa, now);
        }
        let n = batch.len() as u64;
        self.lanes[qid.index()].pending.lock().append(&mut batch.items);
        self.stats.enqueued[qid.index()].fetch_add(n, Ordering::Relaxed);
        self.ring();
        Ok(())
    }

    /// Defers `wa` by `after_ms` milliseconds. When due it runs on the lane of
    /// the thread that scheduled it (RPC for unbound threads).
    pub fn add_timed(&self, after_ms: u64, mut wa: WorkItem) -> DispatchResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        let now = current_time_millis();
        self.stamp(&mut wa, now);
        let qid = match my_qid() {
            CpuQid::Unknown => CpuQid::Rpc,
            q => q,
        };
        self.timed
            .lock()
            .insert(now.saturating_add(after_ms), qid, wa);
        self.ring();
        Ok(())
    }

    /// How long a dispatch loop may sleep before the earliest timed item is
    /// due. `None` when no timed work is pending.
    pub fn time_till_first_event(&self) -> Option<Duration> {
        self.timed.lock().time_till_first(current_time_millis())
    }

    fn fire_due_timers(&self) -> usize {
        let due = self.timed.lock().pop_due(current_time_millis());
        let n = due.len();
        for (qid, wa) in due {
            // Timed items keep their original stamp.
            self.lanes[qid.index()].pending.lock().push_back(wa);
            self.stats.enqueued[qid.index()].fetch_add(1, Ordering::Relaxed);
        }
        if n > 0 {
            self.stats.timed_fired.fetch_add(n as u64, Ordering::Relaxed);
            self.ring();
        }
        n
    }

    fn run_lane(&self, qid: CpuQid) -> usize {
        let lane = &self.lanes[qid.index()];
        let work = std::mem::take(&mut *lane.pending.lock());
        let n = work.len();
        for wa in work {
            {
                let mut hist = lane.history.lock();
                if hist.len() >= self.config.history_depth {
                    hist.pop_front();
                }
                hist.push_back(wa.label);
            }
            let label = wa.label;
            let id = wa.dispatch_id;
            let outer = current_dispatch_id();
            set_dispatch_id(id);
            let res = catch_unwind(AssertUnwindSafe(|| wa.run(qid)));
            // The id is scoped to the callback, panicking or not.
            set_dispatch_id(outer);
            if res.is_err() {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(lane = %qid, label, dispatch_id = id, "dispatched callback panicked");
            }
            self.stats.executed[qid.index()].fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    /// Runs the calling thread's lane. See [`GlobalDispatch::dispatch_lanes`].
    pub fn dispatch(&self, forever: bool) -> bool {
        let qid = my_qid();
        self.dispatch_lanes(&[qid], forever)
    }

    /// Runs the given lanes round-robin. Each pass moves due timed work onto
    /// its lane, then drains every lane in arrival order.
    ///
    /// With `forever == false` a single pass is made. Otherwise the loop sleeps
    /// between passes until new work, a timer deadline, or shutdown. Returns
    /// true if any callback ran.
    pub fn dispatch_lanes(&self, qids: &[CpuQid], forever: bool) -> bool {
        let mut ran_any = false;
        loop {
            let seen = *self.doorbell.lock();
            self.fire_due_timers();
            let mut ran = 0;
            for &qid in qids {
                ran += self.run_lane(qid);
            }
            ran_any |= ran > 0;

            if !forever || self.shutdown.load(Ordering::Acquire) {
                return ran_any;
            }
            if ran == 0 {
                let idle = Duration::from_millis(self.config.idle_wait_ms);
                let wait = self
                    .time_till_first_event()
                    .map_or(idle, |t| t.min(idle));
                let mut gen = self.doorbell.lock();
                if *gen == seen && !wait.is_zero() {
                    self.doorbell_cv.wait_for(&mut gen, wait);
                }
            }
        }
    }

    /// Stops accepting work and wakes every dispatching thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.ring();
        debug!("dispatcher shutdown requested");
    }

    /// Whether [`GlobalDispatch::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Number of items waiting on `qid`.
    pub fn pending_len(&self, qid: CpuQid) -> usize {
        self.lanes[qid.index()].pending.lock().len()
    }

    /// Number of timed items not yet due.
    pub fn timed_len(&self) -> usize {
        self.timed.lock().len()
    }

    /// Labels of the most recently run items on `qid`, oldest first.
    pub fn dispatch_history(&self, qid: CpuQid) -> Vec<&'static str> {
        self.lanes[qid.index()].history.lock().iter().copied().collect()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DispatchStatsSnapshot {
        let mut snap = DispatchStatsSnapshot::default();
        for i in 0..LANE_COUNT {
            snap.enqueued[i] = self.stats.enqueued[i].load(Ordering::Relaxed);
            snap.executed[i] = self.stats.executed[i].load(Ordering::Relaxed);
        }
        snap.panicked = self.stats.panicked.load(Ordering::Relaxed);
        snap.timed_fired = self.stats.timed_fired.load(Ordering::Relaxed);
        snap
    }
}

impl Default for GlobalDispatch {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkError;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> WorkItem) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |name: &'static str| {
            let l = l.clone();
            WorkItem::new(name, move |_| l.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_fifo_within_lane() {
        let d = GlobalDispatch::default();
        let (log, make) = recorder();
        d.execute_at(CpuQid::Fs, make("w1")).unwrap();
        d.execute_at(CpuQid::Fs, make("w2")).unwrap();
        d.execute_at(CpuQid::Fs, make("w3")).unwrap();

        assert!(d.dispatch_lanes(&[CpuQid::Fs], false));
        assert_eq!(*log.lock(), vec!["w1", "w2", "w3"]);
        assert_eq!(d.pending_len(CpuQid::Fs), 0);
    }

    #[test]
    fn test_execute_uses_own_lane() {
        let d = GlobalDispatch::default();
        set_my_cpu_qid(CpuQid::IoMgr);
        d.execute(WorkItem::new("own", |_| {})).unwrap();
        assert_eq!(d.pending_len(CpuQid::IoMgr), 1);
        assert!(d.dispatch(false));
        set_my_cpu_qid(CpuQid::Unknown);
    }

    #[test]
    fn test_unbound_thread_falls_back_to_rpc() {
        let d = GlobalDispatch::default();
        d.execute(WorkItem::new("anon", |_| {})).unwrap();
        assert_eq!(d.pending_len(CpuQid::Rpc), 1);
    }

    #[test]
    fn test_batch_keeps_order_behind_existing_work() {
        let d = GlobalDispatch::default();
        let (log, make) = recorder();
        d.execute_at(CpuQid::DbMain, make("before")).unwrap();
        let mut batch = WorkBatch::new();
        for name in ["b1", "b2", "b3", "b4", "b5"] {
            batch.append(None, 0, make(name));
        }
        d.execute_batch(CpuQid::DbMain, batch).unwrap();
        d.dispatch_lanes(&[CpuQid::DbMain], false);
        assert_eq!(*log.lock(), vec!["before", "b1", "b2", "b3", "b4", "b5"]);
    }

    #[test]
    fn test_error_passed_to_callback() {
        let d = GlobalDispatch::default();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let wa = WorkItem::new("err", move |c| *s.lock() = Some(c.status))
            .with_err(WorkError::Code(28));
        d.execute_at(CpuQid::Fs, wa).unwrap();
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(*seen.lock(), Some(Err(WorkError::Code(28))));
    }

    #[test]
    fn test_panicking_callback_does_not_stop_lane() {
        let d = GlobalDispatch::default();
        let (log, make) = recorder();
        d.execute_at(CpuQid::Fs, WorkItem::new("boom", |_| panic!("callback failure")))
            .unwrap();
        d.execute_at(CpuQid::Fs, make("after")).unwrap();
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(*log.lock(), vec!["after"]);
        assert_eq!(d.stats().panicked, 1);
    }

    #[test]
    fn test_dispatch_id_inherited_inside_callback() {
        let d = Arc::new(GlobalDispatch::default());
        let seen = Arc::new(Mutex::new(0));
        let (d2, s2) = (d.clone(), seen.clone());
        let outer = WorkItem::new("outer", move |_| {
            let s3 = s2.clone();
            d2.execute_at(CpuQid::Fs, WorkItem::new("inner", move |c| *s3.lock() = c.dispatch_id))
                .unwrap();
        })
        .with_dispatch_id(4242);
        d.execute_at(CpuQid::Fs, outer).unwrap();
        d.dispatch_lanes(&[CpuQid::Fs], false);
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(*seen.lock(), 4242);
    }

    #[test]
    fn test_dispatch_id_scoped_to_callback() {
        let d = GlobalDispatch::default();
        set_dispatch_id(0);
        d.execute_at(CpuQid::Fs, WorkItem::new("scoped", |_| {}).with_dispatch_id(4242))
            .unwrap();
        d.execute_at(
            CpuQid::Fs,
            WorkItem::new("scoped-boom", |_| panic!("callback failure")).with_dispatch_id(4343),
        )
        .unwrap();
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(current_dispatch_id(), 0);

        let seen = Arc::new(Mutex::new(u64::MAX));
        let s = seen.clone();
        d.execute_at(CpuQid::Fs, WorkItem::new("unrelated", move |c| *s.lock() = c.dispatch_id))
            .unwrap();
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let d = GlobalDispatch::new(DispatchConfig {
            history_depth: 2,
            ..Default::default()
        });
        for name in ["h1", "h2", "h3"] {
            d.execute_at(CpuQid::Fs, WorkItem::new(name, |_| {})).unwrap();
        }
        d.dispatch_lanes(&[CpuQid::Fs], false);
        assert_eq!(d.dispatch_history(CpuQid::Fs), vec!["h2", "h3"]);
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let d = GlobalDispatch::default();
        d.shutdown();
        assert!(matches!(
            d.execute_at(CpuQid::Fs, WorkItem::new("late", |_| {})),
            Err(DispatchError::ShutDown)
        ));
    }

    #[test]
    fn test_new_dispatch_id_increases() {
        let a = new_dispatch_id();
        let b = new_dispatch_id();
        assert!(b > a);
    }
}
