//! Ordering and timing behaviour of the dispatcher seen from outside the crate.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use trustfs_dispatch::{
    set_my_cpu_qid, CpuQid, DispatchPool, GlobalDispatch, WorkBatch, WorkItem,
};

fn push_item(log: &Arc<Mutex<Vec<usize>>>, n: usize) -> WorkItem {
    let log = log.clone();
    WorkItem::new("seq", move |_| log.lock().push(n))
}

proptest! {
    #[test]
    fn prop_lane_is_fifo(count in 1usize..200) {
        let d = GlobalDispatch::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..count {
            d.execute_at(CpuQid::IoMgr1, push_item(&log, n)).unwrap();
        }
        d.dispatch_lanes(&[CpuQid::IoMgr1], false);
        let got = log.lock().clone();
        prop_assert_eq!(got, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn prop_batch_interleaves_as_a_block(before in 0usize..20, batch_len in 0usize..50, after in 0usize..20) {
        let d = GlobalDispatch::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut next = 0;
        for _ in 0..before {
            d.execute_at(CpuQid::DbHelper2, push_item(&log, next)).unwrap();
            next += 1;
        }
        let mut batch = WorkBatch::new();
        for _ in 0..batch_len {
            batch.append(None, 0, push_item(&log, next));
            next += 1;
        }
        d.execute_batch(CpuQid::DbHelper2, batch).unwrap();
        for _ in 0..after {
            d.execute_at(CpuQid::DbHelper2, push_item(&log, next)).unwrap();
            next += 1;
        }
        d.dispatch_lanes(&[CpuQid::DbHelper2], false);
        let got = log.lock().clone();
        prop_assert_eq!(got, (0..next).collect::<Vec<_>>());
    }
}

#[test]
fn timed_work_runs_once_after_deadline() {
    let d = GlobalDispatch::default();
    set_my_cpu_qid(CpuQid::Fs);
    let hits = Arc::new(Mutex::new(0u32));
    let h = hits.clone();
    d.add_timed(100, WorkItem::new("timer", move |c| {
        assert_eq!(c.qid, CpuQid::Fs);
        *h.lock() += 1;
    }))
    .unwrap();

    let wait = d.time_till_first_event().unwrap();
    assert!(wait > Duration::ZERO, "deadline already reported due: {wait:?}");
    assert!(wait <= Duration::from_millis(100), "sleep {wait:?} exceeds the delay");
    d.dispatch(false);
    assert_eq!(*hits.lock(), 0, "must not fire before its deadline");

    thread::sleep(Duration::from_millis(150));
    d.dispatch(false);
    d.dispatch(false);
    assert_eq!(*hits.lock(), 1);
    assert_eq!(d.time_till_first_event(), None);
    set_my_cpu_qid(CpuQid::Unknown);
}

#[test]
fn timed_work_from_unbound_thread_lands_on_rpc() {
    let d = GlobalDispatch::default();
    d.add_timed(0, WorkItem::new("now", |_| {})).unwrap();
    d.dispatch_lanes(&[CpuQid::Fs], false);
    assert_eq!(d.pending_len(CpuQid::Rpc), 1);
}

#[test]
fn forever_loop_wakes_for_new_work_and_timers() {
    let d = Arc::new(GlobalDispatch::default());
    let pool = DispatchPool::start(d.clone(), &[CpuQid::Rpc, CpuQid::Compress1]).unwrap();
    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    d.execute_at(CpuQid::Compress1, WorkItem::new("direct", move |c| {
        tx1.send(("direct", c.qid)).unwrap();
    }))
    .unwrap();
    d.add_timed(30, WorkItem::new("delayed", move |c| {
        tx.send(("delayed", c.qid)).unwrap();
    }))
    .unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, ("direct", CpuQid::Compress1));
    assert_eq!(second, ("delayed", CpuQid::Rpc));
    pool.shutdown();
}

#[test]
fn continuation_from_callback_runs_after_existing_work() {
    let d = Arc::new(GlobalDispatch::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    let (d2, l2) = (d.clone(), log.clone());
    d.execute_at(CpuQid::Fs, WorkItem::new("first", move |_| {
        l2.lock().push(0);
        let l3 = l2.clone();
        d2.execute_at(CpuQid::Fs, WorkItem::new("cont", move |_| l3.lock().push(2)))
            .unwrap();
    }))
    .unwrap();
    d.execute_at(CpuQid::Fs, push_item(&log, 1)).unwrap();

    d.dispatch_lanes(&[CpuQid::Fs], false);
    d.dispatch_lanes(&[CpuQid::Fs], false);
    assert_eq!(*log.lock(), vec![0, 1, 2]);
    assert_eq!(d.stats().executed[CpuQid::Fs.index()], 3);
}
