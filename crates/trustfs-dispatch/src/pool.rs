//! Worker threads bound to dispatcher lanes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::dispatch::{set_my_cpu_qid, GlobalDispatch};
use crate::error::{DispatchError, DispatchResult};
use crate::lane::CpuQid;

/// A set of OS threads, one per lane, each running the dispatch loop forever.
pub struct DispatchPool {
    dispatch: Arc<GlobalDispatch>,
    workers: Vec<(CpuQid, JoinHandle<()>)>,
}

impl DispatchPool {
    /// Spawns one worker per entry in `lanes`. A worker binds itself to its
    /// lane before entering the dispatch loop.
    pub fn start(dispatch: Arc<GlobalDispatch>, lanes: &[CpuQid]) -> DispatchResult<Self> {
        let mut workers = Vec::with_capacity(lanes.len());
        for &qid in lanes {
            let d = dispatch.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{}", qid))
                .spawn(move || {
                    set_my_cpu_qid(qid);
                    d.dispatch(true);
                })
                .map_err(|source| DispatchError::Spawn {
                    lane: qid.to_string(),
                    source,
                })?;
            workers.push((qid, handle));
        }
        info!(workers = workers.len(), "dispatch pool started");
        Ok(Self { dispatch, workers })
    }

    /// Lanes served by this pool.
    pub fn lanes(&self) -> Vec<CpuQid> {
        self.workers.iter().map(|(q, _)| *q).collect()
    }

    /// The dispatcher driven by this pool.
    pub fn dispatcher(&self) -> &Arc<GlobalDispatch> {
        &self.dispatch
    }

    /// Shuts the dispatcher down and joins every worker.
    pub fn shutdown(mut self) {
        self.dispatch.shutdown();
        for (qid, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(lane = %qid, "dispatch worker exited with panic");
            }
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.dispatch.shutdown();
            for (_, handle) in self.workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::my_qid;
    use crate::work::WorkItem;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_worker_runs_on_its_lane() {
        let d = Arc::new(GlobalDispatch::default());
        let pool = DispatchPool::start(d.clone(), &[CpuQid::Fs, CpuQid::DbMain]).unwrap();
        let (tx, rx) = mpsc::channel();
        d.execute_at(
            CpuQid::DbMain,
            WorkItem::new("probe", move |c| {
                tx.send((c.qid, my_qid())).unwrap();
            }),
        )
        .unwrap();
        let (qid, thread_qid) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(qid, CpuQid::DbMain);
        assert_eq!(thread_qid, CpuQid::DbMain);
        assert_eq!(pool.lanes(), vec![CpuQid::Fs, CpuQid::DbMain]);
        pool.shutdown();
    }
}
