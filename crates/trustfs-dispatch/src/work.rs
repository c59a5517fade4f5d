//! Work items handed to the dispatcher and returned to their callbacks.
//!
//! A [`WorkItem`] is owned by the caller until it is enqueued, by the lane
//! while pending, and is consumed when its callback runs. The dispatcher never
//! keeps a reference after invoking the callback.

use std::collections::LinkedList;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::WorkError;
use crate::lane::CpuQid;

/// Correlation id shared by causally related work.
pub type DispatchId = u64;

/// What a callback receives when its work item runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Error carried by the work item, `Ok(())` if none.
    pub status: Result<(), WorkError>,
    /// Correlation id of the work.
    pub dispatch_id: DispatchId,
    /// Lane the callback runs on.
    pub qid: CpuQid,
    /// Milliseconds since the epoch when the item was enqueued.
    pub dispatch_time_ms: u64,
}

/// Boxed one-shot continuation.
pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A unit of work: callback plus correlation metadata.
pub struct WorkItem {
    pub(crate) callback: Callback,
    pub(crate) err: Option<WorkError>,
    pub(crate) dispatch_id: DispatchId,
    pub(crate) dispatch_time_ms: u64,
    pub(crate) dispatch_after_ms: Option<u64>,
    pub(crate) label: &'static str,
}

impl WorkItem {
    /// Creates a work item that runs `callback`. `label` shows up in the
    /// per-lane dispatch history.
    pub fn new<F>(label: &'static str, callback: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            err: None,
            dispatch_id: 0,
            dispatch_time_ms: 0,
            dispatch_after_ms: None,
            label,
        }
    }

    /// Sets the error passed through to the callback.
    pub fn with_err(mut self, err: WorkError) -> Self {
        self.err = Some(err);
        self
    }

    /// Sets an explicit dispatch id. Zero means "inherit the current one".
    pub fn with_dispatch_id(mut self, id: DispatchId) -> Self {
        self.dispatch_id = id;
        self
    }

    /// Dispatch id, zero if not yet assigned.
    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    /// Deadline in epoch milliseconds, for timed items.
    pub fn dispatch_after_ms(&self) -> Option<u64> {
        self.dispatch_after_ms
    }

    /// History label.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn run(self, qid: CpuQid) {
        let completion = Completion {
            status: match self.err {
                Some(e) => Err(e),
                None => Ok(()),
            },
            dispatch_id: self.dispatch_id,
            qid,
            dispatch_time_ms: self.dispatch_time_ms,
        };
        (self.callback)(completion);
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .field("err", &self.err)
            .field("dispatch_id", &self.dispatch_id)
            .field("dispatch_after_ms", &self.dispatch_after_ms)
            .finish()
    }
}

/// An ordered batch of work items spliced onto a lane in one step.
#[derive(Debug, Default)]
pub struct WorkBatch {
    pub(crate) items: LinkedList<WorkItem>,
}

impl WorkBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a work item to the tail of the batch. A non-zero `dispatch_id`
    /// overrides the one already on the item.
    pub fn append(&mut self, err: Option<WorkError>, dispatch_id: DispatchId, mut wa: WorkItem) {
        if err.is_some() {
            wa.err = err;
        }
        if dispatch_id != 0 {
            wa.dispatch_id = dispatch_id;
        }
        self.items.push_back(wa);
    }

    /// Number of items in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the batch holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Milliseconds since the UNIX epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the UNIX epoch.
pub fn current_time_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
