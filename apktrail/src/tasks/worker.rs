use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: WorkerId = WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed));
}

/// Identifies the thread acting on behalf of a session.
///
/// Ids are assigned lazily per thread and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// The id of the calling thread
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    /// A fresh id not tied to any thread
    pub fn unique() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
