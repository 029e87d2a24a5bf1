use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::{Error, Result};

/// Anything that can tell a running task to stop.
///
/// Cancellation is cooperative: long running work polls this between units
/// of work and unwinds with [Error::Cancelled].
pub trait CancelCheck: Send + Sync {
    fn was_cancelled(&self) -> bool;

    /// Returns [Error::Cancelled] if the task has been cancelled
    fn bail_if_cancelled(&self) -> Result<()> {
        if self.was_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl<T: CancelCheck + ?Sized> CancelCheck for &T {
    fn was_cancelled(&self) -> bool {
        (**self).was_cancelled()
    }
}

/// A [CancelCheck] that never fires
pub struct NeverCancel;

impl CancelCheck for NeverCancel {
    fn was_cancelled(&self) -> bool {
        false
    }
}

/// Allows cancelling active tasks. Dropping any clone of the canceller
/// also cancels.
#[derive(Clone)]
pub struct TaskCanceller {
    cancel: Arc<AtomicBool>,
}

impl Drop for TaskCanceller {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed)
    }
}

impl TaskCanceller {
    pub fn new() -> (Self, TaskCancelCheck) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel = Arc::clone(&cancelled);
        (Self { cancel }, TaskCancelCheck { cancelled })
    }

    /// Cancel the task. This can be invoked more than once, but only the first
    /// invocation matters.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct TaskCancelCheck {
    cancelled: Arc<AtomicBool>,
}

impl CancelCheck for TaskCancelCheck {
    fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub trait EventMonitor<T>: Send + Sync {
    fn on_event(&self, evt: T);
}

impl<U> EventMonitor<U> for Box<dyn EventMonitor<U>> {
    fn on_event(&self, evt: U) {
        self.as_ref().on_event(evt)
    }
}

/// An [EventMonitor] that is just a noop
pub struct NoopMonitor;

impl<T> EventMonitor<T> for NoopMonitor {
    fn on_event(&self, _evt: T) {
        // noop
    }
}

/// An [EventMonitor] that just dumps the events onto a channel.
pub struct ChannelEventMonitor<T>
where
    T: Sync + Send,
{
    chan: Sender<T>,
}

impl<T> ChannelEventMonitor<T>
where
    T: Sync + Send,
{
    pub fn create() -> (Self, Receiver<T>) {
        Self::create_with_bound(64)
    }

    pub fn create_with_bound(bound: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = bounded(bound);
        (Self { chan: tx }, rx)
    }
}

impl<T> EventMonitor<T> for ChannelEventMonitor<T>
where
    T: Sync + Send,
{
    fn on_event(&self, evt: T) {
        let _ = self.chan.send(evt);
    }
}

/// An [EventMonitor] backed by a closure
pub struct FnMonitor<F>(pub F);

impl<T, F> EventMonitor<T> for FnMonitor<F>
where
    F: Fn(T) + Send + Sync,
{
    fn on_event(&self, evt: T) {
        (self.0)(evt)
    }
}
