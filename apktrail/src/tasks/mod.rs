pub mod task;
pub use task::{
    CancelCheck, ChannelEventMonitor, EventMonitor, FnMonitor, NeverCancel, NoopMonitor,
    TaskCancelCheck, TaskCanceller,
};

pub mod worker;
pub use worker::WorkerId;

pub mod cancel;
pub use cancel::{CancellationRegistry, SessionCancelCheck, SessionStatus};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Used to send something on a channel and check the cancellation state.
///
/// Returns false if the channel was disconnected.
pub fn cancelable_send<T>(cancel: &dyn CancelCheck, mut value: T, tx: &Sender<T>) -> Result<bool> {
    while !cancel.was_cancelled() {
        match tx.send_timeout(value, POLL_INTERVAL) {
            Err(SendTimeoutError::Timeout(ret)) => value = ret,
            Err(SendTimeoutError::Disconnected(_)) => return Ok(false),
            _ => return Ok(true),
        };
    }
    Err(Error::Cancelled)
}

/// Used to receive something from a channel and check the cancellation state.
///
/// Returns Ok(None) if the channel was disconnected
pub fn cancelable_recv<T>(cancel: &dyn CancelCheck, rx: &Receiver<T>) -> Result<Option<T>> {
    while !cancel.was_cancelled() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
            Ok(v) => return Ok(Some(v)),
        };
    }
    Err(Error::Cancelled)
}

/// Sleep for `dur`, waking early with [Error::Cancelled] if cancelled.
///
/// A `dur` too large to represent as a deadline sleeps until cancelled.
pub fn cancelable_sleep(cancel: &dyn CancelCheck, dur: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(dur);
    loop {
        cancel.bail_if_cancelled()?;
        let now = Instant::now();
        let step = match deadline {
            Some(deadline) if now >= deadline => return Ok(()),
            Some(deadline) => POLL_INTERVAL.min(deadline - now),
            None => POLL_INTERVAL,
        };
        std::thread::sleep(step);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel::bounded;
    use rstest::*;

    #[test]
    fn test_cancelable_recv() {
        let (tx, rx) = bounded(1);
        let never = NeverCancel;
        tx.send(5).unwrap();
        assert_eq!(cancelable_recv(&never, &rx).unwrap(), Some(5));
        drop(tx);
        assert_eq!(cancelable_recv(&never, &rx).unwrap(), None);

        let (canceller, check) = TaskCanceller::new();
        let (_tx, rx) = bounded::<u8>(1);
        canceller.cancel();
        assert!(matches!(cancelable_recv(&check, &rx), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancelable_send_disconnected() {
        let (tx, rx) = bounded(0);
        drop(rx);
        assert!(!cancelable_send(&NeverCancel, 1, &tx).unwrap());
    }

    #[test]
    fn test_cancelable_sleep() {
        let start = Instant::now();
        cancelable_sleep(&NeverCancel, Duration::from_millis(10)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));

        let (canceller, check) = TaskCanceller::new();
        canceller.cancel();
        let start = Instant::now();
        let res = cancelable_sleep(&check, Duration::from_secs(60));
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[rstest]
    #[case(Duration::MAX)]
    #[case(Duration::from_secs(u64::MAX / 2))]
    fn test_cancelable_sleep_unbounded(#[case] dur: Duration) {
        let (canceller, check) = TaskCanceller::new();
        let start = Instant::now();
        let res = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                canceller.cancel();
            });
            cancelable_sleep(&check, dur)
        });
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
