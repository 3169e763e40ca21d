//! Shared plumbing for pipeline stage threads: the per-session cancel flag
//! and channel operations that never block past one timeout without
//! re-checking it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

/// Set once on shutdown; observed by every stage at each timeout boundary.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a cancellable channel operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow<T> {
    Ready(T),
    Cancelled,
    Disconnected,
}

/// Receive, waking every `timeout` to check `cancel`.
pub fn recv_until<T>(rx: &Receiver<T>, timeout: Duration, cancel: &CancelFlag) -> Flow<T> {
    loop {
        if cancel.is_cancelled() {
            return Flow::Cancelled;
        }
        match rx.recv_timeout(timeout) {
            Ok(v) => return Flow::Ready(v),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Flow::Disconnected,
        }
    }
}

/// Send on a bounded channel, waking every `timeout` to check `cancel`.
pub fn send_until<T>(tx: &Sender<T>, item: T, timeout: Duration, cancel: &CancelFlag) -> Flow<()> {
    let mut item = item;
    loop {
        if cancel.is_cancelled() {
            return Flow::Cancelled;
        }
        match tx.send_timeout(item, timeout) {
            Ok(()) => return Flow::Ready(()),
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return Flow::Disconnected,
        }
    }
}

/// Sleep up to `total`, in slices of at most `slice`, returning early (and
/// `false`) once cancelled.
pub fn sleep_cancellable(total: Duration, slice: Duration, cancel: &CancelFlag) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = left.min(slice);
        std::thread::sleep(step);
        left -= step;
    }
    !cancel.is_cancelled()
}
