//! Blocking FIFO hand-off queues between pipeline stages
//!
//! Built on flume channels: push never blocks (the queue is unbounded;
//! backpressure comes from the bounded number of frames and buffers in
//! circulation, not from queue capacity), and the timed blocking pop doubles
//! as the liveness point where a stage thread notices shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::utils::CachePadded;

/// Outcome of a timed blocking pop.
#[derive(Debug)]
pub enum PopResult<T> {
    Popped(T),
    /// The timeout elapsed with nothing queued. A liveness signal, not an
    /// error: the queue and its contents are untouched.
    TimedOut,
    /// `stop()` was issued; the waiter unblocked immediately.
    Stopped,
}

impl<T> PopResult<T> {
    pub fn popped(self) -> Option<T> {
        match self {
            PopResult::Popped(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Default)]
struct QueueStats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

/// Bounded-wait, unbounded-capacity FIFO channel between two stages.
pub struct FrameQueue<T> {
    name: String,
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    /// Dropping the sender half wakes every current and future waiter.
    stop_tx: Mutex<Option<flume::Sender<()>>>,
    stop_rx: flume::Receiver<()>,
    stopped: AtomicBool,
    default_timeout: Duration,
    stats: CachePadded<QueueStats>,
}

impl<T> FrameQueue<T> {
    pub fn new(name: impl Into<String>, default_timeout: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded(0);
        Self {
            name: name.into(),
            tx,
            rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            stopped: AtomicBool::new(false),
            default_timeout,
            stats: CachePadded::new(QueueStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append at tail. Never blocks, never fails; a stopped queue still
    /// accepts items so teardown drains see everything.
    pub fn push(&self, item: T) {
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        // Send only fails when all receivers are dropped; we hold one.
        let _ = self.tx.send(item);
    }

    /// Timed blocking pop with the queue's configured timeout.
    pub fn wait_and_pop(&self) -> PopResult<T> {
        self.wait_and_pop_for(self.default_timeout)
    }

    /// Block until an item arrives, the timeout elapses, or `stop()` fires.
    pub fn wait_and_pop_for(&self, timeout: Duration) -> PopResult<T> {
        if self.stopped.load(Ordering::Acquire) {
            return PopResult::Stopped;
        }

        enum Waited<T> {
            Data(Result<T, flume::RecvError>),
            Stop,
        }

        let waited = flume::Selector::new()
            .recv(&self.rx, Waited::Data)
            .recv(&self.stop_rx, |_| Waited::Stop)
            .wait_timeout(timeout);

        match waited {
            Ok(Waited::Data(Ok(item))) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                PopResult::Popped(item)
            }
            Ok(Waited::Data(Err(_))) | Ok(Waited::Stop) => PopResult::Stopped,
            Err(_) => PopResult::TimedOut,
        }
    }

    /// Non-blocking pop, used while draining on teardown.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Take everything currently queued, in FIFO order. The caller owns the
    /// drained items and must return their bound buffers.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rx.len());
        while let Some(item) = self.try_pop() {
            out.push(item);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Unblock every current and future waiter. Items already queued remain
    /// available through `try_pop`/`drain`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Dropping the sender disconnects the stop channel; the selector in
        // every waiter completes immediately.
        self.stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// (pushed, popped) totals since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.pushed.load(Ordering::Relaxed),
            self.stats.popped.load(Ordering::Relaxed),
        )
    }
}

impl<T> std::fmt::Debug for FrameQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
