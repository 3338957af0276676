//! Bounded write queue with a single consumer thread.
//!
//! Every mutation of the engine passes through here. The queue gives two
//! guarantees:
//!
//! - **Total order**: exactly one consumer applies tasks, in enqueue order.
//! - **Backpressure**: the queue never grows past its capacity. What a full
//!   queue does to the caller is a [`BackpressurePolicy`] choice; a task is
//!   never dropped silently.
//!
//! ```text
//!  callers ──enqueue──▶ [ bounded channel ] ──▶ consumer thread
//!                         capacity = N          apply(task)
//!                                               on_idle()  (every tick)
//!                                               finish()   (on shutdown)
//! ```

use config::{BackpressurePolicy, ShutdownPolicy};
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a task could not be enqueued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("write queue is full")]
    Full,
    #[error("timed out waiting for room in the write queue")]
    Timeout,
    #[error("write queue is closed")]
    Closed,
}

/// The single consumer of a [`WriteQueue`].
pub trait Consumer<T>: Send + 'static {
    /// Applies one task. Results travel back through the task itself.
    fn apply(&mut self, task: T);

    /// Called whenever no task arrived for [`idle_interval`](Consumer::idle_interval).
    fn on_idle(&mut self) {}

    /// Called once after the last task, when the queue shuts down.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_millis(50)
    }
}

/// A bounded multi-producer queue drained by one named consumer thread.
pub struct WriteQueue<T: Send + 'static> {
    sender: RwLock<Option<Sender<T>>>,
    worker: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    discard: Arc<AtomicBool>,
    policy: BackpressurePolicy,
    shutdown_policy: ShutdownPolicy,
    capacity: usize,
}

impl<T: Send + 'static> WriteQueue<T> {
    /// Spawns the consumer thread and returns the open queue.
    pub fn start<C>(
        name: &str,
        capacity: usize,
        policy: BackpressurePolicy,
        shutdown_policy: ShutdownPolicy,
        consumer: C,
    ) -> io::Result<Self>
    where
        C: Consumer<T>,
    {
        let (tx, rx) = bounded(capacity);
        let discard = Arc::new(AtomicBool::new(false));
        let worker = {
            let discard = Arc::clone(&discard);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run_consumer(rx, consumer, &discard))?
        };
        Ok(Self {
            sender: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            discard,
            policy,
            shutdown_policy,
            capacity,
        })
    }

    /// Hands `task` to the consumer, obeying the backpressure policy.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] or [`QueueError::Timeout`] when the queue stays
    /// at capacity, [`QueueError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn enqueue(&self, task: T) -> Result<(), QueueError> {
        let tx = self.sender.read().clone().ok_or(QueueError::Closed)?;
        match self.policy {
            BackpressurePolicy::FailFast => tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Disconnected(_) => QueueError::Closed,
            }),
            BackpressurePolicy::Block => tx.send(task).map_err(|_| QueueError::Closed),
            BackpressurePolicy::BlockFor(wait) => tx.send_timeout(task, wait).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => QueueError::Timeout,
                SendTimeoutError::Disconnected(_) => QueueError::Closed,
            }),
        }
    }

    /// Tasks currently waiting for the consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sender.read().as_ref().map_or(0, Sender::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Stops accepting tasks, then drains or discards what is queued per the
    /// shutdown policy and waits for the consumer to finish.
    ///
    /// Returns the consumer's `finish` result. Calling it again is a no-op.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let sender = self.sender.write().take();
        if sender.is_some() && self.shutdown_policy == ShutdownPolicy::Discard {
            self.discard.store(true, Ordering::Release);
        }
        drop(sender);

        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("write queue consumer panicked"))?,
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for WriteQueue<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %format!("{e:#}"), "write queue shutdown on drop failed");
        }
    }
}

fn run_consumer<T, C: Consumer<T>>(
    rx: Receiver<T>,
    mut consumer: C,
    discard: &AtomicBool,
) -> anyhow::Result<()> {
    let tick = consumer.idle_interval();
    let mut discarded = 0usize;
    loop {
        match rx.recv_timeout(tick) {
            Ok(task) => {
                if discard.load(Ordering::Acquire) {
                    // Dropping the task closes its reply channel.
                    drop(task);
                    discarded += 1;
                    continue;
                }
                consumer.apply(task);
            }
            Err(RecvTimeoutError::Timeout) => consumer.on_idle(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if discarded > 0 {
        debug!(discarded, "discarded queued writes on shutdown");
    }
    consumer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    /// Records every task; blocks on `gate` before each one when provided.
    struct Recorder {
        seen: Sender<u32>,
        gate: Option<Receiver<()>>,
    }

    impl Consumer<u32> for Recorder {
        fn apply(&mut self, task: u32) {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            let _ = self.seen.send(task);
        }
    }

    fn gated(
        capacity: usize,
        policy: BackpressurePolicy,
        shutdown: ShutdownPolicy,
    ) -> (WriteQueue<u32>, Receiver<u32>, Sender<()>) {
        let (seen_tx, seen_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded();
        let consumer = Recorder {
            seen: seen_tx,
            gate: Some(gate_rx),
        };
        let queue = WriteQueue::start("test-writer", capacity, policy, shutdown, consumer).unwrap();
        (queue, seen_rx, gate_tx)
    }

    /// Fills the queue while the consumer is parked on its first task.
    fn fill(queue: &WriteQueue<u32>, seen: &Receiver<u32>) {
        queue.enqueue(0).unwrap();
        // Wait until the consumer has taken task 0 and blocks on the gate.
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        for i in 1..=queue.capacity() as u32 {
            queue.enqueue(i).unwrap();
        }
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn tasks_applied_in_enqueue_order() {
        let (seen_tx, seen_rx) = unbounded();
        let queue = WriteQueue::start(
            "test-writer",
            16,
            BackpressurePolicy::Block,
            ShutdownPolicy::Drain,
            Recorder { seen: seen_tx, gate: None },
        )
        .unwrap();
        for i in 0..100 {
            queue.enqueue(i).unwrap();
        }
        queue.shutdown().unwrap();
        let got: Vec<u32> = seen_rx.try_iter().collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn fail_fast_rejects_when_full() {
        let (queue, seen, gate) = gated(4, BackpressurePolicy::FailFast, ShutdownPolicy::Drain);
        fill(&queue, &seen);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.enqueue(99), Err(QueueError::Full));
        assert_eq!(queue.len(), 4);

        for _ in 0..5 {
            gate.send(()).unwrap();
        }
        queue.shutdown().unwrap();
        let got: Vec<u32> = seen.try_iter().collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn block_for_times_out_past_bound() {
        let wait = Duration::from_millis(30);
        let (queue, seen, gate) =
            gated(2, BackpressurePolicy::BlockFor(wait), ShutdownPolicy::Drain);
        fill(&queue, &seen);

        let started = Instant::now();
        assert_eq!(queue.enqueue(99), Err(QueueError::Timeout));
        assert!(started.elapsed() >= wait);
        assert_eq!(queue.len(), 2);

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        queue.shutdown().unwrap();
    }

    #[test]
    fn block_waits_for_room() {
        let (queue, seen, gate) = gated(1, BackpressurePolicy::Block, ShutdownPolicy::Drain);
        let queue = Arc::new(queue);
        fill(&queue, &seen);

        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        assert_eq!(blocked.join().unwrap(), Ok(()));
        queue.shutdown().unwrap();
        assert_eq!(seen.try_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_queue() {
        let (queue, _seen, gate) = gated(4, BackpressurePolicy::FailFast, ShutdownPolicy::Drain);
        drop(gate);
        queue.shutdown().unwrap();
        queue.shutdown().unwrap();
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(1), Err(QueueError::Closed));
    }

    #[test]
    fn discard_policy_drops_queued_tasks() {
        let (queue, seen, gate) = gated(4, BackpressurePolicy::FailFast, ShutdownPolicy::Discard);
        fill(&queue, &seen);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            // Only the in-flight task still waits on the gate.
            let _ = gate.send(());
        });
        queue.shutdown().unwrap();
        releaser.join().unwrap();
        assert_eq!(seen.try_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn idle_tick_runs_when_queue_is_quiet() {
        struct Ticker(Sender<()>);
        impl Consumer<()> for Ticker {
            fn apply(&mut self, _: ()) {}
            fn on_idle(&mut self) {
                let _ = self.0.send(());
            }
            fn idle_interval(&self) -> Duration {
                Duration::from_millis(5)
            }
        }

        let (tx, rx) = unbounded();
        let queue = WriteQueue::start(
            "test-ticker",
            1,
            BackpressurePolicy::Block,
            ShutdownPolicy::Drain,
            Ticker(tx),
        )
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        queue.shutdown().unwrap();
    }

    #[test]
    fn drop_drains_and_survives_failing_finish() {
        struct Failing(Sender<&'static str>);
        impl Consumer<u32> for Failing {
            fn apply(&mut self, _: u32) {
                let _ = self.0.send("apply");
            }
            fn finish(&mut self) -> anyhow::Result<()> {
                let _ = self.0.send("finish");
                anyhow::bail!("close failed")
            }
        }

        let (tx, rx) = unbounded();
        let queue = WriteQueue::start(
            "test-failing",
            4,
            BackpressurePolicy::Block,
            ShutdownPolicy::Drain,
            Failing(tx),
        )
        .unwrap();
        queue.enqueue(1).unwrap();
        drop(queue);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["apply", "finish"]);

        // An explicit shutdown still surfaces the same failure.
        let (tx, _rx) = unbounded();
        let queue = WriteQueue::start(
            "test-failing",
            4,
            BackpressurePolicy::Block,
            ShutdownPolicy::Drain,
            Failing(tx),
        )
        .unwrap();
        assert!(queue.shutdown().is_err());
    }
}
