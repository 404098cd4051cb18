//! Bounded single-producer/single-consumer queues between in-process
//! producers/consumers and the dispatcher.
//!
//! The producer side is synchronous: `produce` returns `false` when the ring
//! is full and the caller must yield. The consumer side can poll, batch, or
//! await. Each queue keeps a rolling send-rate estimate for observability.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Samples kept by the send-rate estimator.
const RATE_WINDOW: usize = 10;

/// Rolling send-rate estimate: a simple moving average over a ten-sample
/// window, one sample per second.
#[derive(Debug)]
pub struct RateEstimator {
    produced: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    samples: VecDeque<u64>,
    last_total: u64,
    last_sample: Instant,
}

impl RateEstimator {
    fn new() -> Self {
        Self {
            produced: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                samples: VecDeque::with_capacity(RATE_WINDOW),
                last_total: 0,
                last_sample: Instant::now(),
            }),
        }
    }

    fn record(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Current estimate in items per second.
    pub fn rate(&self) -> f64 {
        let mut window = self.window.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(window.last_sample);
        if elapsed >= Duration::from_secs(1) {
            let total = self.produced.load(Ordering::Relaxed);
            let delta = total - window.last_total;
            let full_seconds = elapsed.as_secs().min(RATE_WINDOW as u64);
            for i in 0..full_seconds {
                if window.samples.len() == RATE_WINDOW {
                    window.samples.pop_front();
                }
                window.samples.push_back(if i == 0 { delta } else { 0 });
            }
            window.last_total = total;
            window.last_sample = now;
        }
        if window.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = window.samples.iter().sum();
        sum as f64 / window.samples.len() as f64
    }
}

/// A bounded SPSC ring with demand signaling.
///
/// Closing the queue wakes both sides; pending items are dropped, which
/// releases their references.
#[derive(Debug)]
pub struct Spsc<T> {
    ring: ArrayQueue<T>,
    closed: AtomicBool,
    consumer_waker: Notify,
    producer_waker: Notify,
    listener: Mutex<Option<Arc<Notify>>>,
    rate: RateEstimator,
}

impl<T> Spsc<T> {
    /// Create a queue holding up to `capacity` items.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            consumer_waker: Notify::new(),
            producer_waker: Notify::new(),
            listener: Mutex::new(None),
            rate: RateEstimator::new(),
        })
    }

    /// Attach an external wakeup target notified on every successful produce.
    /// The dispatcher parks on one shared [`Notify`] for all of its queues.
    pub fn attach_listener(&self, listener: Arc<Notify>) {
        *self.listener.lock() = Some(listener);
    }

    /// Push one item. Returns `false` if the ring is full or the queue is
    /// closed; the caller should yield and retry.
    pub fn produce(&self, value: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.ring.push(value) {
            Ok(()) => {
                self.rate.record();
                self.consumer_waker.notify_one();
                if let Some(listener) = self.listener.lock().as_ref() {
                    listener.notify_one();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Pop one item, if any.
    pub fn pop(&self) -> Option<T> {
        let value = self.ring.pop();
        if value.is_some() {
            self.producer_waker.notify_one();
        }
        value
    }

    /// Invoke `f` for each of up to `n` ready items. Returns how many items
    /// were consumed.
    pub fn consume<F: FnMut(T)>(&self, n: usize, mut f: F) -> usize {
        let mut consumed = 0;
        while consumed < n {
            match self.ring.pop() {
                Some(value) => {
                    f(value);
                    consumed += 1;
                }
                None => break,
            }
        }
        if consumed > 0 {
            self.producer_waker.notify_one();
        }
        consumed
    }

    /// Await the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.consumer_waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.pop() {
                return Some(value);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Await free space on the producer side. Returns `false` if the queue
    /// closed in the meantime.
    pub async fn writable(&self) -> bool {
        loop {
            let notified = self.producer_waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            if self.ring.len() < self.ring.capacity() {
                return true;
            }
            notified.await;
        }
    }

    /// Close the queue, waking both sides and dropping pending items.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.ring.pop().is_some() {}
        self.consumer_waker.notify_waiters();
        self.producer_waker.notify_waiters();
    }

    /// Whether [`Spsc::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Rolling send-rate estimate, items per second.
    pub fn rate(&self) -> f64 {
        self.rate.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_until_full_then_drain() {
        let queue = Spsc::with_capacity(4);
        for i in 0..4 {
            assert!(queue.produce(i), "item {i} should fit");
        }
        for i in 4..10 {
            assert!(!queue.produce(i), "item {i} should be rejected");
        }

        let mut seen = Vec::new();
        assert_eq!(queue.consume(usize::MAX, |v| seen.push(v)), 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);

        // After draining, the remaining items fit again.
        for i in 4..10 {
            assert_eq!(queue.produce(i), i < 8);
        }
    }

    #[test]
    fn consume_respects_batch_limit() {
        let queue = Spsc::with_capacity(8);
        for i in 0..6 {
            queue.produce(i);
        }
        let mut seen = Vec::new();
        assert_eq!(queue.consume(4, |v| seen.push(v)), 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn close_drops_pending_and_rejects_producers() {
        let sentinel = Arc::new(());
        let queue = Spsc::with_capacity(4);
        queue.produce(Arc::clone(&sentinel));
        queue.produce(Arc::clone(&sentinel));
        assert_eq!(Arc::strong_count(&sentinel), 3);

        queue.close();
        // Pending references were released.
        assert_eq!(Arc::strong_count(&sentinel), 1);
        assert!(!queue.produce(Arc::clone(&sentinel)));
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_produce() {
        let queue = Spsc::with_capacity(4);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        assert!(queue.produce(7u32));
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let queue = Spsc::<u32>::with_capacity(4);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn rate_estimator_averages_over_window() {
        let estimator = RateEstimator::new();
        assert_eq!(estimator.rate(), 0.0);
        for _ in 0..50 {
            estimator.record();
        }
        // Force a sample by rewinding the sampling clock one second.
        {
            let mut window = estimator.window.lock();
            window.last_sample -= Duration::from_secs(1);
        }
        let rate = estimator.rate();
        assert!(rate > 0.0, "expected a positive rate, got {rate}");
        assert!(rate <= 50.0);
    }
}
