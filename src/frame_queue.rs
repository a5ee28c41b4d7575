//! Bounded inter-stage queue with drop-oldest backpressure. The capture loop
//! never blocks on a slow writer: when the queue is full, the oldest queued
//! frame is evicted, counted, and the new frame takes its place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::camera::Frame;

pub struct FrameQueue {
    inner: ArrayQueue<Frame>,
    notify: Notify,
    evicted: AtomicU64,
    producer_done: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
            producer_done: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, evicting the oldest queued frame when full.
    /// Returns the sequence number of the evicted frame, if any.
    pub fn push(&self, frame: Frame) -> Option<u64> {
        let displaced = self.inner.force_push(frame).map(|old| old.sequence);
        if displaced.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        displaced
    }

    /// Dequeue the next frame in capture order. Waits with a bounded timeout
    /// so shutdown is always observed; returns `None` once the producer has
    /// finished and the queue is drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.inner.pop() {
                return Some(frame);
            }
            if self.producer_done.load(Ordering::Acquire) {
                return None;
            }
            let _ = timeout(Duration::from_millis(200), self.notify.notified()).await;
        }
    }

    /// Non-blocking dequeue.
    pub fn pop_now(&self) -> Option<Frame> {
        self.inner.pop()
    }

    /// Mark the producer finished. Consumers drain whatever remains, then
    /// `pop` returns `None`.
    pub fn close(&self) {
        self.producer_done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::DeviceState;
    use chrono::Utc;
    use std::time::Instant;

    fn frame(sequence: u64) -> Frame {
        Frame {
            data: vec![1, 2, 3],
            width: 4,
            height: 4,
            sequence,
            captured_mono: Instant::now(),
            captured_wall: Utc::now(),
            device_state: DeviceState::Ok,
        }
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let queue = FrameQueue::new(8);
        for seq in 0..5 {
            assert_eq!(queue.push(frame(seq)), None);
        }
        for seq in 0..5 {
            assert_eq!(queue.pop().await.unwrap().sequence, seq);
        }
    }

    #[tokio::test]
    async fn test_overflow_evicts_exactly_one_oldest() {
        let queue = FrameQueue::new(3);
        for seq in 0..3 {
            queue.push(frame(seq));
        }
        assert_eq!(queue.evicted_total(), 0);

        // Each further push displaces exactly the current oldest.
        assert_eq!(queue.push(frame(3)), Some(0));
        assert_eq!(queue.push(frame(4)), Some(1));
        assert_eq!(queue.evicted_total(), 2);
        assert_eq!(queue.len(), 3);

        let survivors: Vec<u64> = vec![
            queue.pop().await.unwrap().sequence,
            queue.pop().await.unwrap().sequence,
            queue.pop().await.unwrap().sequence,
        ];
        assert_eq!(survivors, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = FrameQueue::new(4);
        queue.push(frame(7));
        queue.push(frame(8));
        queue.close();

        assert_eq!(queue.pop().await.unwrap().sequence, 7);
        assert_eq!(queue.pop().await.unwrap().sequence, 8);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|f| f.sequence) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(frame(42));
        assert_eq!(consumer.await.unwrap(), Some(42));
    }
}
