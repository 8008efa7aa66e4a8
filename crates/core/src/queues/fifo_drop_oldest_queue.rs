use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

/// Bounded FIFO that evicts the oldest entry instead of rejecting new ones.
/// Every push wakes whoever waits on `notify_any`.
pub struct FifoDropOldestQueue<T> {
    inner: Arc<FifoDropOldestInner<T>>,
}

struct FifoDropOldestInner<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
    notify_any: Arc<Notify>,
}

impl<T> Clone for FifoDropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FifoDropOldestQueue<T> {
    pub fn new(capacity: usize, notify_any: Arc<Notify>) -> Self {
        assert!(capacity > 0);

        Self {
            inner: Arc::new(FifoDropOldestInner {
                buf: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify_any,
            }),
        }
    }

    /// Append `value`; returns the evicted head if the queue was full.
    pub fn push_overwrite(&self, value: T) -> Option<T> {
        let mut buf = self.inner.buf.lock().expect("FifoDropOldestQueue poisoned");
        let evicted = if buf.len() >= self.inner.capacity {
            buf.pop_front()
        } else {
            None
        };
        buf.push_back(value);
        drop(buf);
        self.inner.notify_any.notify_one();
        evicted
    }

    /// Re-append a batch at the tail without waking the consumer. Returns how
    /// many old entries were evicted to make room.
    pub fn requeue(&self, values: Vec<T>) -> usize {
        let mut buf = self.inner.buf.lock().expect("FifoDropOldestQueue poisoned");
        let mut evicted = 0;
        for value in values {
            if buf.len() >= self.inner.capacity {
                buf.pop_front();
                evicted += 1;
            }
            buf.push_back(value);
        }
        evicted
    }

    /// Take up to `max` entries from the head, in order.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut buf = self.inner.buf.lock().expect("FifoDropOldestQueue poisoned");
        let n = max.min(buf.len());
        buf.drain(..n).collect()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.inner
            .buf
            .lock()
            .expect("FifoDropOldestQueue poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .buf
            .lock()
            .expect("FifoDropOldestQueue poisoned")
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> FifoDropOldestQueue<u32> {
        FifoDropOldestQueue::new(capacity, Arc::new(Notify::new()))
    }

    #[test]
    fn evicts_oldest_when_full() {
        let q = queue(3);
        assert_eq!(q.push_overwrite(1), None);
        q.push_overwrite(2);
        q.push_overwrite(3);
        assert_eq!(q.push_overwrite(4), Some(1));
        assert_eq!(q.drain_up_to(10), vec![2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn drains_in_order_and_requeues_at_tail() {
        let q = queue(10);
        for i in 1..=5 {
            q.push_overwrite(i);
        }
        let head = q.drain_up_to(2);
        assert_eq!(head, vec![1, 2]);
        q.push_overwrite(6);
        assert_eq!(q.requeue(head), 0);
        assert_eq!(q.drain_up_to(10), vec![3, 4, 5, 6, 1, 2]);
    }

    #[test]
    fn requeue_respects_capacity() {
        let q = queue(3);
        q.push_overwrite(1);
        q.push_overwrite(2);
        assert_eq!(q.requeue(vec![8, 9]), 1);
        assert_eq!(q.len(), 3);
        assert_eq!(q.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        let notify = Arc::new(Notify::new());
        let q = FifoDropOldestQueue::new(2, Arc::clone(&notify));
        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;
        q.push_overwrite(1u8);
        waiter.await.unwrap();
    }
}
