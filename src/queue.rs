//! The byte-counted bounded queue.
//!
//! This is the one synchronization primitive the system is actually about:
//! a FIFO whose occupancy is measured by a caller-supplied "size" of each
//! item rather than by item count, so a 64-character serial RX buffer can be
//! simulated while still queueing variable-length chunks. The same
//! primitive, with different size functions, also backs the unbounded
//! response queue (`tx`, size always 0 so `put` never blocks) and the
//! slot-counted move queue (`move_queue`, size always 1).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::QueueError;

struct Inner<T> {
    items: VecDeque<T>,
    size: usize,
    closed: bool,
}

/// A FIFO bounded by the sum of `item_size(item)` over its contents.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    item_size: fn(&T) -> usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, item_size: fn(&T) -> usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            item_size,
        }
    }

    /// A queue that never applies back-pressure, for `tx`-style response
    /// FIFOs: its "size" function always reports zero.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, |_| 0)
    }

    /// Total size of everything currently queued (sum of `item_size`).
    pub fn occupied(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Enqueue `item`, applying back-pressure per the queue's capacity.
    ///
    /// - `block = false`: fails immediately with [`QueueError::Full`] if the
    ///   item would not fit.
    /// - `block = true, timeout = None`: waits indefinitely for room.
    /// - `block = true, timeout = Some(seconds)`: waits up to `seconds`;
    ///   `seconds < 0.0` is rejected with [`QueueError::InvalidTimeout`]
    ///   before anything is touched, matching the source queue's contract.
    pub fn put(&self, item: T, block: bool, timeout: Option<f64>) -> Result<(), QueueError> {
        if let Some(secs) = timeout {
            if secs < 0.0 {
                return Err(QueueError::InvalidTimeout(secs));
            }
        }

        let item_size = (self.item_size)(&item);
        let mut guard = self.inner.lock().unwrap();

        if guard.closed {
            return Err(QueueError::Closed);
        }

        if !block {
            if guard.size + item_size >= self.capacity {
                return Err(QueueError::Full);
            }
        } else {
            match timeout {
                None => {
                    while !guard.closed && guard.size + item_size >= self.capacity {
                        guard = self.not_full.wait(guard).unwrap();
                    }
                }
                Some(secs) => {
                    let deadline = Instant::now() + Duration::from_secs_f64(secs);
                    while !guard.closed && guard.size + item_size >= self.capacity {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(QueueError::Full);
                        }
                        let (next_guard, result) =
                            self.not_full.wait_timeout(guard, remaining).unwrap();
                        guard = next_guard;
                        if result.timed_out() && guard.size + item_size >= self.capacity {
                            return Err(QueueError::Full);
                        }
                    }
                }
            }
            if guard.closed {
                return Err(QueueError::Closed);
            }
        }

        guard.items.push_back(item);
        guard.size += item_size;
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Result<T, QueueError> {
        let mut guard = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;

        while guard.items.is_empty() {
            if guard.closed {
                return Err(QueueError::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::Empty);
            }
            let (next_guard, result) = self.not_empty.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if result.timed_out() && guard.items.is_empty() {
                return Err(QueueError::Empty);
            }
        }

        let item = guard.items.pop_front().unwrap();
        guard.size -= (self.item_size)(&item);
        drop(guard);
        self.not_full.notify_one();
        Ok(item)
    }

    /// Marks the queue as closed: every blocked or future `put`/`get` fails
    /// with [`QueueError::Closed`] rather than hanging.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        drop(guard);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn char_len(s: &String) -> usize {
        s.len()
    }

    #[test]
    fn tracks_size_across_puts_and_gets() {
        let q: BoundedQueue<String> = BoundedQueue::new(64, char_len);
        q.put("hello".to_string(), true, None).unwrap();
        q.put("world!".to_string(), true, None).unwrap();
        assert_eq!(q.occupied(), 11);

        let first = q.get(Duration::from_millis(10)).unwrap();
        assert_eq!(first, "hello");
        assert_eq!(q.occupied(), 6);
    }

    #[test]
    fn non_blocking_put_fails_when_full() {
        let q: BoundedQueue<String> = BoundedQueue::new(4, char_len);
        let err = q.put("abcd".to_string(), false, None).unwrap_err();
        assert!(matches!(err, QueueError::Full));
    }

    #[test]
    fn get_times_out_when_empty() {
        let q: BoundedQueue<String> = BoundedQueue::new(64, char_len);
        let err = q.get(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, QueueError::Empty));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let q: BoundedQueue<String> = BoundedQueue::new(64, char_len);
        let err = q.put("x".to_string(), true, Some(-1.0)).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTimeout(_)));
    }

    #[test]
    fn blocking_put_wakes_once_room_frees_up() {
        let q = Arc::new(BoundedQueue::<String>::new(5, char_len));
        q.put("abcd".to_string(), true, None).unwrap();

        let q2 = q.clone();
        let writer = thread::spawn(move || {
            q2.put("z".to_string(), true, Some(1.0)).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        let _ = q.get(Duration::from_millis(100)).unwrap();
        writer.join().unwrap();
        assert_eq!(q.occupied(), 1);
    }

    #[test]
    fn closed_queue_fails_fast() {
        let q: BoundedQueue<String> = BoundedQueue::new(64, char_len);
        q.close();
        assert!(matches!(
            q.put("x".to_string(), true, None).unwrap_err(),
            QueueError::Closed
        ));
        assert!(matches!(
            q.get(Duration::from_millis(10)).unwrap_err(),
            QueueError::Closed
        ));
    }
}
