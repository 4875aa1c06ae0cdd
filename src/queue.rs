//! The bounded blocking queue every channel is built on top of.
//!
//! A single mutex guards the deque; one condvar wakes both sides. Waits
//! self-wake every 30ms so a missed `notify` can never wedge a shutdown —
//! see §5 "Cancellation / timeouts".

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(30);

struct State<T> {
    deque: VecDeque<T>,
    broken: bool,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    cv: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            state: Mutex::new(State {
                deque: VecDeque::with_capacity(capacity.min(1024)),
                broken: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until there is room and the push succeeds, or until
    /// [`Self::break_all_wait`] has been called.
    pub fn enqueue_wait(&self, item: T) -> bool {
        let mut guard = self.state.lock().expect("queue mutex poisoned");
        loop {
            if guard.broken {
                return false;
            }
            if guard.deque.len() < self.capacity {
                guard.deque.push_back(item);
                self.cv.notify_one();
                return true;
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(guard, POLL_INTERVAL)
                .expect("queue mutex poisoned");
            guard = g;
        }
    }

    /// Blocks until an item is available, or until the queue is broken.
    pub fn dequeue_wait(&self) -> Option<T> {
        let mut guard = self.state.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = guard.deque.pop_front() {
                self.cv.notify_one();
                return Some(item);
            }
            if guard.broken {
                return None;
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(guard, POLL_INTERVAL)
                .expect("queue mutex poisoned");
            guard = g;
        }
    }

    pub fn try_enqueue(&self, item: T) -> bool {
        let mut guard = self.state.lock().expect("queue mutex poisoned");
        if guard.broken || guard.deque.len() >= self.capacity {
            return false;
        }
        guard.deque.push_back(item);
        self.cv.notify_one();
        true
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut guard = self.state.lock().expect("queue mutex poisoned");
        let item = guard.deque.pop_front();
        if item.is_some() {
            self.cv.notify_one();
        }
        item
    }

    /// Idempotent. Latches a flag and wakes every waiter; subsequent waits
    /// return immediately with `false`/`None`.
    pub fn break_all_wait(&self) {
        let mut guard = self.state.lock().expect("queue mutex poisoned");
        guard.broken = true;
        self.cv.notify_all();
    }

    pub fn size(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").deque.len()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
