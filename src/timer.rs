//! Tick-driven timer wheel with a dispatch worker pool.
//!
//! The tick thread walks a flat list every `resolution_ms`; expired timers
//! are pushed onto a bounded queue that a small pool of workers drains,
//! invoking handlers outside any lock. A timer is only spliced out of the
//! list once it is both cancelled and its refcount has dropped to zero —
//! the list's own membership counts as one reference, an in-flight callback
//! counts as another.

use crate::error::TimerError;
use crate::queue::BoundedQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub type TimerHandler = Box<dyn Fn(&Timer) + Send + Sync>;

pub struct Timer {
    id: u64,
    expires: u64,
    start: AtomicU64,
    oneshot: bool,
    cancelled: AtomicBool,
    refcnt: AtomicI64,
    handler: TimerHandler,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub const DEFAULT_RESOLUTION_MS: u64 = 5;
const DEFAULT_WORKERS: usize = 1;
const TIMEOUT_QUEUE_CAPACITY: usize = 256;

pub struct TimerManager {
    resolution_ms: u64,
    tick: Arc<AtomicU64>,
    timers: Mutex<Vec<Arc<Timer>>>,
    timeout_q: Arc<BoundedQueue<Arc<Timer>>>,
    stop: Arc<AtomicBool>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TimerManager {
    pub fn start() -> Result<Arc<Self>, TimerError> {
        Self::with_config(DEFAULT_RESOLUTION_MS, DEFAULT_WORKERS)
    }

    pub fn with_config(resolution_ms: u64, worker_count: usize) -> Result<Arc<Self>, TimerError> {
        let manager = Arc::new(TimerManager {
            resolution_ms,
            tick: Arc::new(AtomicU64::new(0)),
            timers: Mutex::new(Vec::new()),
            timeout_q: Arc::new(BoundedQueue::new(TIMEOUT_QUEUE_CAPACITY)),
            stop: Arc::new(AtomicBool::new(false)),
            tick_thread: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let tick_handle = {
            let manager = manager.clone();
            std::thread::Builder::new()
                .name("timer-tick".into())
                .spawn(move || manager.tick_loop())
                .map_err(TimerError::Spawn)?
        };
        *manager.tick_thread.lock().expect("poisoned") = Some(tick_handle);

        let mut workers = manager.workers.lock().expect("poisoned");
        for i in 0..worker_count.max(1) {
            let manager_ref = manager.clone();
            let handle = std::thread::Builder::new()
                .name(format!("timer-worker-{i}"))
                .spawn(move || manager_ref.worker_loop())
                .map_err(TimerError::Spawn)?;
            workers.push(handle);
        }
        drop(workers);

        Ok(manager)
    }

    /// `expires_ms` must be a positive multiple of the configured
    /// resolution. Returns the new timer's id.
    pub fn add_timer(
        &self,
        expires_ms: u64,
        oneshot: bool,
        handler: TimerHandler,
    ) -> Result<u64, TimerError> {
        if expires_ms == 0 || expires_ms % self.resolution_ms != 0 {
            return Err(TimerError::InvalidExpiry {
                expires: expires_ms,
                resolution: self.resolution_ms,
            });
        }
        if self.stop.load(Ordering::SeqCst) {
            return Err(TimerError::ShuttingDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new(Timer {
            id,
            expires: expires_ms,
            start: AtomicU64::new(self.tick.load(Ordering::SeqCst)),
            oneshot,
            cancelled: AtomicBool::new(false),
            refcnt: AtomicI64::new(1),
            handler,
        });
        self.timers.lock().expect("poisoned").push(timer);
        Ok(id)
    }

    /// Marks the timer cancelled and gives up the list's reference to it;
    /// the next tick sweep removes it once any in-flight callback finishes.
    pub fn cancel(&self, id: u64) {
        let timers = self.timers.lock().expect("poisoned");
        if let Some(timer) = timers.iter().find(|t| t.id == id) {
            if !timer.cancelled.swap(true, Ordering::SeqCst) {
                timer.refcnt.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn tick_loop(&self) {
        tracing::info!("timer tick thread started (resolution={}ms)", self.resolution_ms);
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(self.resolution_ms));
            let tick = self.tick.fetch_add(self.resolution_ms, Ordering::SeqCst) + self.resolution_ms;

            let mut timers = self.timers.lock().expect("poisoned");
            for timer in timers.iter() {
                if timer.is_cancelled() {
                    continue;
                }
                let start = timer.start.load(Ordering::SeqCst);
                if start + timer.expires == tick {
                    timer.refcnt.fetch_add(1, Ordering::SeqCst);
                    if !self.timeout_q.enqueue_wait(timer.clone()) {
                        timer.refcnt.fetch_sub(1, Ordering::SeqCst);
                    }
                    if timer.oneshot {
                        timer.cancelled.store(true, Ordering::SeqCst);
                        timer.refcnt.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        timer.start.store(tick, Ordering::SeqCst);
                    }
                }
            }
            timers.retain(|t| !(t.is_cancelled() && t.refcnt.load(Ordering::SeqCst) <= 0));
        }
        tracing::info!("timer tick thread exiting");
    }

    fn worker_loop(&self) {
        tracing::info!("timer worker thread started");
        while let Some(timer) = self.timeout_q.dequeue_wait() {
            let result = catch_unwind(AssertUnwindSafe(|| (timer.handler)(&timer)));
            if let Err(_panic) = result {
                tracing::error!("timer {} handler panicked", timer.id());
            }
            timer.refcnt.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::info!("timer worker thread exiting");
    }

    /// Breaks all waits and joins the tick thread plus every worker.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timeout_q.break_all_wait();
        if let Some(handle) = self.tick_thread.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
        let mut workers = self.workers.lock().expect("poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn oneshot_fires_once_and_is_removed() {
        let manager = TimerManager::with_config(5, 1).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        manager
            .add_timer(
                15,
                true,
                Box::new(move |_timer| {
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_millis(100)).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(15));
        assert!(elapsed <= Duration::from_millis(60));

        // One more tick to let the sweep remove it, then confirm no 2nd fire.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.try_recv(), Err(mpsc::TryRecvError::Empty));

        manager.stop();
    }

    #[test]
    fn invalid_expiry_is_rejected() {
        let manager = TimerManager::with_config(5, 1).unwrap();
        let result = manager.add_timer(7, false, Box::new(|_| {}));
        assert!(matches!(result, Err(TimerError::InvalidExpiry { .. })));
        manager.stop();
    }

    #[test]
    fn cancel_stops_future_fires() {
        let manager = TimerManager::with_config(5, 1).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let id = manager
            .add_timer(
                10,
                false,
                Box::new(move |_| {
                    let _ = tx.send(());
                }),
            )
            .unwrap();

        manager.cancel(id);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(rx.try_recv(), Err(mpsc::TryRecvError::Empty));
        manager.stop();
    }

    #[test]
    fn panicking_handler_does_not_kill_worker() {
        let manager = TimerManager::with_config(5, 1).unwrap();
        let (tx, rx) = mpsc::channel();

        manager
            .add_timer(5, true, Box::new(|_| panic!("boom")))
            .unwrap();
        manager
            .add_timer(
                10,
                true,
                Box::new(move |_| {
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_millis(200)).unwrap();
        manager.stop();
    }
}
