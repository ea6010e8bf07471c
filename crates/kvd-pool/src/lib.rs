//! Elastic worker pool.
//!
//! One mutex guards the queue, the worker/idle counters, and the
//! lifecycle state; a pair of condvars wake workers waiting for tasks
//! and wake `stop(await_drain=true)` callers waiting for the last
//! worker to exit. Workers are detached (never joined) — generalized
//! from `ksvc_module::fixed_pool::FixedPool`'s fixed-N, lock-free-queue
//! shape to watermark-elastic, mutex/condvar-coordinated scaling, with
//! the "handle consumes self and joins" idiom of
//! `gvthread_runtime::timer::worker::TimerThreadHandle` informing
//! `stop(await_drain=true)`'s block-until-quiescent behavior (here
//! achieved via a condvar rather than a `JoinHandle`, since workers are
//! detached).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use kvd_core::{PoolError, Task, WorkerPool};

/// Pool sizing and timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker count maintained while tasks are pending; also the floor
    /// below which idle reap never shrinks the pool.
    pub low: usize,
    /// Ceiling on worker count reachable by elastic growth.
    pub high: usize,
    /// Bounded task queue capacity; `execute` fails past this.
    pub queue_cap: usize,
    /// Idle timeout before a worker above `low` reaps itself.
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Running,
    Stopping,
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    lifecycle: Lifecycle,
}

struct Inner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    stopped_cv: Condvar,
    next_worker_id: AtomicU64,
}

/// The pool facade. Cheap to clone (shares the same `Arc<Inner>`).
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    lifecycle: Lifecycle::Stopped,
                }),
                work_cv: Condvar::new(),
                stopped_cv: Condvar::new(),
                next_worker_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Account for a new worker — incremented before the thread actually
/// runs: a brand-new worker counts as idle before it starts, since that
/// accounting is load-bearing for the "spawn only when idle==0"
/// admission rule in `execute`.
fn spawn_worker_locked(inner: &Arc<Inner>, state: &mut PoolState) {
    state.workers += 1;
    state.idle += 1;
    let worker_id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(inner);
    thread::Builder::new()
        .name(format!("kvd-worker-{worker_id}"))
        .spawn(move || worker_loop(inner))
        .expect("failed to spawn worker thread");
}

fn run_task(task: Task) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(panic = %message, "worker task panicked; worker continues");
    }
}

fn worker_loop(inner: Arc<Inner>) {
    'outer: loop {
        let mut state = inner.state.lock().unwrap();

        if !state.queue.is_empty() {
            let task = state.queue.pop_front().expect("checked non-empty");
            state.idle -= 1;
            drop(state);

            run_task(task);

            let mut state = inner.state.lock().unwrap();
            state.idle += 1;
            if state.lifecycle == Lifecycle::Stopping {
                inner.work_cv.notify_all();
            }
            continue 'outer;
        }

        match state.lifecycle {
            Lifecycle::Running => {
                let budget = Duration::from_millis(inner.config.idle_ms.max(1));
                let mut remaining = budget;
                loop {
                    let wait_start = Instant::now();
                    let (guard, wait_result) =
                        inner.work_cv.wait_timeout(state, remaining).unwrap();
                    state = guard;

                    if !state.queue.is_empty() || state.lifecycle != Lifecycle::Running {
                        continue 'outer;
                    }

                    if wait_result.timed_out() {
                        if state.workers > inner.config.low {
                            state.workers -= 1;
                            state.idle -= 1;
                            return;
                        }
                        // At the floor: keep waiting for the full budget again.
                        remaining = budget;
                    } else {
                        // Spurious wake with nothing new: subtract elapsed
                        // time from the remaining idle budget before
                        // re-waiting, so total idle-reap latency holds.
                        remaining = budget.saturating_sub(wait_start.elapsed());
                        if remaining.is_zero() {
                            remaining = Duration::from_nanos(1);
                        }
                    }
                }
            }
            Lifecycle::Stopping => {
                state.workers -= 1;
                state.idle -= 1;
                inner.work_cv.notify_all();
                if state.workers == 0 {
                    state.lifecycle = Lifecycle::Stopped;
                    inner.stopped_cv.notify_all();
                }
                return;
            }
            Lifecycle::Stopped => return,
        }
    }
}

impl WorkerPool for Pool {
    fn start(&self) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.lifecycle != Lifecycle::Stopped {
            return Err(PoolError::AlreadyRunning);
        }
        state.lifecycle = Lifecycle::Running;
        for _ in 0..self.inner.config.low {
            spawn_worker_locked(&self.inner, &mut state);
        }
        Ok(())
    }

    fn execute(&self, task: Task) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.lifecycle != Lifecycle::Running {
            return false;
        }
        if state.idle == 0 && state.workers < self.inner.config.high {
            spawn_worker_locked(&self.inner, &mut state);
        }
        if state.queue.len() == self.inner.config.queue_cap {
            return false;
        }
        state.queue.push_back(task);
        self.inner.work_cv.notify_one();
        true
    }

    fn stop(&self, await_drain: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Stopped {
            return;
        }
        state.lifecycle = Lifecycle::Stopping;
        if state.workers == 0 {
            // No worker exists to flip the state itself (e.g. `low ==
            // 0`): handle the degenerate case here rather than relying
            // on the last-exiting-worker transition.
            state.lifecycle = Lifecycle::Stopped;
            self.inner.stopped_cv.notify_all();
        }
        self.inner.work_cv.notify_all();

        if await_drain {
            state = wait_for_stopped(&self.inner.stopped_cv, state);
        }
        drop(state);
    }

    fn workers(&self) -> usize {
        self.inner.state.lock().unwrap().workers
    }
}

fn wait_for_stopped<'a>(cv: &Condvar, mut state: MutexGuard<'a, PoolState>) -> MutexGuard<'a, PoolState> {
    while state.lifecycle != Lifecycle::Stopped {
        state = cv.wait(state).unwrap();
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn config(low: usize, high: usize, queue_cap: usize, idle_ms: u64) -> PoolConfig {
        PoolConfig { low, high, queue_cap, idle_ms }
    }

    #[test]
    fn start_spawns_exactly_low_workers() {
        let pool = Pool::new(config(2, 4, 8, 50));
        pool.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.workers(), 2);
        pool.stop(true);
    }

    #[test]
    fn start_twice_fails() {
        let pool = Pool::new(config(1, 1, 8, 50));
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyRunning));
        pool.stop(true);
    }

    #[test]
    fn execute_before_start_returns_false() {
        let pool = Pool::new(config(1, 1, 8, 50));
        assert!(!pool.execute(Box::new(|| {})));
    }

    /// Watermark-driven growth up to `high`, then backpressure once the
    /// bounded queue is full and every worker is busy. Each submission
    /// waits for the previous task to actually start running before the
    /// next is admitted, so the idle count `execute` observes is
    /// deterministic rather than racing the new worker thread's startup
    /// latency.
    #[test]
    fn elastic_growth_then_backpressure_under_sustained_load() {
        let pool = Pool::new(config(2, 4, 2, 50));
        pool.start().unwrap();
        assert_eq!(pool.workers(), 2);

        let barrier = Arc::new(Barrier::new(5)); // 4 blocked tasks + main
        let started = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let barrier = barrier.clone();
            let started_handle = started.clone();
            assert!(pool.execute(Box::new(move || {
                started_handle.fetch_add(1, Ordering::SeqCst);
                barrier.wait();
            })));
            while started.load(Ordering::SeqCst) <= i {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(pool.workers(), 4, "growth should cap at `high`");

        // Queue fills to `queue_cap` since every worker is pinned on the barrier.
        assert!(pool.execute(Box::new(|| {})));
        assert!(pool.execute(Box::new(|| {})));
        // One more is rejected: queue full, no idle worker, already at `high`.
        assert!(!pool.execute(Box::new(|| {})));

        barrier.wait();
        pool.stop(true);
        assert_eq!(pool.workers(), 0);
    }

    #[test]
    fn stop_without_await_is_non_blocking_and_idempotent() {
        let pool = Pool::new(config(1, 1, 8, 50));
        pool.start().unwrap();
        pool.stop(false);
        pool.stop(false);
    }

    #[test]
    fn stop_await_drains_queued_tasks_before_returning() {
        let pool = Pool::new(config(1, 1, 8, 20));
        pool.start().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            pool.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.stop(true);
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert_eq!(pool.workers(), 0);
    }

    #[test]
    fn idle_workers_above_low_are_reaped() {
        let pool = Pool::new(config(1, 3, 8, 20));
        pool.start().unwrap();
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let barrier = barrier.clone();
            pool.execute(Box::new(move || {
                barrier.wait();
            }));
        }
        barrier.wait();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.workers(), 1);
        pool.stop(true);
    }

    #[test]
    fn stop_with_zero_low_workers_handles_degenerate_case() {
        let pool = Pool::new(config(0, 1, 8, 50));
        pool.start().unwrap();
        assert_eq!(pool.workers(), 0);
        pool.stop(true);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = Pool::new(config(1, 1, 8, 50));
        pool.start().unwrap();
        pool.execute(Box::new(|| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            pool.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.stop(true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
