/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Resource-bounded execution.
//!
//! There are two mechanisms:
//!
//! - a [`ResourceScheduler`], a fixed pool of workers draining a priority
//!   queue of weighted tasks under a shared capacity counter, which is used
//!   to bound the memory of concurrently loaded nodes and is available to
//!   callers for query-time admission control;
//! - [waves](waves::run_in_waves), used by bulk construction: items are
//!   processed in parallel in groups whose size and cumulative volume are
//!   bounded, and a group starts only once the previous one has completed.

pub mod waves;
pub use waves::*;

use crossbeam_channel::{bounded, Receiver};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Errors of a [`ResourceScheduler`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("The scheduler has been stopped")]
    /// A task was submitted after shutdown.
    Stopped,
    #[error("The task panicked")]
    /// The task panicked while running.
    TaskPanicked,
    #[error("The task was dropped before completing")]
    /// The worker running the task disappeared.
    Disconnected,
}

/// A type-erased task: running it returns the closure delivering its result.
type Job = Box<dyn FnOnce() -> Box<dyn FnOnce() + Send> + Send>;

struct PendingTask {
    cost: u64,
    seq: u64,
    job: Job,
}

// BinaryHeap is a max-heap: the task with the smallest cost, and among those
// the one submitted first, must be the greatest.
impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for PendingTask {}

struct State {
    queue: BinaryHeap<PendingTask>,
    /// The capacity counter; it can become negative.
    capacity: i64,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signaled when a task is queued or the scheduler stops.
    task_ready: Condvar,
    /// Signaled when a task returns its cost to the counter.
    capacity_freed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Tasks run outside the lock, so it cannot be poisoned by them.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Capacities and costs saturate at `i64::MAX`, so that the counter, which
/// never exceeds the initial capacity, cannot overflow.
#[inline]
fn clamp(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// A handle to the result of a task submitted to a [`ResourceScheduler`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Waits for the task to complete and returns its result.
    ///
    /// When this method returns, the cost of the task has already been
    /// returned to the capacity counter.
    pub fn join(self) -> Result<T, SchedulerError> {
        match self.result.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SchedulerError::TaskPanicked),
            Err(_) => Err(SchedulerError::Disconnected),
        }
    }
}

/// A fixed pool of worker threads executing weighted tasks under a shared
/// capacity counter.
///
/// Pending tasks are kept in a priority queue ordered by increasing cost
/// (and by submission order among tasks of the same cost), so many small
/// tasks can drain quickly rather than wait behind a large one.
///
/// # Admission
///
/// A worker that has dequeued a task of cost *c* waits until the capacity
/// counter is positive, subtracts *c* from it, runs the task, adds *c*
/// back, and wakes up all workers waiting for capacity. The admission
/// predicate is just *capacity > 0*: the full cost is subtracted even if it
/// exceeds the available capacity, so the counter can become negative and
/// a large task is admitted as soon as any capacity remains.
///
/// # Shutdown
///
/// After [`shutdown`](ResourceScheduler::shutdown) (or drop) no task can be
/// submitted, but tasks already queued are still executed before the
/// workers exit.
pub struct ResourceScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ResourceScheduler {
    /// Creates a scheduler with `num_threads` workers and the given
    /// capacity. Capacities and costs above `i64::MAX` count as
    /// `i64::MAX`.
    pub fn new(num_threads: usize, capacity: u64) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                capacity: clamp(capacity),
                next_seq: 0,
                stopped: false,
            }),
            task_ready: Condvar::new(),
            capacity_freed: Condvar::new(),
        });

        let workers = (0..num_threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("tagmap-worker-{}", i))
                    .spawn(move || worker_loop(&shared))
                    .unwrap_or_else(|e| panic!("Could not spawn worker {}: {}", i, e))
            })
            .collect();

        Self { shared, workers }
    }

    /// Submits a task of given cost.
    pub fn submit<T, F>(&self, cost: u64, task: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            Box::new(move || {
                // The receiver might have been dropped
                let _ = tx.send(result);
            })
        });

        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(SchedulerError::Stopped);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(PendingTask { cost, seq, job });
        }
        self.shared.task_ready.notify_one();
        Ok(TaskHandle { result: rx })
    }

    /// Returns the current value of the capacity counter.
    pub fn available(&self) -> i64 {
        self.shared.lock().capacity
    }

    /// Returns the number of tasks waiting to be dequeued.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Returns the number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting tasks; tasks already queued will still run.
    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.task_ready.notify_all();
    }

    /// Stops accepting tasks, drains the queue and joins the workers.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("A scheduler worker panicked");
            }
        }
    }
}

impl Drop for ResourceScheduler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let PendingTask { cost, job, .. } = {
            let mut state = shared.lock();
            while !state.stopped && state.queue.is_empty() {
                state = shared
                    .task_ready
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            match state.queue.pop() {
                Some(task) => task,
                // Stopped and drained
                None => return,
            }
        };

        {
            let mut state = shared.lock();
            while state.capacity <= 0 {
                state = shared
                    .capacity_freed
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            state.capacity -= clamp(cost);
        }

        let deliver = job();

        shared.lock().capacity += clamp(cost);
        shared.capacity_freed.notify_all();
        deliver();
    }
}
