//! # Retry Queue
//!
//! Tasks wait in a min-heap keyed by their due time. Workers sleep on a
//! condition variable until the earliest task is due (or a new task arrives),
//! so a retry fires at or after its due time with no fixed polling interval in
//! between.
//!
//! `add_task` never blocks: producers are the publisher and subscriber loops
//! themselves, so a full queue drops the new task with an error log instead of
//! stalling the pipeline. Rescheduled tasks were already admitted and are not
//! subject to the capacity check.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::errors::{RelayError, RelayResult};
use crate::lifecycle::{join_with_timeout, StopSignal};
use crate::retry::policy::RetryPolicy;

/// Upper bound on an idle worker's wait, so it re-checks shutdown regularly.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Due-time offset used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn due_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// The operation retried for each task.
pub type ProcessFn<T> = Arc<dyn Fn(&T) -> RelayResult<()> + Send + Sync>;

/// Terminal disposition of a task that used up its retries:
/// `(payload, retry_count, last_error)`.
pub type DeadLetterFn<T> = Arc<dyn Fn(T, u32, RelayError) + Send + Sync>;

/// A unit of work owned by the retry queue.
#[derive(Debug, Clone)]
pub struct RetryTask<T> {
    /// Opaque payload handed to the process function.
    pub payload: T,
    /// Earliest instant the next attempt may start.
    pub due_time: Instant,
    /// Failed attempts so far. Never decreases.
    pub retry_count: u32,
}

struct Scheduled<T> {
    seq: u64,
    task: RetryTask<T>,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    // Reversed so that `BinaryHeap` pops the earliest due time first; `seq`
    // keeps insertion order among equal due times.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .due_time
            .cmp(&self.task.due_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Scheduled<T>>,
    next_seq: u64,
    shutting_down: bool,
}

impl<T> QueueState<T> {
    fn push(&mut self, task: RetryTask<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { seq, task });
    }
}

struct Shared<T> {
    name: String,
    policy: RetryPolicy,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    process: ProcessFn<T>,
    dead_letter: DeadLetterFn<T>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Default dead-letter callback: logs the exhausted task and drops it.
pub fn log_dead_letter<T>(_payload: T, retry_count: u32, error: RelayError) {
    tracing::error!(retry_count, "Task permanently failed and was dropped: {}", error);
}

/// Bounded exponential-backoff retry queue.
pub struct RetryQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    stats_stop: StopSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> RetryQueue<T> {
    /// Creates the queue and starts its worker and stats threads.
    ///
    /// `name` only labels threads and log lines.
    pub fn new(
        name: &str,
        policy: RetryPolicy,
        process: ProcessFn<T>,
        dead_letter: Option<DeadLetterFn<T>>,
    ) -> RelayResult<Self> {
        let worker_count = policy.worker_count;
        let stats_interval = policy.stats_interval;
        let shared = Arc::new(Shared {
            name: name.to_string(),
            policy,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            ready: Condvar::new(),
            process,
            dead_letter: dead_letter.unwrap_or_else(|| Arc::new(log_dead_letter::<T>) as DeadLetterFn<T>),
        });
        let stats_stop = StopSignal::new();

        let mut threads = Vec::with_capacity(worker_count + 1);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-retry-{}", name, i))
                .spawn(move || worker_loop(shared))
                .map_err(|e| RelayError::FatalConfig(format!("failed to spawn retry worker: {}", e)))?;
            threads.push(handle);
        }

        {
            let shared = Arc::clone(&shared);
            let stop = stats_stop.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-retry-stats", name))
                .spawn(move || {
                    while !stop.wait_timeout(stats_interval) {
                        let size = shared.lock().heap.len();
                        tracing::info!(queue = %shared.name, size, "Retry queue size");
                    }
                })
                .map_err(|e| RelayError::FatalConfig(format!("failed to spawn retry stats thread: {}", e)))?;
            threads.push(handle);
        }

        tracing::info!(
            queue = %name,
            workers = worker_count,
            max_retries = shared.policy.max_retries,
            "Retry queue started"
        );

        Ok(Self {
            shared,
            stats_stop,
            threads: Mutex::new(threads),
        })
    }

    /// Offers a new task, due immediately with `retry_count = 0`.
    ///
    /// Returns `false` (and logs) if the queue is full or shutting down.
    pub fn add_task(&self, payload: T) -> bool {
        let mut state = self.shared.lock();
        if state.shutting_down {
            tracing::warn!(queue = %self.shared.name, "Retry queue is shut down; dropping task");
            return false;
        }
        if state.heap.len() >= self.shared.policy.capacity {
            tracing::error!(
                queue = %self.shared.name,
                capacity = self.shared.policy.capacity,
                "Retry queue full; dropping task"
            );
            return false;
        }
        state.push(RetryTask {
            payload,
            due_time: Instant::now(),
            retry_count: 0,
        });
        drop(state);
        self.shared.ready.notify_one();
        tracing::debug!(queue = %self.shared.name, "Task added to retry queue");
        true
    }

    /// Tasks currently waiting (not counting ones being processed).
    pub fn len(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// Returns `true` when no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured admission capacity.
    pub fn capacity(&self) -> usize {
        self.shared.policy.capacity
    }

    /// The policy this queue was built with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Stops the workers and stats thread, waiting up to `timeout` for each.
    ///
    /// Tasks still waiting are dropped; nothing is persisted.
    pub fn shutdown(&self, timeout: Duration) {
        let pending = {
            let mut state = self.shared.lock();
            state.shutting_down = true;
            state.heap.len()
        };
        self.shared.ready.notify_all();
        self.stats_stop.stop();

        if pending > 0 {
            tracing::warn!(queue = %self.shared.name, pending, "Dropping queued retry tasks on shutdown");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            threads.drain(..).collect()
        };
        for handle in handles {
            join_with_timeout(handle, timeout);
        }
        tracing::info!(queue = %self.shared.name, "Retry queue stopped");
    }
}

impl<T: Send + 'static> Drop for RetryQueue<T> {
    fn drop(&mut self) {
        self.shared.lock().shutting_down = true;
        self.shared.ready.notify_all();
        self.stats_stop.stop();
    }
}

fn next_due<T>(shared: &Shared<T>) -> Option<RetryTask<T>> {
    let mut state = shared.lock();
    loop {
        if state.shutting_down {
            return None;
        }
        let now = Instant::now();
        let wait = match state.heap.peek() {
            Some(top) if top.task.due_time <= now => {
                return state.heap.pop().map(|s| s.task);
            }
            Some(top) => top.task.due_time - now,
            None => IDLE_WAIT,
        };
        state = shared
            .ready
            .wait_timeout(state, wait)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

fn worker_loop<T>(shared: Arc<Shared<T>>) {
    while let Some(mut task) = next_due(&shared) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (shared.process)(&task.payload)))
            .unwrap_or_else(|_| Err(RelayError::Transport("retry task panicked".to_string())));

        match outcome {
            Ok(()) => {
                tracing::debug!(queue = %shared.name, retry_count = task.retry_count, "Retry task succeeded");
            }
            Err(error) => {
                let delay = shared.policy.backoff_delay(task.retry_count);
                task.retry_count += 1;
                if task.retry_count < shared.policy.max_retries {
                    tracing::warn!(
                        queue = %shared.name,
                        retry_count = task.retry_count,
                        "Task failed ({}); retrying in {:.2}s",
                        error,
                        delay.as_secs_f64()
                    );
                    task.due_time = due_after(delay);
                    let mut state = shared.lock();
                    if state.shutting_down {
                        tracing::warn!(queue = %shared.name, "Shutdown in progress; dropping failed task");
                        return;
                    }
                    state.push(task);
                    drop(state);
                    shared.ready.notify_one();
                } else {
                    tracing::error!(
                        queue = %shared.name,
                        max_retries = shared.policy.max_retries,
                        "Task reached the retry limit: {}",
                        error
                    );
                    let retry_count = task.retry_count;
                    let dead_letter = Arc::clone(&shared.dead_letter);
                    if panic::catch_unwind(AssertUnwindSafe(move || dead_letter(task.payload, retry_count, error))).is_err() {
                        tracing::error!(queue = %shared.name, "Dead-letter callback panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            jitter: false,
            worker_count: 2,
            capacity: 16,
            stats_interval: Duration::from_secs(60),
        }
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    type DeadLetters = Arc<Mutex<Vec<(String, u32, String)>>>;

    fn recording_dead_letter() -> (DeadLetters, DeadLetterFn<String>) {
        let store: DeadLetters = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&store);
        let callback: DeadLetterFn<String> = Arc::new(move |payload: String, retry_count: u32, error: RelayError| {
            sink.lock().unwrap().push((payload, retry_count, error.to_string()));
        });
        (store, callback)
    }

    #[test]
    fn test_first_attempt_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (dead, dead_letter) = recording_dead_letter();
        let queue = RetryQueue::new(
            "ok",
            fast_policy(5),
            Arc::new(move |_: &String| -> RelayResult<()> {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }),
            Some(dead_letter),
        )
        .unwrap();

        assert!(queue.add_task("a".to_string()));
        assert!(wait_until(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(dead.lock().unwrap().is_empty());
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_recovers_after_three_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (dead, dead_letter) = recording_dead_letter();
        let queue = RetryQueue::new(
            "recover",
            fast_policy(5),
            Arc::new(move |_: &String| -> RelayResult<()> {
                let n = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                if n <= 3 {
                    Err(RelayError::Downstream(format!("attempt {}", n)))
                } else {
                    Ok(())
                }
            }),
            Some(dead_letter),
        )
        .unwrap();

        queue.add_task("payload".to_string());
        assert!(wait_until(Duration::from_secs(3), || calls.load(AtomicOrdering::SeqCst) == 4));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 4);
        assert!(dead.lock().unwrap().is_empty());
        assert!(queue.is_empty());
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_dead_letter_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (dead, dead_letter) = recording_dead_letter();
        let queue = RetryQueue::new(
            "exhaust",
            fast_policy(3),
            Arc::new(move |_: &String| -> RelayResult<()> {
                let n = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                Err(RelayError::Transport(format!("send {}", n)))
            }),
            Some(dead_letter),
        )
        .unwrap();

        queue.add_task("lost".to_string());
        assert!(wait_until(Duration::from_secs(3), || !dead.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(300));

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
        let dead = dead.lock().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "lost");
        assert_eq!(dead[0].1, 3);
        assert!(dead[0].2.contains("send 3"));
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_retries_never_fire_early() {
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&attempts);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            worker_count: 1,
            ..fast_policy(4)
        };
        let queue = RetryQueue::new(
            "timing",
            policy.clone(),
            Arc::new(move |_: &u32| -> RelayResult<()> {
                log.lock().unwrap().push(Instant::now());
                Err(RelayError::Transport("down".into()))
            }),
            None,
        )
        .unwrap();

        queue.add_task(7);
        assert!(wait_until(Duration::from_secs(3), || attempts.lock().unwrap().len() == 4));

        let attempts = attempts.lock().unwrap();
        for i in 0..3 {
            let gap = attempts[i + 1] - attempts[i];
            assert!(
                gap >= policy.base_backoff(i as u32),
                "retry {} fired after {:?}, expected at least {:?}",
                i,
                gap,
                policy.base_backoff(i as u32)
            );
        }
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_due_order_is_respected() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(150),
            worker_count: 1,
            ..fast_policy(2)
        };
        let queue = RetryQueue::new(
            "order",
            policy,
            Arc::new(move |name: &&'static str| -> RelayResult<()> {
                log.lock().unwrap().push(*name);
                if *name == "slow" {
                    Err(RelayError::Downstream("later".into()))
                } else {
                    Ok(())
                }
            }),
            None,
        )
        .unwrap();

        queue.add_task("slow");
        assert!(wait_until(Duration::from_secs(1), || order.lock().unwrap().len() == 1));
        queue.add_task("fast");
        assert!(wait_until(Duration::from_secs(2), || order.lock().unwrap().len() == 3));
        assert_eq!(*order.lock().unwrap(), vec!["slow", "fast", "slow"]);
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_unbounded_backoff_keeps_workers_alive() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = RetryPolicy {
            base_delay: Duration::MAX,
            max_backoff: Duration::MAX,
            worker_count: 1,
            ..fast_policy(5)
        };
        let queue = RetryQueue::new(
            "forever",
            policy,
            Arc::new(move |_: &u32| -> RelayResult<()> {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Err(RelayError::Downstream("never".into()))
            }),
            None,
        )
        .unwrap();

        queue.add_task(1);
        assert!(wait_until(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 1));
        queue.add_task(2);
        assert!(wait_until(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 2));
        assert!(wait_until(Duration::from_secs(1), || queue.len() == 2));
        queue.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_capacity_drops_new_tasks() {
        let policy = RetryPolicy {
            worker_count: 0,
            capacity: 2,
            ..fast_policy(5)
        };
        let queue: RetryQueue<u8> = RetryQueue::new("full", policy, Arc::new(|_: &u8| -> RelayResult<()> { Ok(()) }), None).unwrap();

        assert!(queue.add_task(1));
        assert!(queue.add_task(2));
        assert!(!queue.add_task(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);

        queue.shutdown(Duration::from_secs(1));
        assert!(!queue.add_task(4));
    }

    #[test]
    fn test_panicking_task_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let queue = RetryQueue::new(
            "panic",
            fast_policy(3),
            Arc::new(move |_: &String| -> RelayResult<()> {
                if counter.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(())
            }),
            None,
        )
        .unwrap();

        queue.add_task("p".to_string());
        assert!(wait_until(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 2));
        queue.shutdown(Duration::from_secs(2));
    }
}
