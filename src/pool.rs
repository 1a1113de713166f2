//! Elastic worker pool.
//!
//! Workers consume tasks from one shared queue, suspending on a condvar
//! while it is empty. The pool grows by exactly one worker whenever an
//! enqueue finds fewer idle workers than queued tasks; it never shrinks
//! before shutdown. Shutdown drains the queue before the workers exit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    stop: bool,
    /// Workers currently waiting for a task. A freshly spawned worker
    /// counts as idle until it claims its first task.
    idle_workers: usize,
    total_workers: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    task_available: Condvar,
}

/// Thread pool that grows on demand and drains on shutdown.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with `initial_workers` worker threads.
    pub fn new(initial_workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stop: false,
                idle_workers: initial_workers,
                total_workers: initial_workers,
            }),
            task_available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(initial_workers);
        for worker_id in 0..initial_workers {
            handles.push(spawn_worker(Arc::clone(&shared), worker_id));
        }

        debug!(workers = initial_workers, "Worker pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueue a task and return a handle to observe its completion.
    ///
    /// If fewer workers are idle than tasks are now queued, one extra
    /// worker is started. One per triggering enqueue, never more.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been shut down; submitting to a stopped
    /// pool is a programming error.
    pub fn submit<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let task_done = Arc::clone(&completion);
        let task: Job = Box::new(move || {
            job();
            task_done.finish();
        });

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.stop {
                drop(state);
                panic!("submit on a worker pool that has been shut down");
            }
            state.queue.push_back(task);

            if state.idle_workers < state.queue.len() {
                let worker_id = state.total_workers;
                state.total_workers += 1;
                state.idle_workers += 1;
                let handle = spawn_worker(Arc::clone(&self.shared), worker_id);
                self.handles.lock().unwrap().push(handle);
                debug!(workers = state.total_workers, "Worker pool grew");
            }
        }
        self.shared.task_available.notify_one();

        TaskHandle { completion }
    }

    /// Queued tasks plus busy workers: an upper bound on active-plus-pending
    /// work, used by the coordinator as a proxy for live client count.
    pub fn unfinished_count(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.queue.len() + state.total_workers - state.idle_workers
    }

    /// Number of workers ever started. Monotone non-decreasing until
    /// shutdown.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().unwrap().total_workers
    }

    /// Stop the pool: wake every worker, let them drain the queue, and
    /// join them. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.stop {
                return;
            }
            state.stop = true;
        }
        self.shared.task_available.notify_all();

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Worker pool drained and joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: Arc<PoolShared>, worker_id: usize) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("worker-{worker_id}"))
        .spawn(move || worker_loop(&shared, worker_id))
        .expect("failed to spawn worker thread")
}

fn worker_loop(shared: &PoolShared, worker_id: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            while !state.stop && state.queue.is_empty() {
                state = shared.task_available.wait(state).unwrap();
            }
            if state.stop && state.queue.is_empty() {
                // Counters stay frozen at their pre-shutdown values.
                trace!(worker = worker_id, "Worker exiting");
                return;
            }
            state.idle_workers -= 1;
            state.queue.pop_front().expect("queue checked non-empty")
        };

        // Run outside the lock so other workers keep consuming.
        task();

        shared.state.lock().unwrap().idle_workers += 1;
    }
}

struct Completion {
    done: Mutex<bool>,
    finished: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            finished: Condvar::new(),
        }
    }

    fn finish(&self) {
        *self.done.lock().unwrap() = true;
        self.finished.notify_all();
    }
}

/// Observes completion of one submitted task.
pub struct TaskHandle {
    completion: Arc<Completion>,
}

impl TaskHandle {
    /// Whether the task has finished executing.
    pub fn is_finished(&self) -> bool {
        *self.completion.done.lock().unwrap()
    }

    /// Block until the task finishes.
    pub fn wait(&self) {
        let mut done = self.completion.done.lock().unwrap();
        while !*done {
            done = self.completion.finished.wait(done).unwrap();
        }
    }

    /// Block until the task finishes or `timeout` elapses; returns
    /// whether it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.completion.done.lock().unwrap();
        while !*done {
            let (guard, result) = self
                .completion
                .finished
                .wait_timeout(done, timeout)
                .unwrap();
            done = guard;
            if result.timed_out() {
                return *done;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// Submit a task that parks on a channel until released; the returned
    /// receiver fires once a worker has actually claimed the task.
    fn submit_parked(pool: &WorkerPool) -> (mpsc::Sender<()>, mpsc::Receiver<()>, TaskHandle) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let handle = pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        (release_tx, started_rx, handle)
    }

    #[test]
    fn test_task_runs_and_handle_completes() {
        let pool = WorkerPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = Arc::clone(&ran);

        let handle = pool.submit(move || {
            ran_in_task.fetch_add(1, Ordering::SeqCst);
        });
        handle.wait();

        assert!(handle.is_finished());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unfinished_count_matches_active_tasks() {
        let pool = WorkerPool::new(2);
        let mut parked = Vec::new();
        for _ in 0..3 {
            let (release, started, handle) = submit_parked(&pool);
            started.recv_timeout(Duration::from_secs(2)).unwrap();
            parked.push((release, handle));
        }

        assert_eq!(pool.unfinished_count(), 3);

        for (release, handle) in parked {
            release.send(()).unwrap();
            handle.wait();
        }
        // Workers may take a beat to mark themselves idle again.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.unfinished_count() != 0 {
            assert!(std::time::Instant::now() < deadline);
            thread::yield_now();
        }
    }

    #[test]
    fn test_pool_grows_one_worker_per_saturated_submit() {
        let pool = WorkerPool::new(1);
        assert_eq!(pool.worker_count(), 1);

        let mut parked = Vec::new();
        let mut last_count = 1;
        for _ in 0..3 {
            let (release, started, handle) = submit_parked(&pool);
            started.recv_timeout(Duration::from_secs(2)).unwrap();
            parked.push((release, handle));

            // Monotone, and at most one new worker per submit.
            let count = pool.worker_count();
            assert!(count >= last_count);
            assert!(count <= last_count + 1);
            last_count = count;
        }

        // Every task got its own worker, so the pool grew to 3.
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.unfinished_count(), 3);

        for (release, handle) in parked {
            release.send(()).unwrap();
            handle.wait();
        }
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        // One parked task holds the single worker so the rest queue up.
        let (release, started, _handle) = submit_parked(&pool);
        started.recv_timeout(Duration::from_secs(2)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        release.send(()).unwrap();
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        for handle in &handles {
            assert!(handle.is_finished());
        }
    }

    #[test]
    #[should_panic(expected = "shut down")]
    fn test_submit_after_shutdown_panics() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.submit(|| {});
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_wait_timeout_reports_unfinished() {
        let pool = WorkerPool::new(1);
        let (release, started, handle) = submit_parked(&pool);
        started.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(!handle.wait_timeout(Duration::from_millis(50)));
        release.send(()).unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(2)));
    }
}
