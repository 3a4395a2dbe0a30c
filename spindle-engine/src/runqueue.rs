//! The run queue.
//!
//! Process-wide interval scheduler driving source ticks on worker threads.
//! Tasks are rescheduled by their own tick through the handle passed into
//! `run`; at most one invocation of a task runs at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

pub type TaskId = u64;

/// Work scheduled on the queue.
pub trait Runnable: Send + Sync {
    fn run(&self, rq: &RunQueue, id: TaskId);
}

struct Task {
    runnable: Arc<dyn Runnable>,
    interval: Duration,
    /// `None` = parked until an explicit wake.
    next_run: Option<Instant>,
    running: bool,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    next_id: TaskId,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Cloneable handle to the shared queue.
#[derive(Clone)]
pub struct RunQueue {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn worker threads that execute due tasks.
    pub fn start(&self, workers: usize) {
        let mut handles = self.workers.lock().unwrap();
        for n in 0..workers {
            let rq = self.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("spindle-rq-{n}"))
                    .spawn(move || rq.worker_loop())
                    .expect("spawn runqueue worker"),
            );
        }
    }

    /// Register a task; first run is due immediately.
    pub fn insert(&self, runnable: Arc<dyn Runnable>, interval: Duration) -> TaskId {
        let mut state = self.inner.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(
            id,
            Task {
                runnable,
                interval,
                next_run: Some(Instant::now()),
                running: false,
            },
        );
        self.inner.cond.notify_all();
        id
    }

    /// Reschedule: `defer` parks the task until an external wake, otherwise
    /// the next run lands one interval out.
    pub fn resched(&self, id: TaskId, defer: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.next_run = if defer {
                None
            } else {
                Some(Instant::now() + task.interval)
            };
        }
        self.inner.cond.notify_all();
    }

    /// Reschedule to run after `delay`.
    pub fn resched_after(&self, id: TaskId, delay: Duration) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.next_run = Some(Instant::now() + delay);
        }
        self.inner.cond.notify_all();
    }

    /// Make the task due now.
    pub fn wake(&self, id: TaskId) {
        self.resched_after(id, Duration::ZERO);
    }

    /// Park the task.
    pub fn stop(&self, id: TaskId) {
        self.resched(id, true);
    }

    pub fn remove(&self, id: TaskId) {
        let mut state = self.inner.state.lock().unwrap();
        state.tasks.remove(&id);
        self.inner.cond.notify_all();
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .map(|t| t.running)
            .unwrap_or(false)
    }

    pub fn set_interval(&self, id: TaskId, interval: Duration) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.interval = interval;
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop workers and join them. Tasks stay registered but never run
    /// again.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cond.notify_all();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        debug!("runqueue stopped");
    }

    fn worker_loop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut due = None;
            let mut earliest: Option<Instant> = None;
            for (id, task) in state.tasks.iter() {
                if task.running {
                    continue;
                }
                match task.next_run {
                    Some(at) if at <= now => {
                        due = Some(*id);
                        break;
                    }
                    Some(at) => {
                        earliest = Some(earliest.map_or(at, |e: Instant| e.min(at)));
                    }
                    None => {}
                }
            }

            match due {
                Some(id) => {
                    let task = state.tasks.get_mut(&id).expect("due task present");
                    task.running = true;
                    // Park until the tick reschedules us.
                    task.next_run = None;
                    let runnable = task.runnable.clone();
                    drop(state);

                    runnable.run(self, id);

                    state = self.inner.state.lock().unwrap();
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.running = false;
                    }
                    self.inner.cond.notify_all();
                }
                None => {
                    state = match earliest {
                        Some(at) => {
                            let wait = at.saturating_duration_since(now);
                            self.inner.cond.wait_timeout(state, wait).unwrap().0
                        }
                        None => self.inner.cond.wait(state).unwrap(),
                    };
                }
            }
        }
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
        reschedule: bool,
    }

    impl Runnable for Counter {
        fn run(&self, rq: &RunQueue, id: TaskId) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.reschedule {
                rq.resched_after(id, Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn test_insert_runs_once_then_parks() {
        let rq = RunQueue::new();
        rq.start(2);
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), reschedule: false });
        let id = rq.insert(counter.clone(), Duration::from_secs(3600));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.runs.load(Ordering::SeqCst), 1);
        assert!(!rq.is_running(id));

        // Parked: no further runs without a wake.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.runs.load(Ordering::SeqCst), 1);

        rq.wake(id);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.runs.load(Ordering::SeqCst), 2);
        rq.shutdown();
    }

    #[test]
    fn test_self_rescheduling_task() {
        let rq = RunQueue::new();
        rq.start(1);
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), reschedule: true });
        rq.insert(counter.clone(), Duration::from_secs(3600));

        std::thread::sleep(Duration::from_millis(200));
        assert!(counter.runs.load(Ordering::SeqCst) >= 3);
        rq.shutdown();
    }

    #[test]
    fn test_remove_stops_task() {
        let rq = RunQueue::new();
        rq.start(1);
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), reschedule: true });
        let id = rq.insert(counter.clone(), Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(50));
        rq.remove(id);
        let seen = counter.runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.runs.load(Ordering::SeqCst), seen);
        rq.shutdown();
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let rq = RunQueue::new();
        rq.start(4);
        rq.shutdown();
        assert!(rq.is_shutdown());
    }
}
