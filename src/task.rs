//! A scheduler of serial task queues multiplexed onto a thread pool.
//!
//! A [`TaskRunner`] owns worker threads and a coordinator. Work is
//! organized into [`TaskQueue`]s: each queue runs at most one of its
//! tasks at a time, while tasks of different queues run in parallel.
//! Tasks may reschedule themselves by returning a non-negative delay.
//!
//! Time comes from the runner's backend so tests can substitute a fake
//! clock and make scheduling deterministic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

/// Worker threads exit after this long without work.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Returned by a task body to indicate it is done and must not be
/// rescheduled.
pub const DONE: i64 = -1;

/// A unit of repeatable work owned by exactly one queue.
pub struct Task {
    name: String,
    cancelable: bool,
    block: Box<dyn FnMut() -> i64 + Send>,
    next_execute_nanos: u64,
    insertion: u64,
}

impl Task {
    /// Creates a task. `block` returns a delay in nanoseconds to run
    /// again, or [`DONE`].
    pub fn new<F>(name: impl Into<String>, cancelable: bool, block: F) -> Task
    where
        F: FnMut() -> i64 + Send + 'static,
    {
        Task {
            name: name.into(),
            cancelable,
            block: Box::new(block),
            next_execute_nanos: 0,
            insertion: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("cancelable", &self.cancelable)
            .finish()
    }
}

/// Supplies threads and time to a [`TaskRunner`].
pub(crate) trait Backend: Send + Sync + 'static {
    /// Nanoseconds on a monotonic clock with an arbitrary origin.
    fn nano_time(&self) -> u64;

    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// A latch released when its queue becomes idle.
pub struct CountDownLatch {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl CountDownLatch {
    fn new(count: usize) -> CountDownLatch {
        CountDownLatch {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.condvar.notify_all();
            }
        }
    }

    /// Waits for the count to reach zero. Returns false on timeout.
    pub fn await_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.condvar.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
        true
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &*self.count.lock().unwrap())
            .finish()
    }
}

/// Runs task queues on a shared pool of daemon worker threads.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    state: Mutex<Coordinator>,
    condvar: Condvar,
}

struct Coordinator {
    queues: HashMap<u64, Queue>,
    next_queue_id: u64,
    next_insertion: u64,
    coordinator_started: bool,
    coordinator_waiting: bool,
    coordinator_wake_up_at: u64,
}

struct Queue {
    name: String,
    shutdown: bool,
    /// Name of the task currently running, if any.
    active_task: Option<String>,
    cancel_active: bool,
    future_tasks: Vec<Task>,
    idle_latch: Option<Arc<CountDownLatch>>,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.active_task.is_none() && self.future_tasks.is_empty()
    }

    fn release_idle_latch(&mut self) {
        if self.is_idle() {
            if let Some(latch) = self.idle_latch.take() {
                latch.count_down();
            }
        }
    }
}

impl TaskRunner {
    /// The process-wide runner backed by daemon threads.
    pub fn global() -> &'static TaskRunner {
        static GLOBAL: OnceLock<TaskRunner> = OnceLock::new();
        GLOBAL.get_or_init(TaskRunner::new)
    }

    pub fn new() -> TaskRunner {
        TaskRunner::with_backend(Arc::new(ThreadPoolBackend::new()))
    }

    pub(crate) fn with_backend(backend: Arc<dyn Backend>) -> TaskRunner {
        TaskRunner {
            inner: Arc::new(Inner {
                backend,
                state: Mutex::new(Coordinator {
                    queues: HashMap::new(),
                    next_queue_id: 1,
                    next_insertion: 0,
                    coordinator_started: false,
                    coordinator_waiting: false,
                    coordinator_wake_up_at: 0,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates a new serial queue.
    pub fn new_queue(&self) -> TaskQueue {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_queue_id;
        state.next_queue_id += 1;
        state.queues.insert(
            id,
            Queue {
                name: format!("Q{}", id),
                shutdown: false,
                active_task: None,
                cancel_active: false,
                future_tasks: Vec::new(),
                idle_latch: None,
            },
        );
        TaskQueue {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Snapshot of queues that still have work, used for orderly stop.
    pub fn active_queues(&self) -> Vec<TaskQueue> {
        let state = self.inner.state.lock().unwrap();
        state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_idle())
            .map(|(&id, _)| TaskQueue {
                inner: self.inner.clone(),
                id,
            })
            .collect()
    }

    pub(crate) fn nano_time(&self) -> u64 {
        self.inner.backend.nano_time()
    }
}

impl Default for TaskRunner {
    fn default() -> TaskRunner {
        TaskRunner::new()
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TaskRunner")
    }
}

/// A serial queue of tasks owned by a [`TaskRunner`].
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
    id: u64,
}

impl TaskQueue {
    /// Schedules `task` to run after `delay_nanos`.
    ///
    /// If a task with the same name is already scheduled, the earlier
    /// execution time wins. Cancelable tasks scheduled after shutdown are
    /// silently dropped.
    ///
    /// # Panics
    ///
    /// Panics if the queue is shut down and the task is not cancelable.
    pub fn schedule(&self, mut task: Task, delay_nanos: u64) {
        let mut state = self.inner.state.lock().unwrap();
        let now = self.inner.backend.nano_time();
        let at = now.saturating_add(delay_nanos);
        let insertion = state.next_insertion;
        state.next_insertion += 1;

        let queue = state.queues.get_mut(&self.id).expect("queue exists");
        if queue.shutdown {
            if task.cancelable {
                trace!("{} schedule dropped, queue is shut down: {}", queue.name, task.name);
                return;
            }
            panic!("queue {} is shut down; cannot schedule {}", queue.name, task.name);
        }

        if let Some(existing) = queue
            .future_tasks
            .iter()
            .position(|t| t.name == task.name)
        {
            if queue.future_tasks[existing].next_execute_nanos <= at {
                trace!("{} already scheduled earlier: {}", queue.name, task.name);
                return;
            }
            queue.future_tasks.remove(existing);
        }

        task.next_execute_nanos = at;
        task.insertion = insertion;
        let pos = queue
            .future_tasks
            .iter()
            .position(|t| {
                (t.next_execute_nanos, t.insertion) > (task.next_execute_nanos, task.insertion)
            })
            .unwrap_or(queue.future_tasks.len());
        trace!("{} scheduled after {}ns: {}", queue.name, delay_nanos, task.name);
        queue.future_tasks.insert(pos, task);

        self.inner.kick_coordinator(&mut state);
    }

    /// Schedules a one-shot block.
    pub fn execute<F>(&self, name: impl Into<String>, delay_nanos: u64, cancelable: bool, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut block = Some(block);
        self.schedule(
            Task::new(name, cancelable, move || {
                if let Some(f) = block.take() {
                    f();
                }
                DONE
            }),
            delay_nanos,
        );
    }

    /// Returns a latch that reaches zero the next time this queue has no
    /// active task and no scheduled tasks.
    pub fn idle_latch(&self) -> Arc<CountDownLatch> {
        let mut state = self.inner.state.lock().unwrap();
        let queue = state.queues.get_mut(&self.id).expect("queue exists");
        if queue.is_idle() {
            return Arc::new(CountDownLatch::new(0));
        }
        if let Some(ref existing) = queue.idle_latch {
            return existing.clone();
        }
        let latch = Arc::new(CountDownLatch::new(1));
        queue.idle_latch = Some(latch.clone());
        latch
    }

    /// Cancels the active task after completion and removes cancelable
    /// future tasks. Uncancelable tasks remain scheduled.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let queue = state.queues.get_mut(&self.id).expect("queue exists");
        Self::cancel_all_locked(queue);
        queue.release_idle_latch();
        self.inner.condvar.notify_all();
    }

    fn cancel_all_locked(queue: &mut Queue) {
        if queue.active_task.is_some() {
            queue.cancel_active = true;
        }
        queue.future_tasks.retain(|t| {
            if t.cancelable {
                trace!("{} canceled: {}", queue.name, t.name);
                false
            } else {
                true
            }
        });
    }

    /// Shuts the queue down: no further scheduling, cancelable work is
    /// dropped.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let queue = state.queues.get_mut(&self.id).expect("queue exists");
        queue.shutdown = true;
        Self::cancel_all_locked(queue);
        queue.release_idle_latch();
        self.inner.condvar.notify_all();
    }

    pub fn name(&self) -> String {
        let state = self.inner.state.lock().unwrap();
        state.queues[&self.id].name.clone()
    }

    /// Number of tasks currently scheduled, for diagnostics.
    pub fn scheduled_task_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queues[&self.id].future_tasks.len()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("id", &self.id).finish()
    }
}

impl Inner {
    /// With `state` held: ensure the coordinator is running and will
    /// observe the newest schedule.
    fn kick_coordinator(self: &Arc<Inner>, state: &mut Coordinator) {
        if state.coordinator_waiting {
            self.condvar.notify_all();
        } else if !state.coordinator_started {
            state.coordinator_started = true;
            let inner = self.clone();
            thread::Builder::new()
                .name("courier task coordinator".to_string())
                .spawn(move || inner.coordinate())
                .expect("failed to spawn coordinator");
        }
    }

    /// The coordinator loop: select the next due task across ready
    /// queues, hand it to the pool, or sleep until the earliest wake-up.
    fn coordinate(self: Arc<Inner>) {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = self.backend.nano_time();
            let mut earliest: Option<(u64, u64)> = None; // (at, queue id)
            for (&id, queue) in &state.queues {
                if queue.active_task.is_some() {
                    continue;
                }
                if let Some(task) = queue.future_tasks.first() {
                    let candidate = (task.next_execute_nanos, id);
                    if earliest.map(|e| candidate < e).unwrap_or(true) {
                        earliest = Some(candidate);
                    }
                }
            }

            match earliest {
                Some((at, id)) if at <= now => {
                    let queue = state.queues.get_mut(&id).expect("queue exists");
                    let task = queue.future_tasks.remove(0);
                    queue.active_task = Some(task.name.clone());
                    trace!("{} run: {}", queue.name, task.name);
                    let inner = self.clone();
                    self.backend
                        .execute(Box::new(move || inner.run_task(id, task)));
                }
                Some((at, _)) => {
                    state.coordinator_waiting = true;
                    state.coordinator_wake_up_at = at;
                    let wait = Duration::from_nanos(at - now);
                    let (guard, _) = self.condvar.wait_timeout(state, wait).unwrap();
                    state = guard;
                    state.coordinator_waiting = false;
                }
                None => {
                    state.coordinator_waiting = true;
                    state.coordinator_wake_up_at = u64::MAX;
                    state = self.condvar.wait(state).unwrap();
                    state.coordinator_waiting = false;
                }
            }
        }
    }

    /// Runs one task on a pool thread and performs post-run bookkeeping.
    fn run_task(self: Arc<Inner>, queue_id: u64, mut task: Task) {
        let delay = (task.block)();

        let mut state = self.state.lock().unwrap();
        let insertion = state.next_insertion;
        state.next_insertion += 1;
        let now = self.backend.nano_time();
        let queue = state.queues.get_mut(&queue_id).expect("queue exists");
        queue.active_task = None;
        let canceled = std::mem::take(&mut queue.cancel_active);

        if delay >= 0 && !canceled && !queue.shutdown {
            task.next_execute_nanos = now.saturating_add(delay as u64);
            task.insertion = insertion;
            let pos = queue
                .future_tasks
                .iter()
                .position(|t| {
                    (t.next_execute_nanos, t.insertion)
                        > (task.next_execute_nanos, task.insertion)
                })
                .unwrap_or(queue.future_tasks.len());
            queue.future_tasks.insert(pos, task);
        }

        queue.release_idle_latch();
        if !queue.future_tasks.is_empty() {
            self.kick_coordinator(&mut state);
        }
    }
}

/// Worker threads created on demand, kept alive for [`KEEP_ALIVE`].
pub(crate) struct ThreadPoolBackend {
    origin: Instant,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    idle: Mutex<Vec<IdleWorker>>,
    next_worker: AtomicU64,
}

struct IdleWorker {
    id: u64,
    tx: mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl ThreadPoolBackend {
    pub(crate) fn new() -> ThreadPoolBackend {
        ThreadPoolBackend {
            origin: Instant::now(),
            shared: Arc::new(PoolShared {
                idle: Mutex::new(Vec::new()),
                next_worker: AtomicU64::new(0),
            }),
        }
    }
}

impl Backend for ThreadPoolBackend {
    fn nano_time(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        let mut job = job;
        loop {
            let worker = self.shared.idle.lock().unwrap().pop();
            match worker {
                Some(w) => match w.tx.send(job) {
                    Ok(()) => return,
                    // The worker timed out concurrently; try another.
                    Err(mpsc::SendError(j)) => job = j,
                },
                None => {
                    let id = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
                    spawn_worker(self.shared.clone(), id, job);
                    return;
                }
            }
        }
    }
}

fn spawn_worker(pool: Arc<PoolShared>, id: u64, first_job: Box<dyn FnOnce() + Send>) {
    // Workers push themselves back onto their pool's idle list between
    // jobs; a worker claimed concurrently with its timeout must still
    // accept the in-flight job.
    let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
    thread::Builder::new()
        .name(format!("courier worker {}", id))
        .spawn(move || {
            first_job();
            loop {
                pool.idle.lock().unwrap().push(IdleWorker {
                    id,
                    tx: tx.clone(),
                });
                match rx.recv_timeout(KEEP_ALIVE) {
                    Ok(job) => job(),
                    Err(RecvTimeoutError::Timeout) => {
                        let mut idle = pool.idle.lock().unwrap();
                        if let Some(pos) = idle.iter().position(|w| w.id == id) {
                            idle.remove(pos);
                            return;
                        }
                        drop(idle);
                        match rx.recv() {
                            Ok(job) => job(),
                            Err(_) => return,
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .expect("failed to spawn worker");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner() -> TaskRunner {
        TaskRunner::new()
    }

    #[test]
    fn one_shot_executes() {
        let runner = runner();
        let queue = runner.new_queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        queue.execute("one-shot", 0, true, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.idle_latch().await_zero(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_task_reschedules() {
        let runner = runner();
        let queue = runner.new_queue();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        queue.schedule(
            Task::new("recurring", true, move || {
                let n = runs2.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    1_000_000 // 1ms
                } else {
                    DONE
                }
            }),
            0,
        );
        assert!(queue.idle_latch().await_zero(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn queues_are_serial() {
        let runner = runner();
        let queue = runner.new_queue();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            queue.execute(format!("task {}", i), 0, true, move || {
                let n = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }
        assert!(queue.idle_latch().await_zero(Duration::from_secs(5)));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_queues_run_in_parallel() {
        let runner = runner();
        let a = runner.new_queue();
        let b = runner.new_queue();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        // Task A blocks until task B signals it; requires parallelism.
        let (unblock_tx, unblock_rx) = mpsc::channel();
        a.execute("a", 0, true, move || {
            unblock_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            tx.send("a").unwrap();
        });
        b.execute("b", 0, true, move || {
            unblock_tx.send(()).unwrap();
            tx2.send("b").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
    }

    #[test]
    fn duplicate_schedule_keeps_earlier_time() {
        let runner = runner();
        let queue = runner.new_queue();
        queue.schedule(Task::new("dup", true, || DONE), 10_000_000_000);
        queue.schedule(Task::new("dup", true, || DONE), 20_000_000_000);
        assert_eq!(queue.scheduled_task_count(), 1);
        // A later schedule with an earlier time replaces the entry.
        queue.schedule(Task::new("dup", true, || DONE), 30_000_000);
        assert_eq!(queue.scheduled_task_count(), 1);
        queue.cancel_all();
    }

    #[test]
    fn cancel_all_removes_cancelable_only() {
        let runner = runner();
        let queue = runner.new_queue();
        queue.schedule(Task::new("cancelable", true, || DONE), 60_000_000_000);
        queue.schedule(Task::new("uncancelable", false, || DONE), 60_000_000_000);
        assert_eq!(queue.scheduled_task_count(), 2);
        queue.cancel_all();
        assert_eq!(queue.scheduled_task_count(), 1);
    }

    #[test]
    fn shutdown_drops_cancelable_and_panics_otherwise() {
        let runner = runner();
        let queue = runner.new_queue();
        queue.shutdown();
        // Cancelable: silently dropped.
        queue.schedule(Task::new("late", true, || DONE), 0);
        assert_eq!(queue.scheduled_task_count(), 0);
        // Not cancelable: rejected loudly.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.schedule(Task::new("required", false, || DONE), 0);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn active_queues_snapshot() {
        let runner = runner();
        let queue = runner.new_queue();
        assert_eq!(runner.active_queues().len(), 0);
        queue.schedule(Task::new("waiting", true, || DONE), 60_000_000_000);
        assert_eq!(runner.active_queues().len(), 1);
        queue.cancel_all();
        assert_eq!(runner.active_queues().len(), 0);
    }
}
