//! Work-stealing scheduler for in-process parallel work.
//!
//! Each worker owns a double-ended queue: the owner pushes and pops at the
//! bottom (LIFO, preserving locality) while thieves take from the top (FIFO,
//! preserving fairness) and only when at least two tasks are queued, so one
//! is always left for the owner. Fresh submissions land in a global queue
//! ordered by priority and submission time, with an age-based boost so
//! low-priority tasks can't starve.

use errors::*;

use rand::seq::SliceRandom;
use rand::thread_rng;
use slog::Logger;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

//
// Public types
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    fn value(&self) -> i64 {
        match *self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

pub struct Task<P> {
    pub id:      u64,
    pub payload: P,

    priority:     i64,
    submitted_at: Instant,
}

pub struct WorkerDeque<P> {
    deque: Mutex<VecDeque<Task<P>>>,

    pushed: AtomicUsize,
    popped: AtomicUsize,
    stolen: AtomicUsize,
}

impl<P> WorkerDeque<P> {
    fn new() -> WorkerDeque<P> {
        WorkerDeque {
            deque:  Mutex::new(VecDeque::new()),
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
            stolen: AtomicUsize::new(0),
        }
    }

    /// Owner operation: push to the bottom.
    pub fn push(&self, task: Task<P>) {
        lock(&self.deque).push_back(task);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Owner operation: pop from the bottom.
    pub fn pop(&self) -> Option<Task<P>> {
        let task = lock(&self.deque).pop_back();
        if task.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        task
    }

    /// Thief operation: take from the top, leaving at least one task for
    /// the owner.
    pub fn steal(&self) -> Option<Task<P>> {
        let task = {
            let mut deque = lock(&self.deque);
            if deque.len() > 1 {
                deque.pop_front()
            } else {
                None
            }
        };
        if task.is_some() {
            self.stolen.fetch_add(1, Ordering::Relaxed);
        }
        task
    }

    pub fn len(&self) -> usize {
        lock(&self.deque).len()
    }

    pub fn stats(&self) -> WorkerDequeStats {
        WorkerDequeStats {
            size:   self.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerDequeStats {
    pub size:   usize,
    pub pushed: usize,
    pub popped: usize,
    pub stolen: usize,
}

#[derive(Clone, Debug)]
pub struct SchedulerStats {
    pub num_workers:       usize,
    pub global_queue_size: usize,
    pub tasks_submitted:   usize,
    pub tasks_completed:   usize,
    pub steal_attempts:    usize,
    pub successful_steals: usize,
    pub worker_stats:      Vec<WorkerDequeStats>,
}

pub struct Scheduler<P> {
    deques: Vec<WorkerDeque<P>>,
    global: Mutex<Vec<Task<P>>>,

    aging_interval: Duration,
    max_age_boost:  i64,

    next_id:        AtomicU64,
    submitted:      AtomicUsize,
    completed:      AtomicUsize,
    steal_attempts: AtomicUsize,
    steals:         AtomicUsize,
}

impl<P> Scheduler<P> {
    pub fn new(num_workers: u32) -> Scheduler<P> {
        Scheduler::with_aging(num_workers, DEFAULT_AGING_INTERVAL, DEFAULT_MAX_AGE_BOOST)
    }

    pub fn with_aging(
        num_workers: u32,
        aging_interval: Duration,
        max_age_boost: i64,
    ) -> Scheduler<P> {
        Scheduler {
            deques: (0..num_workers).map(|_| WorkerDeque::new()).collect(),
            global: Mutex::new(Vec::new()),
            aging_interval,
            max_age_boost,
            next_id: AtomicU64::new(1),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            steal_attempts: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.deques.len()
    }

    /// Submits a task into the global queue.
    pub fn submit(&self, payload: P, priority: TaskPriority) -> u64 {
        let task = self.new_task(payload, priority);
        let id = task.id;
        lock(&self.global).push(task);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Pushes a task straight onto one worker's deque, bypassing the global
    /// queue.
    pub fn distribute_to_worker(&self, worker: usize, payload: P, priority: TaskPriority) -> u64 {
        let task = self.new_task(payload, priority);
        let id = task.id;
        self.deques[worker].push(task);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Fetches the next task for a worker: own deque first, then the global
    /// queue, then a randomised sweep of the other workers' deques.
    pub fn get_task(&self, worker: usize) -> Option<Task<P>> {
        if let Some(task) = self.deques[worker].pop() {
            return Some(task);
        }
        if let Some(task) = self.pop_global() {
            return Some(task);
        }
        self.steal_task(worker)
    }

    pub fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            num_workers:       self.deques.len(),
            global_queue_size: lock(&self.global).len(),
            tasks_submitted:   self.submitted.load(Ordering::Relaxed),
            tasks_completed:   self.completed.load(Ordering::Relaxed),
            steal_attempts:    self.steal_attempts.load(Ordering::Relaxed),
            successful_steals: self.steals.load(Ordering::Relaxed),
            worker_stats:      self.deques.iter().map(|d| d.stats()).collect(),
        }
    }

    //
    // Private functions
    //

    fn new_task(&self, payload: P, priority: TaskPriority) -> Task<P> {
        Task {
            id:           self.next_id.fetch_add(1, Ordering::Relaxed),
            payload,
            priority:     priority.value(),
            submitted_at: Instant::now(),
        }
    }

    // Age boost applied at selection time, so long-queued low-priority tasks
    // eventually outrank fresh high-priority ones.
    fn effective_priority(&self, task: &Task<P>) -> i64 {
        let age = task.submitted_at.elapsed();
        let intervals = if self.aging_interval.as_secs() == 0
            && self.aging_interval.subsec_nanos() == 0
        {
            0
        } else {
            (nanos(age) / nanos(self.aging_interval)) as i64
        };
        task.priority + intervals.min(self.max_age_boost)
    }

    fn pop_global(&self) -> Option<Task<P>> {
        let mut global = lock(&self.global);
        if global.is_empty() {
            return None;
        }

        let mut best = 0;
        for i in 1..global.len() {
            let best_priority = self.effective_priority(&global[best]);
            let candidate_priority = self.effective_priority(&global[i]);
            if candidate_priority > best_priority
                || (candidate_priority == best_priority
                    && global[i].submitted_at < global[best].submitted_at)
            {
                best = i;
            }
        }
        Some(global.remove(best))
    }

    fn steal_task(&self, thief: usize) -> Option<Task<P>> {
        self.steal_attempts.fetch_add(1, Ordering::Relaxed);

        let mut victims: Vec<usize> =
            (0..self.deques.len()).filter(|i| *i != thief).collect();
        victims.shuffle(&mut thread_rng());

        for victim in victims {
            if let Some(task) = self.deques[victim].steal() {
                self.steals.fetch_add(1, Ordering::Relaxed);
                return Some(task);
            }
        }
        None
    }
}

/// What happened to one executed task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskOutcome<R> {
    Completed(R),
    Failed(String),
}

/// Runs tasks from a `Scheduler` across a set of worker threads. Workers
/// observe the shutdown flag between tasks; results are stored under the
/// task id until the submitter collects them.
pub struct Executor<P, R> {
    scheduler: Arc<Scheduler<P>>,
    results:   Arc<Mutex<HashMap<u64, TaskOutcome<R>>>>,
    shutdown:  Arc<AtomicBool>,
    workers:   Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<P, R> Executor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn start(
        log: &Logger,
        num_workers: u32,
        handler: Arc<Fn(&Logger, P) -> Result<R> + Send + Sync>,
    ) -> Result<Executor<P, R>> {
        Executor::start_with_scheduler(log, Arc::new(Scheduler::new(num_workers)), handler)
    }

    /// Starts workers against an existing scheduler, which may already hold
    /// queued tasks.
    pub fn start_with_scheduler(
        log: &Logger,
        scheduler: Arc<Scheduler<P>>,
        handler: Arc<Fn(&Logger, P) -> Result<R> + Send + Sync>,
    ) -> Result<Executor<P, R>> {
        let results: Arc<Mutex<HashMap<u64, TaskOutcome<R>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = vec![];
        for i in 0..scheduler.num_workers() {
            let thread_name = format!("scheduler_{:03}", i);
            let log = log.new(o!("thread" => thread_name.clone()));
            let scheduler_clone = Arc::clone(&scheduler);
            let results_clone = Arc::clone(&results);
            let shutdown_clone = Arc::clone(&shutdown);
            let handler_clone = Arc::clone(&handler);

            workers.push(thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    work(&log, i, &scheduler_clone, &results_clone, &shutdown_clone, &*handler_clone);
                })
                .map_err(Error::from)?);
        }

        Ok(Executor {
            scheduler,
            results,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    pub fn submit(&self, payload: P, priority: TaskPriority) -> u64 {
        self.scheduler.submit(payload, priority)
    }

    /// Retrieves a completed task's outcome, polling up to `timeout`. The
    /// outcome is forgotten once collected.
    pub fn collect(&self, task_id: u64, timeout: Duration) -> Option<TaskOutcome<R>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = lock(&self.results).remove(&task_id) {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(COLLECT_POLL_INTERVAL);
        }
    }

    /// Submits a batch and collects every outcome, preserving input order.
    pub fn run_batch(
        &self,
        payloads: Vec<P>,
        priority: TaskPriority,
        per_task_timeout: Duration,
    ) -> Vec<Option<TaskOutcome<R>>> {
        let ids: Vec<u64> = payloads
            .into_iter()
            .map(|p| self.submit(p, priority))
            .collect();
        ids.into_iter()
            .map(|id| self.collect(id, per_task_timeout))
            .collect()
    }

    /// Cooperative shutdown: workers finish their current task and exit.
    pub fn stop(&self, log: &Logger) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        debug!(log, "Executor stopped");
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<P>> {
        &self.scheduler
    }
}

//
// Private constants
//

const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_AGING_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_AGE_BOOST: i64 = 2;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

//
// Private functions
//

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn nanos(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000) + u64::from(d.subsec_nanos())
}

fn work<P, R>(
    log: &Logger,
    worker: usize,
    scheduler: &Scheduler<P>,
    results: &Mutex<HashMap<u64, TaskOutcome<R>>>,
    shutdown: &AtomicBool,
    handler: &(Fn(&Logger, P) -> Result<R> + Send + Sync),
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match scheduler.get_task(worker) {
            Some(task) => {
                let outcome = match handler(log, task.payload) {
                    Ok(res) => TaskOutcome::Completed(res),
                    Err(e) => {
                        let message = error_strings(&e).join(": ");
                        error!(log, "Task failed"; "task_id" => task.id, "error" => message.as_str());
                        TaskOutcome::Failed(message)
                    }
                };
                lock(results).insert(task.id, outcome);
                scheduler.mark_completed();
            }
            None => thread::sleep(IDLE_POLL_INTERVAL),
        }
    }
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use scheduler::*;
    use test_helpers;

    #[test]
    fn test_deque_discipline() {
        let deque: WorkerDeque<i32> = WorkerDeque::new();
        let scheduler: Scheduler<i32> = Scheduler::new(1);

        deque.push(scheduler.new_task(1, TaskPriority::Normal));
        // A single queued task is left for the owner.
        assert!(deque.steal().is_none());

        deque.push(scheduler.new_task(2, TaskPriority::Normal));
        // Thieves take the oldest task from the top.
        assert_eq!(1, deque.steal().unwrap().payload);
        // The owner pops the newest from the bottom.
        assert_eq!(2, deque.pop().unwrap().payload);
        assert!(deque.pop().is_none());

        let stats = deque.stats();
        assert_eq!(2, stats.pushed);
        assert_eq!(1, stats.popped);
        assert_eq!(1, stats.stolen);
    }

    #[test]
    fn test_global_queue_priority_order() {
        let scheduler: Scheduler<&'static str> = Scheduler::new(1);
        scheduler.submit("low", TaskPriority::Low);
        scheduler.submit("critical", TaskPriority::Critical);
        scheduler.submit("normal", TaskPriority::Normal);

        assert_eq!("critical", scheduler.get_task(0).unwrap().payload);
        assert_eq!("normal", scheduler.get_task(0).unwrap().payload);
        assert_eq!("low", scheduler.get_task(0).unwrap().payload);
        assert!(scheduler.get_task(0).is_none());
    }

    #[test]
    fn test_aging_boosts_starved_tasks() {
        use std::thread;

        let scheduler: Scheduler<&'static str> =
            Scheduler::with_aging(1, Duration::from_millis(10), 2);

        scheduler.submit("old_low", TaskPriority::Low);
        thread::sleep(Duration::from_millis(50));
        scheduler.submit("fresh_high", TaskPriority::High);

        // With a boost of 2 the old low-priority task ties the high one and
        // wins on submission time.
        assert_eq!("old_low", scheduler.get_task(0).unwrap().payload);
        assert_eq!("fresh_high", scheduler.get_task(0).unwrap().payload);
    }

    #[test]
    fn test_executor_runs_submitted_tasks() {
        let log = test_helpers::log();
        let handler = Arc::new(|_log: &Logger, n: i64| -> Result<i64> { Ok(n * 2) });
        let executor = Executor::start(&log, 2, handler).unwrap();

        let ids: Vec<u64> = (0..20)
            .map(|n| executor.submit(n, TaskPriority::Normal))
            .collect();

        for (n, id) in ids.iter().enumerate() {
            let outcome = executor.collect(*id, Duration::from_secs(10)).unwrap();
            assert_eq!(TaskOutcome::Completed(n as i64 * 2), outcome);
        }

        executor.stop(&log);
        assert_eq!(20, executor.scheduler().stats().tasks_completed);
    }

    #[test]
    fn test_executor_handler_error_is_failure() {
        let log = test_helpers::log();
        let handler = Arc::new(|_log: &Logger, n: i64| -> Result<i64> {
            if n == 13 {
                Err(Error::from("Unlucky"))
            } else {
                Ok(n)
            }
        });
        let executor = Executor::start(&log, 1, handler).unwrap();

        let id = executor.submit(13, TaskPriority::Normal);
        match executor.collect(id, Duration::from_secs(10)).unwrap() {
            TaskOutcome::Failed(message) => assert!(message.contains("Unlucky")),
            TaskOutcome::Completed(_) => panic!("expected failure"),
        }

        executor.stop(&log);
    }

    #[test]
    fn test_collect_times_out() {
        let log = test_helpers::log();
        let handler = Arc::new(|_log: &Logger, _n: i64| -> Result<i64> {
            ::std::thread::sleep(Duration::from_millis(500));
            Ok(0)
        });
        let executor = Executor::start(&log, 1, handler).unwrap();

        let id = executor.submit(1, TaskPriority::Normal);
        assert!(executor.collect(id, Duration::from_millis(20)).is_none());

        executor.stop(&log);
    }

    #[test]
    fn test_work_stealing_drains_one_hot_deque() {
        let log = test_helpers::log();

        // All 100 tasks start on worker 0's deque; the other three workers
        // have nothing to do but steal.
        let scheduler: Arc<Scheduler<i64>> = Arc::new(Scheduler::new(4));
        let ids: Vec<u64> = (0..100)
            .map(|n| scheduler.distribute_to_worker(0, n, TaskPriority::Normal))
            .collect();

        let handler = Arc::new(|_log: &Logger, n: i64| -> Result<i64> {
            ::std::thread::sleep(Duration::from_millis(1));
            Ok(n)
        });
        let executor =
            Executor::start_with_scheduler(&log, Arc::clone(&scheduler), handler).unwrap();

        let mut completed = 0;
        for id in ids {
            if executor.collect(id, Duration::from_secs(30)).is_some() {
                completed += 1;
            }
        }
        executor.stop(&log);

        assert_eq!(100, completed);
        let stats = scheduler.stats();
        assert_eq!(100, stats.tasks_completed);
        assert!(stats.successful_steals > 0);
        assert_eq!(
            stats.successful_steals,
            stats.worker_stats.iter().map(|w| w.stolen).sum::<usize>()
        );
    }
}
