//! Tick-driven task scheduling and a worker pool for blocking work.
//!
//! Scheduled tasks run on the tick thread. Work submitted to the
//! [`AsyncPool`] runs on worker threads; its completion callback runs on
//! the tick thread when [`AsyncPool::drain_completions`] is called.

use ahash::AHashMap;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

/// Cooperative cancellation flag shared with a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct ScheduledTask {
    handle: TaskHandle,
    next_run: u64,
    period: Option<u64>,
    task: Box<dyn FnMut()>,
}

#[derive(Default)]
pub struct TaskScheduler {
    current_tick: u64,
    tasks: Vec<ScheduledTask>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Runs on the next pass.
    pub fn schedule(&mut self, task: impl FnMut() + 'static) -> TaskHandle {
        self.push(0, None, Box::new(task))
    }

    pub fn schedule_delayed(&mut self, delay_ticks: u64, task: impl FnMut() + 'static) -> TaskHandle {
        self.push(delay_ticks, None, Box::new(task))
    }

    /// Runs after `delay_ticks`, then every `period_ticks` (at least 1).
    pub fn schedule_repeating(
        &mut self,
        delay_ticks: u64,
        period_ticks: u64,
        task: impl FnMut() + 'static,
    ) -> TaskHandle {
        self.push(delay_ticks, Some(period_ticks.max(1)), Box::new(task))
    }

    fn push(&mut self, delay: u64, period: Option<u64>, task: Box<dyn FnMut()>) -> TaskHandle {
        let handle = TaskHandle::default();
        self.tasks.push(ScheduledTask {
            handle: handle.clone(),
            next_run: self.current_tick + delay,
            period,
            task,
        });
        handle
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Advances one tick, running due tasks and dropping finished or
    /// cancelled ones.
    pub fn tick(&mut self) {
        let now = self.current_tick;
        self.tasks.retain_mut(|task| {
            if task.handle.is_cancelled() {
                return false;
            }
            if task.next_run > now {
                return true;
            }
            if panic::catch_unwind(AssertUnwindSafe(&mut task.task)).is_err() {
                tracing::error!("Scheduled task panicked");
            }
            match task.period {
                Some(period) if !task.handle.is_cancelled() => {
                    task.next_run = now + period;
                    true
                }
                _ => false,
            }
        });
        self.current_tick += 1;
    }
}

type Job = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;
type Completion = Box<dyn FnOnce(Box<dyn Any + Send>)>;

/// Fixed set of worker threads.
pub struct AsyncPool {
    jobs: Option<flume::Sender<(u64, Job)>>,
    completions: flume::Receiver<(u64, thread::Result<Box<dyn Any + Send>>)>,
    callbacks: AHashMap<u64, Completion>,
    next_id: u64,
    workers: Vec<thread::JoinHandle<()>>,
}

impl AsyncPool {
    pub fn new(workers: usize) -> Self {
        let (jobs_tx, jobs_rx) = flume::unbounded::<(u64, Job)>();
        let (done_tx, done_rx) = flume::unbounded();
        let workers = (0..workers.max(1))
            .map(|index| {
                let jobs = jobs_rx.clone();
                let done = done_tx.clone();
                thread::Builder::new()
                    .name(format!("aquarelay-worker-{index}"))
                    .spawn(move || {
                        for (id, job) in jobs.iter() {
                            let result = panic::catch_unwind(AssertUnwindSafe(job));
                            if done.send((id, result)).is_err() {
                                break;
                            }
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!("Failed to spawn worker thread: {e}");
                    None
                }
            })
            .collect();
        Self {
            jobs: Some(jobs_tx),
            completions: done_rx,
            callbacks: AHashMap::new(),
            next_id: 0,
            workers,
        }
    }

    /// Runs `work` on a worker; `on_complete` gets its result on the tick
    /// thread.
    pub fn submit<T: Send + 'static>(
        &mut self,
        work: impl FnOnce() -> T + Send + 'static,
        on_complete: impl FnOnce(T) + 'static,
    ) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        let id = self.next_id;
        self.next_id += 1;
        let job: Job = Box::new(move || Box::new(work()) as Box<dyn Any + Send>);
        if jobs.send((id, job)).is_err() {
            tracing::warn!("Async pool is shut down, dropping task");
            return;
        }
        self.callbacks.insert(
            id,
            Box::new(move |result: Box<dyn Any + Send>| {
                if let Ok(value) = result.downcast::<T>() {
                    on_complete(*value);
                }
            }),
        );
    }

    pub fn in_flight(&self) -> usize {
        self.callbacks.len()
    }

    /// Runs the callbacks of finished work without blocking.
    pub fn drain_completions(&mut self) -> usize {
        let mut completed = 0;
        for (id, result) in self.completions.try_iter() {
            let Some(callback) = self.callbacks.remove(&id) else {
                continue;
            };
            completed += 1;
            match result {
                Ok(value) => callback(value),
                Err(_) => tracing::error!("Async task {id} panicked"),
            }
        }
        completed
    }

    /// Stops accepting work and joins the workers once the queue is empty.
    pub fn shutdown(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc, time::Duration};

    #[test]
    fn delayed_and_repeating_tasks() {
        let mut scheduler = TaskScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        scheduler.schedule(move || l.borrow_mut().push("now"));
        let l = log.clone();
        scheduler.schedule_delayed(2, move || l.borrow_mut().push("delayed"));
        let l = log.clone();
        let repeating = scheduler.schedule_repeating(1, 2, move || l.borrow_mut().push("repeat"));

        for _ in 0..6 {
            scheduler.tick();
        }
        // tick 0: now; 1: repeat; 2: delayed; 3: repeat; 5: repeat
        assert_eq!(
            *log.borrow(),
            ["now", "repeat", "delayed", "repeat", "repeat"]
        );
        assert_eq!(scheduler.pending(), 1);

        repeating.cancel();
        scheduler.tick();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn panicking_task_keeps_schedule() {
        let mut scheduler = TaskScheduler::new();
        scheduler.schedule_repeating(0, 1, || panic!("task failure"));
        scheduler.tick();
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn pool_results_arrive_on_drain() {
        let mut pool = AsyncPool::new(2);
        let results = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4u32 {
            let results = results.clone();
            pool.submit(move || i * 10, move |value| results.borrow_mut().push(value));
        }

        let mut drained = 0;
        for _ in 0..200 {
            drained += pool.drain_completions();
            if drained == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let mut results = results.borrow().clone();
        results.sort_unstable();
        assert_eq!(results, [0, 10, 20, 30]);
        assert_eq!(pool.in_flight(), 0);
    }
}
