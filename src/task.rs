use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use once_cell::sync::Lazy;

/// Runs deferred and repeating jobs on a shared daemon thread.
///
/// Jobs on one runner execute strictly one at a time, which the pool relies
/// on to serialize its cleanup passes. A job returns the delay until it
/// wants to run again, or `None` to stop.
///
/// Everything that needs scheduling takes a runner as a dependency;
/// [`TaskRunner::global`] is only the convenient default.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    jobs: Vec<Job>,
    worker_started: bool,
}

struct Job {
    due: Instant,
    task: Arc<Task>,
}

struct Task {
    name: &'static str,
    canceled: AtomicBool,
    run: Mutex<Box<dyn FnMut() -> Option<Duration> + Send>>,
}

/// A handle to a scheduled job. Dropping the handle does not cancel it.
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    /// Prevent any further runs of the job. Idempotent.
    pub fn cancel(&self) {
        self.task.canceled.store(true, Ordering::Release);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.task.name)
            .finish()
    }
}

static GLOBAL: Lazy<TaskRunner> = Lazy::new(TaskRunner::new);

impl TaskRunner {
    /// A runner with its own worker thread.
    pub fn new() -> TaskRunner {
        TaskRunner {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    jobs: Vec::new(),
                    worker_started: false,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// The process-wide default runner.
    pub fn global() -> &'static TaskRunner {
        &GLOBAL
    }

    /// Schedule `f` to run after `delay`. The job reschedules itself by
    /// returning the next delay.
    pub fn schedule<F>(&self, name: &'static str, delay: Duration, f: F) -> TaskHandle
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let task = Arc::new(Task {
            name,
            canceled: AtomicBool::new(false),
            run: Mutex::new(Box::new(f)),
        });

        let mut state = self.inner.state.lock().unwrap();
        state.jobs.push(Job {
            due: Instant::now() + delay,
            task: task.clone(),
        });
        if !state.worker_started {
            state.worker_started = true;
            let inner = self.inner.clone();
            thread::Builder::new()
                .name("carrier TaskRunner".into())
                .spawn(move || worker(inner))
                .expect("failed to spawn task runner thread");
        }
        drop(state);
        self.inner.condvar.notify_one();

        TaskHandle { task }
    }
}

impl Default for TaskRunner {
    fn default() -> TaskRunner {
        TaskRunner::new()
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("TaskRunner")
            .field("jobs", &state.jobs.len())
            .finish()
    }
}

fn worker(inner: Arc<Inner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        // Drop canceled jobs eagerly so they don't delay the wakeup math.
        state
            .jobs
            .retain(|job| !job.task.canceled.load(Ordering::Acquire));

        let now = Instant::now();
        let next_due = match state.jobs.iter().map(|j| j.due).min() {
            Some(due) => due,
            None => {
                state = inner.condvar.wait(state).unwrap();
                continue;
            }
        };

        if next_due > now {
            let (s, _timeout) = inner
                .condvar
                .wait_timeout(state, next_due - now)
                .unwrap();
            state = s;
            continue;
        }

        let index = state
            .jobs
            .iter()
            .position(|j| j.due == next_due)
            .expect("job present");
        let job = state.jobs.swap_remove(index);
        drop(state);

        trace!("task runner running {:?}", job.task.name);
        let next_delay = (job.task.run.lock().unwrap())();

        state = inner.state.lock().unwrap();
        if let Some(delay) = next_delay {
            if !job.task.canceled.load(Ordering::Acquire) {
                state.jobs.push(Job {
                    due: Instant::now() + delay,
                    task: job.task,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_scheduled_job() {
        let runner = TaskRunner::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        runner.schedule("test once", Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
            None
        });
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rescheduling_job_runs_repeatedly() {
        let runner = TaskRunner::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        runner.schedule("test repeat", Duration::from_millis(5), move || {
            let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Some(Duration::from_millis(5))
            } else {
                None
            }
        });
        thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn canceled_job_never_runs() {
        let runner = TaskRunner::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let handle = runner.schedule("test cancel", Duration::from_millis(50), move || {
            counted.fetch_add(1, Ordering::SeqCst);
            None
        });
        handle.cancel();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
