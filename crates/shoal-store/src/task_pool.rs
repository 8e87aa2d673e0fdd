//! Shared pool of named background tasks.
//!
//! Controllers schedule their download loops here instead of spawning one
//! thread per cached file. Jobs are cooperative: each receives a
//! cancellation flag and is expected to poll it between batches.
//! [`TaskHandle::deactivate`] flips the flag and joins the job
//! synchronously; a job the workers have not picked up yet is skipped
//! entirely.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error};

use crate::{Result, StoreError};

/// Tasks in flight before `schedule` applies backpressure.
const QUEUE_CAPACITY: usize = 256;

type Job = Box<dyn FnOnce(&AtomicBool) + Send>;

struct Task {
    name: String,
    job: Job,
    control: Arc<TaskControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Finished,
}

#[derive(Debug)]
struct TaskControl {
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::Pending),
            finished: Condvar::new(),
        }
    }

    fn deactivate(&self) {
        self.cancelled.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Pending {
            // Never started; the worker that eventually pops it will skip.
            *state = TaskState::Finished;
            return;
        }
        while *state != TaskState::Finished {
            state = self.finished.wait(state).unwrap();
        }
    }

    fn is_finished(&self) -> bool {
        *self.state.lock().unwrap() == TaskState::Finished
    }
}

/// Handle to one scheduled task.
pub struct TaskHandle {
    control: Arc<TaskControl>,
}

impl TaskHandle {
    /// Cancel the task cooperatively and wait for it to leave the pool.
    pub fn deactivate(self) {
        self.control.deactivate();
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }
}

/// Fixed set of worker threads consuming named jobs from a bounded queue.
pub struct TaskPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn `threads` workers (None = one per CPU).
    pub fn new(name: &str, threads: Option<usize>) -> Self {
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        let (tx, rx) = bounded::<Task>(QUEUE_CAPACITY);

        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(rx))
                    .expect("Failed to spawn task pool worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Queue a named job; blocks when the queue is full.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        job: impl FnOnce(&AtomicBool) + Send + 'static,
    ) -> Result<TaskHandle> {
        let control = Arc::new(TaskControl::new());
        let task = Task {
            name: name.into(),
            job: Box::new(job),
            control: Arc::clone(&control),
        };
        self.tx
            .as_ref()
            .ok_or_else(|| StoreError::Logical("task pool is shut down".to_string()))?
            .send(task)
            .map_err(|_| StoreError::Logical("task pool is shut down".to_string()))?;
        Ok(TaskHandle { control })
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain the queue and exit.
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        {
            let mut state = task.control.state.lock().unwrap();
            if *state == TaskState::Finished {
                // Deactivated before any worker picked it up.
                continue;
            }
            *state = TaskState::Running;
        }
        debug!(task = %task.name, "background task started");

        let control = Arc::clone(&task.control);
        let name = task.name;
        let job = task.job;
        if panic::catch_unwind(AssertUnwindSafe(|| job(&control.cancelled))).is_err() {
            error!(task = %name, "background task panicked");
        }

        let mut state = control.state.lock().unwrap();
        *state = TaskState::Finished;
        drop(state);
        control.finished.notify_all();
        debug!(task = %name, "background task finished");
    }
}
