//! Shared periodic-timer facility and engine clock
//!
//! Deferred work in the engine (cross-point subscription retries, calendar
//! pulses, timed recalculation) is registered here as a repeating task
//! instead of each stage spawning its own thread.
//!
//! # Architecture
//!
//! - [`Clock`] abstracts "now" so tests can drive time by hand ([`ManualClock`])
//!   while the daemon uses [`SystemClock`].
//! - [`TimerService`] keeps a list of tasks with their next due instant.
//!   [`TimerService::run_due`] runs every due task once and reschedules it.
//! - The daemon calls `run_due` from a tokio interval (see `collector`),
//!   tests call it directly with a chosen instant.
//!
//! Tasks run *without* the task list locked, so a task may schedule or
//! cancel other tasks.

use crate::types::{Period, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// Hand-driven clock for deterministic tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: Timestamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = t;
    }

    pub fn advance(&self, by: Period) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// What a task wants after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Handle returned by [`TimerService::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

type TaskFn = Box<dyn FnMut(Timestamp) -> TaskControl + Send>;

struct TimerTask {
    id: TaskId,
    name: String,
    period: Period,
    next_due: Timestamp,
    action: TaskFn,
}

/// Repeating task scheduler shared by every point in an engine
pub struct TimerService {
    tasks: Mutex<Vec<TimerTask>>,
    /// Ids cancelled while their task was out of the list being run
    cancelled: Mutex<Vec<TaskId>>,
    next_id: AtomicU64,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a repeating task. It first runs at `first_due`, then every `period`.
    pub fn schedule<F>(
        &self,
        name: impl Into<String>,
        first_due: Timestamp,
        period: Period,
        action: F,
    ) -> TaskId
    where
        F: FnMut(Timestamp) -> TaskControl + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        tracing::trace!("Scheduling timer task {} ({:?}) every {}", name, id, period);
        self.lock_tasks().push(TimerTask {
            id,
            name,
            period,
            next_due: first_due,
            action: Box::new(action),
        });
        id
    }

    /// Remove a task. Cancelling an unknown id is a no-op.
    pub fn cancel(&self, id: TaskId) {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            // Possibly running right now; drop it when it comes back
            self.cancelled
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(id);
        }
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest due instant over all tasks
    pub fn next_due(&self) -> Option<Timestamp> {
        self.lock_tasks().iter().map(|t| t.next_due).min()
    }

    /// Run every task whose due time is at or before `now`. Returns how many ran.
    pub fn run_due(&self, now: Timestamp) -> usize {
        let mut due = {
            let mut tasks = self.lock_tasks();
            let mut due = Vec::new();
            let mut i = 0;
            while i < tasks.len() {
                if tasks[i].next_due <= now {
                    due.push(tasks.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        // Keep a stable order between tasks that fall due together
        due.sort_by_key(|t| (t.next_due, t.id.0));

        let ran = due.len();
        let mut keep = Vec::with_capacity(due.len());
        for mut task in due {
            let control = (task.action)(now);
            if control == TaskControl::Stop {
                tracing::trace!("Timer task {} finished", task.name);
                continue;
            }
            task.next_due += task.period;
            if task.next_due <= now {
                // Fell behind; skip the missed ticks rather than bursting
                task.next_due = now + task.period;
            }
            keep.push(task);
        }

        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        if !cancelled.is_empty() {
            keep.retain(|t| !cancelled.contains(&t.id));
            cancelled.clear();
        }
        drop(cancelled);

        self.lock_tasks().extend(keep);
        ran
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<TimerTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("tasks", &self.len())
            .finish()
    }
}
