//! Named periodic tasks driven by one dispatch loop.
//!
//! A pipeline registers its recurring concerns (poll, disputes, cleanups,
//! sweeps) as [`PeriodicTask`]s on a [`Scheduler`]. The loop sleeps until the
//! earliest deadline and spawns every due task; it never runs a task body
//! inline. A firing is skipped while the previous firing of the same task is
//! still running. Errors and panics are logged per task and never stop the
//! loop or the other tasks.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Shortest period a task may run on; shorter periods are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

type TaskBody = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    run_at_startup: bool,
    body: TaskBody,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: &'static str, period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if period < MIN_PERIOD {
            warn!(task = name, ?period, min = ?MIN_PERIOD, "Task period too short, clamping");
        }
        Self {
            name,
            period: period.max(MIN_PERIOD),
            run_at_startup: false,
            body: Arc::new(move || body().boxed()),
        }
    }

    /// Fire once as soon as the scheduler starts, then on the period.
    pub fn run_at_startup(mut self) -> Self {
        self.run_at_startup = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

struct Slot {
    task: PeriodicTask,
    next: Instant,
    running: Arc<AtomicBool>,
}

pub struct Scheduler {
    name: &'static str,
    tasks: Vec<PeriodicTask>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Vec::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn register(mut self, task: PeriodicTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    /// Run until `shutdown` is cancelled, then wait for firings in progress.
    pub async fn run(self, shutdown: CancellationToken) {
        let start = Instant::now();
        let mut slots: Vec<Slot> = self
            .tasks
            .into_iter()
            .map(|task| Slot {
                next: if task.run_at_startup {
                    start
                } else {
                    start + task.period
                },
                task,
                running: Arc::new(AtomicBool::new(false)),
            })
            .collect();

        info!(
            scheduler = self.name,
            tasks = ?slots.iter().map(|s| s.task.name).collect::<Vec<_>>(),
            "Scheduler started"
        );

        loop {
            let Some(next) = slots.iter().map(|s| s.next).min() else {
                shutdown.cancelled().await;
                break;
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let now = Instant::now();
            for slot in slots.iter_mut().filter(|s| s.next <= now) {
                slot.next = now + slot.task.period;
                fire(self.name, slot, &self.tracker);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(scheduler = self.name, "Scheduler stopped");
    }
}

fn fire(scheduler: &'static str, slot: &Slot, tracker: &TaskTracker) {
    let task = slot.task.name;
    if slot.running.swap(true, Ordering::SeqCst) {
        debug!(scheduler, task, "Previous run still in progress, skipping tick");
        return;
    }

    let running = slot.running.clone();
    let body = slot.task.body.clone();
    tracker.spawn(async move {
        let result = catch_panic(async move { body().await }).await;
        running.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(scheduler, task, error = %e, "Periodic task failed");
        }
    });
}

/// Await a fallible future, turning a panic inside it into an error.
pub async fn catch_panic<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "Task panicked");
            Err(anyhow!("task panicked: {message}"))
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
