//! Repeating-task seam.
//!
//! Every watch job runs on its own timer, plus one system-wide timer that
//! reloads all publisher caches. The watch service consumes this trait
//! instead of spawning directly, so tests can drive ticks by hand and
//! cancellation stays synchronous.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::aggregate::SourceRegistry;

/// A repeating unit of work; owned by the scheduler once registered.
#[async_trait]
pub trait ScheduledTask: Send + 'static {
    async fn run(&mut self);
}

/// Opaque registration id; only meaningful to the scheduler that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Mints a handle; id allocation is the issuing scheduler's concern.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

pub trait Scheduler: Send + Sync {
    /// Runs `task` every `interval` until cancelled. The first run fires a
    /// full interval after registration, not immediately.
    fn schedule(&self, interval: Duration, task: Box<dyn ScheduledTask>) -> TaskHandle;

    /// Stops the task synchronously. Unknown handles are a no-op.
    fn cancel(&self, handle: TaskHandle);
}

/// Production scheduler: one tokio task per registration, aborted on
/// cancel. Slow ticks skip rather than burst when they overrun.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, mut task: Box<dyn ScheduledTask>) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval yields once immediately; swallow it so the first
            // real run lands one interval out.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                task.run().await;
            }
        });
        self.tasks
            .lock()
            .expect("scheduler tasks lock poisoned")
            .insert(id, join);
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) {
        let join = self
            .tasks
            .lock()
            .expect("scheduler tasks lock poisoned")
            .remove(&handle.0);
        if let Some(join) = join {
            join.abort();
            debug!(handle = handle.0, "scheduled task cancelled");
        }
    }
}

/// System-wide cache reload pass; keeps every publisher warm so chat
/// requests rarely pay a fetch.
pub struct ReloadTask {
    registry: Arc<SourceRegistry>,
}

impl ReloadTask {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ScheduledTask for ReloadTask {
    async fn run(&mut self) {
        self.registry.reload_all().await;
    }
}
