//! Watch jobs and the change detector.
//!
//! A watch is a per-chat subscription: every `interval_secs` the job's own
//! timer refreshes an adapter for its region and decides whether the chat
//! should hear about it. The decision logic ([`evaluate_tick`]) is a pure
//! function over the job's last-seen counts so it can be tested without
//! timers or network.
//!
//! Jobs survive restarts: every mutation rewrites the durable store, and
//! [`WatchService::restore`] reschedules whatever was saved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregate::SourceRegistry;
use crate::notify::ChatSink;
use crate::region::Region;
use crate::scheduler::{ScheduledTask, Scheduler, TaskHandle};
use crate::sources::{Refresh, SourceAdapter};
use crate::stats::NormalizedReading;
use crate::store::WatchStore;

/// Floor for watch intervals; anything tighter hammers the upstreams for
/// data that updates a few times a day.
pub const MIN_INTERVAL_SECS: u64 = 60;

/// One persistent subscription. `last_seen` doubles as the change-detector
/// state: `None` means no reading has ever been reported (awaiting first
/// sighting), `Some` means the job is tracking deltas against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchJob {
    pub chat_id: String,
    pub region: Region,
    pub interval_secs: u64,
    pub only_report_increase: bool,
    #[serde(default)]
    pub last_seen: Option<[u64; 3]>,
}

impl WatchJob {
    pub fn new(
        chat_id: impl Into<String>,
        region: Region,
        interval_secs: u64,
        only_report_increase: bool,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            region,
            interval_secs,
            only_report_increase,
            last_seen: None,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.last_seen.is_some()
    }
}

/// Applies one refresh outcome to the job's detector state and says
/// whether to notify the chat.
///
/// Rules, in order: an empty reading never notifies and never transitions;
/// the first real reading always notifies; after that, `only_report_increase`
/// jobs notify only when some category strictly exceeds the last reported
/// value (a downward correction is suppressed and logged), while
/// unfiltered jobs notify whenever the publisher shipped a new payload
/// version. Whenever a notification fires, the reading becomes the new
/// last-seen.
pub fn evaluate_tick(job: &mut WatchJob, refresh: Refresh, reading: &NormalizedReading) -> bool {
    if !reading.has_data() {
        return false;
    }
    let counts = reading.counts();
    let Some(last) = job.last_seen else {
        job.last_seen = Some(counts);
        return true;
    };

    let notify = if job.only_report_increase {
        let increased = counts.iter().zip(last).any(|(new, old)| *new > old);
        if !increased && counts.iter().zip(last).any(|(new, old)| *new < old) {
            warn!(
                chat = %job.chat_id,
                region = %job.region,
                last = ?last,
                now = ?counts,
                "counts revised downward; suppressing notification"
            );
        }
        increased
    } else {
        refresh.is_fresh()
    };

    if notify {
        job.last_seen = Some(counts);
    }
    notify
}

struct WatchEntry {
    job: WatchJob,
    handle: TaskHandle,
}

type JobMap = Arc<Mutex<HashMap<String, WatchEntry>>>;

/// Owns every live watch: jobs map, their timers, and persistence.
pub struct WatchService {
    registry: Arc<SourceRegistry>,
    store: Arc<dyn WatchStore>,
    sink: Arc<dyn ChatSink>,
    scheduler: Arc<dyn Scheduler>,
    jobs: JobMap,
}

impl WatchService {
    pub fn new(
        registry: Arc<SourceRegistry>,
        store: Arc<dyn WatchStore>,
        sink: Arc<dyn ChatSink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            registry,
            store,
            sink,
            scheduler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates (or replaces) the watch for `chat_id` and persists the new
    /// job set. One watch per chat; watching again moves it.
    pub async fn watch(
        &self,
        chat_id: &str,
        region: Region,
        interval_secs: u64,
        only_report_increase: bool,
    ) -> Result<()> {
        if interval_secs < MIN_INTERVAL_SECS {
            bail!("watch interval must be at least {MIN_INTERVAL_SECS} seconds");
        }
        let job = WatchJob::new(chat_id, region, interval_secs, only_report_increase);
        self.schedule_job(job)?;
        self.persist().await;
        Ok(())
    }

    /// Cancels the chat's watch timer synchronously and forgets the job.
    /// Returns false when there was nothing to unwatch.
    pub async fn unwatch(&self, chat_id: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .expect("watch jobs lock poisoned")
            .remove(chat_id);
        let Some(entry) = removed else {
            return false;
        };
        self.scheduler.cancel(entry.handle);
        info!(chat = chat_id, region = %entry.job.region, "watch removed");
        self.persist().await;
        true
    }

    /// Reschedules every job the store knows about; called once at startup.
    pub async fn restore(&self) -> usize {
        let jobs = match self.store.load().await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(error = ?error, "watch store unreadable; starting with no jobs");
                return 0;
            }
        };
        let mut restored = 0usize;
        for job in jobs {
            let chat = job.chat_id.clone();
            match self.schedule_job(job) {
                Ok(()) => restored += 1,
                Err(error) => warn!(chat, error = ?error, "could not restore watch"),
            }
        }
        info!(restored, "watch jobs restored");
        restored
    }

    /// Snapshot of every live job, ordered by chat id.
    pub fn jobs(&self) -> Vec<WatchJob> {
        let map = self.jobs.lock().expect("watch jobs lock poisoned");
        let mut jobs: Vec<WatchJob> = map.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        jobs
    }

    pub fn watched(&self, chat_id: &str) -> Option<WatchJob> {
        self.jobs
            .lock()
            .expect("watch jobs lock poisoned")
            .get(chat_id)
            .map(|e| e.job.clone())
    }

    fn schedule_job(&self, job: WatchJob) -> Result<()> {
        let Some(adapter) = self.registry.primary_for(&job.region) else {
            bail!("no sources configured");
        };
        let tick = WatchTick {
            chat_id: job.chat_id.clone(),
            adapter,
            jobs: Arc::clone(&self.jobs),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
        };
        let handle = self
            .scheduler
            .schedule(Duration::from_secs(job.interval_secs), Box::new(tick));

        let mut map = self.jobs.lock().expect("watch jobs lock poisoned");
        if let Some(previous) = map.insert(job.chat_id.clone(), WatchEntry { job, handle }) {
            self.scheduler.cancel(previous.handle);
        }
        Ok(())
    }

    async fn persist(&self) {
        let jobs = self.jobs();
        if let Err(error) = self.store.save(&jobs).await {
            warn!(error = ?error, "persisting watch jobs failed");
        }
    }
}

/// The repeating body of one watch job. Owns its adapter, so the version
/// marker tracks what *this* job has reported, independent of chat
/// requests and other jobs over the same publisher.
struct WatchTick {
    chat_id: String,
    adapter: Box<dyn SourceAdapter>,
    jobs: JobMap,
    store: Arc<dyn WatchStore>,
    sink: Arc<dyn ChatSink>,
}

#[async_trait]
impl ScheduledTask for WatchTick {
    async fn run(&mut self) {
        let refresh = self.adapter.refresh().await;
        let reading = self.adapter.reading().clone();

        let notify = {
            let mut map = self.jobs.lock().expect("watch jobs lock poisoned");
            // Unwatched between fire and lock; nothing to do.
            let Some(entry) = map.get_mut(&self.chat_id) else {
                return;
            };
            evaluate_tick(&mut entry.job, refresh, &reading)
        };
        if !notify {
            return;
        }

        match self.sink.send_text(&self.chat_id, &reading.describe()).await {
            Ok(()) => counter!("watch_notifications_total").increment(1),
            Err(error) => {
                warn!(chat = %self.chat_id, error = ?error, "notification delivery failed")
            }
        }

        let jobs = {
            let map = self.jobs.lock().expect("watch jobs lock poisoned");
            let mut jobs: Vec<WatchJob> = map.values().map(|e| e.job.clone()).collect();
            jobs.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
            jobs
        };
        if let Err(error) = self.store.save(&jobs).await {
            warn!(chat = %self.chat_id, error = ?error, "persisting watch jobs failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use crate::store::MemoryStore;
    use parking_lot::Mutex as PlMutex;

    struct RecordingChat {
        sent: PlMutex<Vec<(String, String)>>,
    }

    impl RecordingChat {
        fn new() -> Self {
            Self {
                sent: PlMutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl ChatSink for RecordingChat {
        async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent.lock().push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Scheduler the tests drive by hand: tasks run only on `fire_all`.
    struct ManualScheduler {
        next_id: std::sync::atomic::AtomicU64,
        tasks: tokio::sync::Mutex<HashMap<u64, Box<dyn ScheduledTask>>>,
        cancelled: PlMutex<Vec<u64>>,
        pending: PlMutex<Vec<(u64, Box<dyn ScheduledTask>)>>,
    }

    impl ManualScheduler {
        fn new() -> Self {
            Self {
                next_id: std::sync::atomic::AtomicU64::new(1),
                tasks: tokio::sync::Mutex::new(HashMap::new()),
                cancelled: PlMutex::new(Vec::new()),
                pending: PlMutex::new(Vec::new()),
            }
        }

        /// Moves freshly scheduled tasks in and runs every live task once.
        async fn fire_all(&self) {
            let mut tasks = self.tasks.lock().await;
            for (id, task) in self.pending.lock().drain(..) {
                tasks.insert(id, task);
            }
            let dead: Vec<u64> = self.cancelled.lock().clone();
            tasks.retain(|id, _| !dead.contains(id));
            for task in tasks.values_mut() {
                task.run().await;
            }
        }

        fn cancelled_count(&self) -> usize {
            self.cancelled.lock().len()
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, _interval: Duration, task: Box<dyn ScheduledTask>) -> TaskHandle {
            let id = self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.pending.lock().push((id, task));
            TaskHandle::new(id)
        }

        fn cancel(&self, handle: TaskHandle) {
            self.cancelled.lock().push(handle.id());
        }
    }

    fn ministry_payload(confirmed: &str) -> crate::sources::gov_br::GovBrPayload {
        serde_json::from_str(&format!(
            r#"{{"br": [{{"total_confirmado": "{confirmed}", "total_obitos": "5",
                "updatedAt": "2020-04-05T22:25:51.000Z"}}], "states": []}}"#
        ))
        .unwrap()
    }

    struct Fixture {
        registry: Arc<SourceRegistry>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingChat>,
        scheduler: Arc<ManualScheduler>,
        service: WatchService,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SourceRegistry::new(vec![SourceKind::GovBr], None));
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingChat::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let service = WatchService::new(
            Arc::clone(&registry),
            store.clone() as Arc<dyn WatchStore>,
            sink.clone() as Arc<dyn ChatSink>,
            scheduler.clone() as Arc<dyn Scheduler>,
        );
        Fixture {
            registry,
            store,
            sink,
            scheduler,
            service,
        }
    }

    #[tokio::test]
    async fn first_sighting_notifies_then_unchanged_stays_quiet() {
        let f = fixture();
        f.registry.caches().gov_br.install(ministry_payload("1.000"));
        f.service
            .watch("chat-1", Region::Country, 3600, true)
            .await
            .unwrap();

        f.scheduler.fire_all().await;
        assert_eq!(f.sink.count(), 1);
        // The mutation was persisted.
        let saved = f.store.load().await.unwrap();
        assert_eq!(saved[0].last_seen, Some([1000, 5, 0]));

        f.scheduler.fire_all().await;
        assert_eq!(f.sink.count(), 1);
    }

    #[tokio::test]
    async fn growing_counts_notify_again() {
        let f = fixture();
        f.registry.caches().gov_br.install(ministry_payload("1.000"));
        f.service
            .watch("chat-1", Region::Country, 3600, true)
            .await
            .unwrap();
        f.scheduler.fire_all().await;

        f.registry.caches().gov_br.install(ministry_payload("1.250"));
        f.scheduler.fire_all().await;
        assert_eq!(f.sink.count(), 2);
        let saved = f.store.load().await.unwrap();
        assert_eq!(saved[0].last_seen, Some([1250, 5, 0]));
    }

    #[tokio::test]
    async fn unwatch_cancels_synchronously_and_persists_removal() {
        let f = fixture();
        f.registry.caches().gov_br.install(ministry_payload("1.000"));
        f.service
            .watch("chat-1", Region::Country, 3600, true)
            .await
            .unwrap();

        assert!(f.service.unwatch("chat-1").await);
        assert_eq!(f.scheduler.cancelled_count(), 1);
        assert!(f.service.jobs().is_empty());
        assert!(f.store.load().await.unwrap().is_empty());

        f.scheduler.fire_all().await;
        assert_eq!(f.sink.count(), 0);

        assert!(!f.service.unwatch("chat-1").await);
    }

    #[tokio::test]
    async fn watching_again_replaces_the_previous_job() {
        let f = fixture();
        f.registry.caches().gov_br.install(ministry_payload("1.000"));
        f.service
            .watch("chat-1", Region::Country, 3600, true)
            .await
            .unwrap();
        f.service
            .watch("chat-1", Region::state("RJ"), 7200, false)
            .await
            .unwrap();

        let jobs = f.service.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].region, Region::state("RJ"));
        assert_eq!(jobs[0].interval_secs, 7200);
        assert_eq!(f.scheduler.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn restore_reschedules_and_keeps_detector_state() {
        let f = fixture();
        f.registry.caches().gov_br.install(ministry_payload("1.000"));
        f.store
            .save(&[WatchJob {
                chat_id: "chat-1".into(),
                region: Region::Country,
                interval_secs: 3600,
                only_report_increase: true,
                last_seen: Some([900, 5, 0]),
            }])
            .await
            .unwrap();

        assert_eq!(f.service.restore().await, 1);
        f.scheduler.fire_all().await;
        // 1000 > 900, so the restored job notifies without re-reporting a
        // first sighting.
        assert_eq!(f.sink.count(), 1);
    }

    #[tokio::test]
    async fn intervals_below_the_floor_are_rejected() {
        let f = fixture();
        let err = f
            .service
            .watch("chat-1", Region::Country, 30, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least 60 seconds"));
        assert!(f.service.jobs().is_empty());
    }
}
