//! Tag buffer and debounce scheduler.
//!
//! ## Lifecycle of a window
//!
//! ```text
//! add(["a"]) ──► pending = {a}, window 1 armed (deadline = now + delay)
//! add(["b"]) ──► pending = {a, b}, window 1 unchanged
//!    ...delay elapses...
//! timer      ──► drain {a, b} + disarm (one critical section)
//!            ──► sweep {a, b} over every backend (lock released)
//! add(["c"]) ──► pending = {c}, window 2 armed
//! ```
//!
//! The pending set and the armed window live behind one mutex so that
//! "insert tags" and "is a timer armed" are a single atomic step. The sweep
//! itself runs without that lock; `add` never waits for backend I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::BackendRegistry;
use crate::sweep::{self, SweepReport, SweepTrigger};
use crate::tags::TagSet;

/// Default debounce delay.
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// How later `add` calls affect an armed window's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebouncePolicy {
    /// The first `add` of a window fixes the deadline.
    #[default]
    Fixed,
    /// Every `add` pushes the deadline out by `delay`, bounded by `max_delay`
    /// from the moment the window opened.
    Trailing,
}

impl std::fmt::Display for DebouncePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Trailing => write!(f, "trailing"),
        }
    }
}

/// Scheduler settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub delay: Duration,
    pub policy: DebouncePolicy,
    /// Upper bound on a window's lifetime under [`DebouncePolicy::Trailing`].
    pub max_delay: Duration,
    /// Capacity of the sweep report broadcast channel.
    pub report_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::with_delay(Duration::from_millis(DEFAULT_DELAY_MS))
    }
}

impl SchedulerConfig {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            policy: DebouncePolicy::Fixed,
            max_delay: delay * 10,
            report_capacity: 64,
        }
    }

    pub fn with_policy(mut self, policy: DebouncePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.delay);
        self
    }
}

/// Result of a single `add` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// Tags supplied by the caller.
    pub accepted: usize,
    /// Tags that were not already pending.
    pub added: usize,
    /// Whether this call opened a new window.
    pub armed: bool,
    /// Window the tags were merged into.
    pub window: Option<u64>,
    /// When that window is due to fire.
    pub deadline: Option<Instant>,
}

/// Point-in-time view of the scheduler, for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub delay_ms: u64,
    pub policy: DebouncePolicy,
    pub backends: Vec<String>,
    pub pending_tags: Vec<String>,
    pub armed_window: Option<u64>,
    pub fires_in_ms: Option<u64>,
    pub completed_sweeps: u64,
    pub last_sweep: Option<SweepReport>,
}

struct ArmedWindow {
    id: u64,
    opened_at: Instant,
    deadline: Instant,
    // Dropping the handle detaches the task; windows are never aborted.
    _task: JoinHandle<()>,
}

struct State {
    pending: TagSet,
    armed: Option<ArmedWindow>,
    next_window: u64,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<BackendRegistry>,
    state: Mutex<State>,
    // Serialises sweeps from consecutive windows.
    sweep_gate: tokio::sync::Mutex<()>,
    reports: broadcast::Sender<Arc<SweepReport>>,
    completed: AtomicU64,
    last_report: Mutex<Option<Arc<SweepReport>>>,
}

/// Coalesces tag invalidation requests into debounced sweeps.
///
/// Cheap to clone; every clone shares the same buffer and timer. Construct one
/// per process during startup and hand clones to request handlers.
///
/// `add` spawns the window timer with `tokio::spawn`, so it must be called
/// from within a Tokio runtime.
#[derive(Clone)]
pub struct InvalidationScheduler {
    inner: Arc<Inner>,
}

impl InvalidationScheduler {
    pub fn new(registry: Arc<BackendRegistry>, config: SchedulerConfig) -> Self {
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                state: Mutex::new(State {
                    pending: TagSet::new(),
                    armed: None,
                    next_window: 1,
                }),
                sweep_gate: tokio::sync::Mutex::new(()),
                reports,
                completed: AtomicU64::new(0),
                last_report: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.inner.registry
    }

    /// Queue tags for invalidation.
    ///
    /// Opens a window if none is armed; otherwise merges into the armed one.
    /// An empty `tags` is a no-op and never arms a timer.
    pub fn add<I, S>(&self, tags: I) -> AddOutcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return AddOutcome::default();
        }

        let accepted = tags.len();
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let added = state.pending.extend(tags);

        if let Some(window) = state.armed.as_mut() {
            if self.inner.config.policy == DebouncePolicy::Trailing {
                let cap = window.opened_at + self.inner.config.max_delay;
                window.deadline = window.deadline.max((now + self.inner.config.delay).min(cap));
            }
            debug!(window = window.id, added, "tags merged into armed invalidation window");
            return AddOutcome {
                accepted,
                added,
                armed: false,
                window: Some(window.id),
                deadline: Some(window.deadline),
            };
        }

        let id = state.next_window;
        state.next_window += 1;
        let deadline = now + self.inner.config.delay;
        let task = tokio::spawn(run_window(Arc::clone(&self.inner), id, deadline));
        state.armed = Some(ArmedWindow {
            id,
            opened_at: now,
            deadline,
            _task: task,
        });

        debug!(
            window = id,
            added,
            delay_ms = self.inner.config.delay.as_millis() as u64,
            "invalidation window armed"
        );

        AddOutcome {
            accepted,
            added,
            armed: true,
            window: Some(id),
            deadline: Some(deadline),
        }
    }

    /// Sweep everything pending right now instead of waiting for the timer.
    ///
    /// The armed window, if any, is consumed; its timer wakes to find nothing
    /// to do. Returns `None` when nothing was pending or no backend is
    /// registered.
    pub async fn flush(&self) -> Option<Arc<SweepReport>> {
        let (window, tags) = {
            let mut state = self.inner.state.lock();
            if state.pending.is_empty() {
                state.armed = None;
                return None;
            }
            let window = match state.armed.take() {
                Some(armed) => armed.id,
                None => {
                    let id = state.next_window;
                    state.next_window += 1;
                    id
                }
            };
            (window, state.pending.drain())
        };

        info!(window, tags = tags.len(), "flushing pending cache tags");
        self.inner.sweep(window, SweepTrigger::Flush, tags).await
    }

    /// Receive a copy of every completed sweep report.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SweepReport>> {
        self.inner.reports.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn status(&self) -> SchedulerStatus {
        let (pending_tags, armed_window, fires_in_ms) = {
            let state = self.inner.state.lock();
            let now = Instant::now();
            (
                state.pending.to_vec(),
                state.armed.as_ref().map(|w| w.id),
                state
                    .armed
                    .as_ref()
                    .map(|w| w.deadline.saturating_duration_since(now).as_millis() as u64),
            )
        };

        SchedulerStatus {
            delay_ms: self.inner.config.delay.as_millis() as u64,
            policy: self.inner.config.policy,
            backends: self.inner.registry.names(),
            pending_tags,
            armed_window,
            fires_in_ms,
            completed_sweeps: self.inner.completed.load(Ordering::Relaxed),
            last_sweep: self.inner.last_report.lock().as_deref().cloned(),
        }
    }
}

impl Inner {
    async fn sweep(&self, window: u64, trigger: SweepTrigger, tags: TagSet) -> Option<Arc<SweepReport>> {
        if tags.is_empty() {
            return None;
        }

        let _gate = self.sweep_gate.lock().await;

        let backends = self.registry.snapshot();
        if backends.is_empty() {
            debug!(window, tags = tags.len(), "no cache backends registered; skipping sweep");
            return None;
        }

        let report = Arc::new(sweep::execute(window, trigger, tags, &backends).await);
        self.completed.fetch_add(1, Ordering::Relaxed);
        *self.last_report.lock() = Some(Arc::clone(&report));
        // No subscribers is fine.
        let _ = self.reports.send(Arc::clone(&report));
        Some(report)
    }
}

/// Timer task for one window.
///
/// Sleeps until the deadline, re-checking it in case a trailing policy moved
/// it, then drains and disarms atomically before sweeping.
async fn run_window(inner: Arc<Inner>, id: u64, mut deadline: Instant) {
    let tags = loop {
        tokio::time::sleep_until(deadline).await;

        let due = {
            let mut state = inner.state.lock();
            let current = match state.armed.as_ref() {
                Some(window) if window.id == id => window.deadline,
                // Flushed while we slept.
                _ => return,
            };
            if current > Instant::now() {
                Err(current)
            } else {
                state.armed = None;
                Ok(state.pending.drain())
            }
        };

        match due {
            Ok(tags) => break tags,
            Err(later) => deadline = later,
        }
    };

    debug!(window = id, tags = tags.len(), "invalidation window elapsed");
    inner.sweep(id, SweepTrigger::Timer, tags).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheBackend, DynBackend};
    use crate::error::BackendResult;
    use crate::item::CachedItem;
    use crate::memory::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn tagged(tags: &[&str]) -> CachedItem {
        CachedItem::new(json!("<html/>")).with_tags(tags.iter().copied())
    }

    fn scheduler_for(backends: Vec<DynBackend>, config: SchedulerConfig) -> InvalidationScheduler {
        InvalidationScheduler::new(Arc::new(BackendRegistry::from_backends(backends)), config)
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    /// Full-scan backend whose key listing takes a while.
    struct SlowBackend {
        inner: InMemoryBackend,
        listing: Duration,
    }

    #[async_trait]
    impl CacheBackend for SlowBackend {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn list_keys(&self) -> BackendResult<Vec<String>> {
            tokio::time::sleep(self.listing).await;
            self.inner.list_keys().await
        }

        async fn get_item(&self, key: &str) -> BackendResult<Option<CachedItem>> {
            self.inner.get_item(key).await
        }

        async fn delete_item(&self, key: &str) -> BackendResult<bool> {
            self.inner.delete_item(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_within_window_coalesce_into_one_sweep() {
        let backend = Arc::new(InMemoryBackend::new("pages"));
        backend.set("k1", tagged(&["t1", "t2"]), None);
        backend.set("k2", tagged(&["t3"]), None);
        let scheduler =
            scheduler_for(vec![backend.clone() as DynBackend], SchedulerConfig::with_delay(millis(2000)));
        let mut reports = scheduler.subscribe();

        let start = Instant::now();
        let first = scheduler.add(["t1"]);
        tokio::time::sleep(millis(10)).await;
        let second = scheduler.add(["t1", "t2"]);

        assert!(first.armed);
        assert!(!second.armed);
        assert_eq!(first.window, second.window);
        assert_eq!(first.deadline, second.deadline);
        assert_eq!(second.added, 1);

        let report = reports.recv().await.unwrap();
        assert_eq!(start.elapsed(), millis(2000));
        assert_eq!(report.tags, vec!["t1", "t2"]);
        assert_eq!(report.trigger, SweepTrigger::Timer);
        assert!(backend.get("k1").is_none());
        assert!(backend.get("k2").is_some());

        tokio::time::sleep(millis(10_000)).await;
        assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(scheduler.status().completed_sweeps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_spaced_beyond_delay_sweep_twice() {
        let backend = Arc::new(InMemoryBackend::new("pages"));
        let scheduler = scheduler_for(vec![backend as DynBackend], SchedulerConfig::with_delay(millis(100)));
        let mut reports = scheduler.subscribe();

        scheduler.add(["a"]);
        let first = reports.recv().await.unwrap();
        tokio::time::sleep(millis(500)).await;
        scheduler.add(["b"]);
        let second = reports.recv().await.unwrap();

        assert_eq!(first.tags, vec!["a"]);
        assert_eq!(second.tags, vec!["b"]);
        assert_eq!((first.window, second.window), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_add_is_noop() {
        let scheduler = scheduler_for(
            vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend],
            SchedulerConfig::default(),
        );

        let outcome = scheduler.add(Vec::<String>::new());

        assert_eq!(outcome, AddOutcome::default());
        let status = scheduler.status();
        assert!(status.armed_window.is_none());
        assert!(status.pending_tags.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_distinct_tag_swept_once() {
        let scheduler = scheduler_for(
            vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend],
            SchedulerConfig::with_delay(millis(50)),
        );
        let mut reports = scheduler.subscribe();

        assert_eq!(scheduler.add(["a", "a", "b"]).added, 2);
        assert_eq!(scheduler.add(["b", "a"]).added, 0);
        assert_eq!(scheduler.pending_len(), 2);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.tags, vec!["a", "b"]);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tags_added_during_sweep_go_to_next_window() {
        let slow = Arc::new(SlowBackend {
            inner: InMemoryBackend::new("slow"),
            listing: millis(500),
        });
        slow.inner.set("ka", tagged(&["a"]), None);
        slow.inner.set("kb", tagged(&["b"]), None);
        let scheduler = scheduler_for(vec![slow.clone() as DynBackend], SchedulerConfig::with_delay(millis(1000)));
        let mut reports = scheduler.subscribe();

        scheduler.add(["a"]);
        // Window 1 fires at 1000ms and is still listing keys at 1200ms.
        tokio::time::sleep(millis(1200)).await;
        let outcome = scheduler.add(["b"]);
        assert!(outcome.armed);
        assert_eq!(outcome.window, Some(2));
        assert_eq!(scheduler.status().pending_tags, vec!["b"]);

        let first = reports.recv().await.unwrap();
        let second = reports.recv().await.unwrap();
        assert_eq!(first.tags, vec!["a"]);
        assert_eq!(second.tags, vec!["b"]);
        assert!(slow.inner.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_without_backends_is_skipped() {
        let registry = Arc::new(BackendRegistry::new());
        let scheduler =
            InvalidationScheduler::new(registry.clone(), SchedulerConfig::with_delay(millis(100)));
        let mut reports = scheduler.subscribe();

        scheduler.add(["a"]);
        tokio::time::sleep(millis(500)).await;

        let status = scheduler.status();
        assert_eq!(status.completed_sweeps, 0);
        assert!(status.armed_window.is_none());
        assert!(status.pending_tags.is_empty());
        assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));

        // The scheduler keeps working once a backend shows up.
        let backend = Arc::new(InMemoryBackend::new("late"));
        backend.set("k", tagged(&["b"]), None);
        registry.register(backend.clone() as DynBackend);
        scheduler.add(["b"]);
        let report = reports.recv().await.unwrap();
        assert_eq!(report.evicted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_policy_extends_deadline_up_to_cap() {
        let config = SchedulerConfig::with_delay(millis(1000))
            .with_policy(DebouncePolicy::Trailing)
            .with_max_delay(millis(3000));
        let scheduler = scheduler_for(vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend], config);
        let mut reports = scheduler.subscribe();

        let start = Instant::now();
        for tag in ["a", "b", "c", "d"] {
            scheduler.add([tag]);
            tokio::time::sleep(millis(800)).await;
        }

        let report = reports.recv().await.unwrap();
        assert_eq!(start.elapsed(), millis(3200));
        assert_eq!(report.tags, vec!["a", "b", "c", "d"]);
        assert_eq!(report.window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_policy_fires_after_quiet_period() {
        let config =
            SchedulerConfig::with_delay(millis(1000)).with_policy(DebouncePolicy::Trailing);
        let scheduler = scheduler_for(vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend], config);
        let mut reports = scheduler.subscribe();

        let start = Instant::now();
        scheduler.add(["a"]);
        tokio::time::sleep(millis(500)).await;
        scheduler.add(["b"]);

        reports.recv().await.unwrap();
        assert_eq!(start.elapsed(), millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_consumes_armed_window() {
        let backend = Arc::new(InMemoryBackend::new("pages"));
        backend.set("k", tagged(&["a"]), None);
        let scheduler = scheduler_for(vec![backend.clone() as DynBackend], SchedulerConfig::with_delay(millis(1000)));
        let mut reports = scheduler.subscribe();

        scheduler.add(["a"]);
        let report = scheduler.flush().await.unwrap();
        assert_eq!(report.trigger, SweepTrigger::Flush);
        assert_eq!(report.window, 1);
        assert!(backend.is_empty());
        reports.recv().await.unwrap();

        tokio::time::sleep(millis(5000)).await;
        assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));
        assert!(scheduler.flush().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_adds_arm_single_window() {
        let scheduler = scheduler_for(
            vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend],
            SchedulerConfig::with_delay(millis(200)),
        );
        let mut reports = scheduler.subscribe();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.add([format!("tag-{}", i % 10)]) })
            })
            .collect();
        let mut armed = 0;
        for handle in handles {
            armed += usize::from(handle.await.unwrap().armed);
        }
        assert_eq!(armed, 1);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.tags.len(), 10);
        tokio::time::sleep(millis(1000)).await;
        assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_armed_window() {
        let scheduler = scheduler_for(
            vec![Arc::new(InMemoryBackend::new("pages")) as DynBackend],
            SchedulerConfig::with_delay(millis(1000)),
        );

        scheduler.add(["a"]);
        tokio::time::advance(millis(400)).await;

        let status = scheduler.status();
        assert_eq!(status.armed_window, Some(1));
        assert_eq!(status.fires_in_ms, Some(600));
        assert_eq!(status.backends, vec!["pages"]);
        assert_eq!(status.policy, DebouncePolicy::Fixed);
    }
}
