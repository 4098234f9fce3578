//! Local cron trigger engine.
//!
//! Knows nothing about other nodes: it computes fire times and hands due
//! callbacks to the blocking pool. Ownership is decided by whatever the
//! callback does.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span};

use crate::error::DcronError;

const DEFAULT_TICK: Duration = Duration::from_millis(500);
const MIN_TICK: Duration = Duration::from_millis(1);

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub id: EntryId,
    pub expr: String,
    pub next: Option<DateTime<Utc>>,
    pub prev: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Granularity of the firing loop.
    pub tick: Duration,
    /// Skip a firing while the previous invocation of the same entry is still running.
    pub skip_if_running: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            skip_if_running: false,
        }
    }
}

impl EngineOptions {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    pub fn with_skip_if_running(mut self, skip: bool) -> Self {
        self.skip_if_running = skip;
        self
    }
}

struct Entry {
    schedule: Schedule,
    expr: String,
    next: Option<DateTime<Utc>>,
    prev: Option<DateTime<Utc>>,
    callback: Callback,
    running: Arc<AtomicBool>,
}

impl Entry {
    fn info(&self, id: EntryId) -> EntryInfo {
        EntryInfo {
            id,
            expr: self.expr.clone(),
            next: self.next,
            prev: self.prev,
        }
    }
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    options: EngineOptions,
    span: Span,
    entries: Mutex<HashMap<EntryId, Entry>>,
    next_id: AtomicU64,
    runner: Mutex<Option<Runner>>,
}

/// Cloneable handle to a set of cron entries and the loop that fires them.
#[derive(Clone)]
pub struct CronEngine {
    inner: Arc<Inner>,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl CronEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self::with_span(options, Span::none())
    }

    pub fn with_span(options: EngineOptions, span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                span,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                runner: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Register `callback` to fire on `expr`.
    ///
    /// Accepts standard 5-field expressions (minute resolution), 6/7-field
    /// expressions with seconds (and year), and descriptors such as `@hourly`.
    pub fn schedule<F>(&self, expr: &str, callback: F) -> Result<EntryId, DcronError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let schedule = parse_schedule(expr)?;
        let next = schedule.after(&Utc::now()).next();
        let id = EntryId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        self.inner.lock_entries().insert(
            id,
            Entry {
                schedule,
                expr: expr.trim().to_string(),
                next,
                prev: None,
                callback: Arc::new(callback),
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        self.inner.span.in_scope(|| {
            tracing::debug!(entry = %id, expr, next = ?next, "Cron entry scheduled");
        });
        Ok(id)
    }

    /// Remove an entry. Invocations already dispatched keep running.
    pub fn cancel(&self, id: EntryId) -> bool {
        self.inner.lock_entries().remove(&id).is_some()
    }

    pub fn inspect(&self, id: EntryId) -> Option<EntryInfo> {
        self.inner.lock_entries().get(&id).map(|e| e.info(id))
    }

    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut entries: Vec<EntryInfo> = self
            .inner
            .lock_entries()
            .iter()
            .map(|(id, e)| e.info(*id))
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Dispatch every entry due at `now` and advance its next fire time.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.inner.fire_due(now)
    }

    /// Spawn the firing loop. No-op when already running.
    pub fn start(&self) {
        let mut runner = self.inner.lock_runner();
        if runner.is_some() {
            return;
        }
        self.inner.reschedule(Utc::now());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(
            tick_loop(Arc::clone(&self.inner), rx).instrument(self.inner.span.clone()),
        );
        *runner = Some(Runner {
            shutdown,
            handle: Some(handle),
        });
    }

    /// Drive the firing loop on the calling task until [`stop`](Self::stop).
    /// Returns immediately when the engine is already running.
    pub async fn run(&self) {
        let rx = {
            let mut runner = self.inner.lock_runner();
            if runner.is_some() {
                return;
            }
            self.inner.reschedule(Utc::now());
            let (shutdown, rx) = watch::channel(false);
            *runner = Some(Runner {
                shutdown,
                handle: None,
            });
            rx
        };
        tick_loop(Arc::clone(&self.inner), rx)
            .instrument(self.inner.span.clone())
            .await;
    }

    /// End the firing loop. Dispatched callbacks are left to finish.
    pub async fn stop(&self) {
        if let Some(handle) = self.halt() {
            let _ = handle.await;
        }
    }

    /// Signal the loop to end without waiting for it.
    pub(crate) fn halt(&self) -> Option<JoinHandle<()>> {
        let runner = self.inner.lock_runner().take()?;
        let _ = runner.shutdown.send(true);
        runner.handle
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_runner().is_some()
    }
}

impl Inner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<EntryId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<Runner>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire times that passed while the loop was not running are dropped.
    fn reschedule(&self, now: DateTime<Utc>) {
        for entry in self.lock_entries().values_mut() {
            entry.next = entry.schedule.after(&now).next();
        }
    }

    fn fire_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        // Collected under the lock, dispatched after it is released.
        let due: Vec<(EntryId, Callback, Arc<AtomicBool>)> = {
            let mut entries = self.lock_entries();
            entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let scheduled = entry.next.filter(|next| *next <= now)?;
                    entry.prev = Some(scheduled);
                    entry.next = entry.schedule.after(&now).next();
                    Some((*id, Arc::clone(&entry.callback), Arc::clone(&entry.running)))
                })
                .collect()
        };

        due.into_iter()
            .filter_map(|(id, callback, running)| {
                let guard = if self.options.skip_if_running {
                    if running.swap(true, Ordering::AcqRel) {
                        tracing::debug!(parent: &self.span, entry = %id, "Previous invocation still running, skipping");
                        return None;
                    }
                    Some(RunningGuard(running))
                } else {
                    None
                };
                let span = self.span.clone();
                Some(tokio::task::spawn_blocking(move || {
                    let _entered = span.enter();
                    let _guard = guard;
                    callback();
                }))
            })
            .collect()
    }
}

/// Clears the entry's running flag when the invocation ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn tick_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    // Struct literals bypass the floor in `with_tick`.
    let period = inner.options.tick.max(MIN_TICK);
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(tick_ms = period.as_millis() as u64, "Cron engine started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                inner.fire_due(Utc::now());
            }
        }
    }

    tracing::debug!("Cron engine stopped");
}

fn parse_schedule(expr: &str) -> Result<Schedule, DcronError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(DcronError::InvalidSchedule {
                    expr: expr.to_string(),
                    reason: format!("expected 5 to 7 fields, found {n}"),
                });
            }
        }
    };

    Schedule::from_str(&normalized).map_err(|e| DcronError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn five_field_expressions_get_a_seconds_field() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let from = "2024-01-01T00:00:30Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.after(&from).next().unwrap();
        assert_eq!(next, "2024-01-01T00:05:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn six_field_and_descriptor_expressions_pass_through() {
        assert!(parse_schedule("*/10 * * * * *").is_ok());
        assert!(parse_schedule("0 0 12 * * * 2030").is_ok());
        assert!(parse_schedule("@hourly").is_ok());
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expr in ["", "* * *", "not a cron expression at all ok", "@sometimes"] {
            let err = parse_schedule(expr).unwrap_err();
            assert!(
                matches!(err, DcronError::InvalidSchedule { .. }),
                "expected InvalidSchedule for {expr:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn schedule_inspect_and_cancel() {
        let engine = CronEngine::default();
        let id = engine.schedule("0 * * * *", || {}).unwrap();

        let info = engine.inspect(id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.expr, "0 * * * *");
        assert!(info.next.unwrap() > Utc::now());
        assert!(info.prev.is_none());

        assert!(engine.cancel(id));
        assert!(!engine.cancel(id));
        assert!(engine.inspect(id).is_none());
        assert!(engine.entries().is_empty());
    }

    #[test]
    fn entry_ids_are_unique_and_listed_in_order() {
        let engine = CronEngine::default();
        let a = engine.schedule("@daily", || {}).unwrap();
        let b = engine.schedule("@hourly", || {}).unwrap();
        assert_ne!(a, b);
        let ids: Vec<EntryId> = engine.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn fire_due_only_fires_due_entries_and_advances_them() {
        let engine = CronEngine::default();
        let (every_second, f1) = counter();
        let (yearly, f2) = counter();
        let frequent = engine.schedule("* * * * * *", f1).unwrap();
        engine.schedule("@yearly", f2).unwrap();

        let before = engine.inspect(frequent).unwrap().next.unwrap();
        let now = Utc::now() + chrono::Duration::seconds(5);
        for handle in engine.fire_due(now) {
            handle.await.unwrap();
        }

        assert_eq!(every_second.load(Ordering::SeqCst), 1);
        assert_eq!(yearly.load(Ordering::SeqCst), 0);

        let info = engine.inspect(frequent).unwrap();
        assert_eq!(info.prev, Some(before));
        assert!(info.next.unwrap() > now);
    }

    #[tokio::test]
    async fn nothing_fires_before_the_next_time() {
        let engine = CronEngine::default();
        let (count, f) = counter();
        engine.schedule("* * * * * *", f).unwrap();

        let handles = engine.fire_due(Utc::now() - chrono::Duration::hours(1));
        assert!(handles.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_entries_do_not_fire() {
        let engine = CronEngine::default();
        let (count, f) = counter();
        let id = engine.schedule("* * * * * *", f).unwrap();
        engine.cancel(id);

        assert!(engine.fire_due(Utc::now() + chrono::Duration::seconds(5)).is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skip_if_running_suppresses_overlapping_invocations() {
        let engine = CronEngine::new(EngineOptions::default().with_skip_if_running(true));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (count, _) = counter();
        let c = Arc::clone(&count);
        engine
            .schedule("* * * * * *", move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5));
            })
            .unwrap();

        let first = engine.fire_due(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(first.len(), 1);
        while count.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = engine.fire_due(Utc::now() + chrono::Duration::seconds(10));
        assert!(second.is_empty(), "overlapping invocation should be skipped");

        release_tx.send(()).unwrap();
        for handle in first {
            handle.await.unwrap();
        }

        let third = engine.fire_due(Utc::now() + chrono::Duration::seconds(15));
        assert_eq!(third.len(), 1);
        release_tx.send(()).unwrap();
        for handle in third {
            handle.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_invocations_run_without_skip() {
        let engine = CronEngine::default();
        let (count, f) = counter();
        engine.schedule("* * * * * *", f).unwrap();

        let mut handles = engine.fire_due(Utc::now() + chrono::Duration::seconds(5));
        handles.extend(engine.fire_due(Utc::now() + chrono::Duration::seconds(10)));
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_and_stop_toggle_the_loop() {
        let engine = CronEngine::new(EngineOptions::default().with_tick(Duration::from_millis(10)));
        assert!(!engine.is_running());

        engine.start();
        engine.start();
        assert!(engine.is_running());

        engine.stop().await;
        assert!(!engine.is_running());
        engine.stop().await;
    }

    #[tokio::test]
    async fn started_loop_fires_entries() {
        let engine = CronEngine::new(EngineOptions::default().with_tick(Duration::from_millis(20)));
        let (count, f) = counter();
        engine.schedule("* * * * * *", f).unwrap();

        engine.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("entry should fire within a few seconds");
        engine.stop().await;
    }

    #[tokio::test]
    async fn run_returns_after_stop() {
        let engine = CronEngine::new(EngineOptions::default().with_tick(Duration::from_millis(10)));
        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run().await });

        while !engine.is_running() {
            tokio::task::yield_now().await;
        }
        engine.stop().await;

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run should return once stopped")
            .unwrap();
    }

    #[tokio::test]
    async fn missed_fire_times_are_not_replayed_on_start() {
        let engine = CronEngine::new(EngineOptions::default().with_tick(Duration::from_secs(3600)));
        let (count, f) = counter();
        let id = engine.schedule("* * * * * *", f).unwrap();
        let stale = engine.inspect(id).unwrap().next.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(stale < Utc::now());

        engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = engine.inspect(id).unwrap();
        assert_eq!(info.prev, None);
        assert!(info.next.unwrap() > stale);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Same after a stop/start cycle.
        engine.stop().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.inspect(id).unwrap().prev, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn zero_tick_in_a_struct_literal_still_fires() {
        let engine = CronEngine::new(EngineOptions {
            tick: Duration::ZERO,
            skip_if_running: false,
        });
        let (count, f) = counter();
        engine.schedule("* * * * * *", f).unwrap();

        engine.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("entry should fire with a clamped tick");
        engine.stop().await;
    }

    #[test]
    fn tick_has_a_floor() {
        assert_eq!(EngineOptions::default().with_tick(Duration::ZERO).tick, MIN_TICK);
        assert_eq!(EngineOptions::default().tick, Duration::from_millis(500));
    }
}
