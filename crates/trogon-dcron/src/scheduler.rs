use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{Span, debug, error, info, warn};

use crate::backend::LivenessBackend;
use crate::config::DcronOptions;
use crate::engine::{CronEngine, EntryId, EntryInfo};
use crate::error::DcronError;
use crate::job::{FireOutcome, Job, JobWrapper};
use crate::node::NodeId;
use crate::pool::NodePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub expr: String,
    pub owner: Option<NodeId>,
    /// This node currently owns the job.
    pub local: bool,
    pub next: Option<DateTime<Utc>>,
    pub prev: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub namespace: String,
    pub node_id: Option<NodeId>,
    pub state: RunState,
    pub members: Vec<NodeId>,
    pub jobs: Vec<JobStatus>,
}

struct Inner<B: LivenessBackend> {
    namespace: String,
    pool: Arc<NodePool<B>>,
    engine: CronEngine,
    jobs: Mutex<HashMap<String, JobWrapper>>,
    state: watch::Sender<RunState>,
    span: Span,
}

/// Leaderless distributed cron scheduler.
///
/// Every node of a namespace registers the same jobs. On each firing the job
/// name is located on the consistent-hash ring of live nodes and only the
/// owner runs the body. Cloning yields another handle to the same scheduler.
pub struct Scheduler<B: LivenessBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: LivenessBackend> Clone for Scheduler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: LivenessBackend> Scheduler<B> {
    pub fn new(namespace: impl Into<String>, backend: B, options: DcronOptions) -> Self {
        let namespace = namespace.into();
        let span = tracing::info_span!("dcron", namespace = %namespace);
        Self::with_span(namespace, backend, options, span)
    }

    /// Like [`new`](Self::new), but every scheduler, pool and engine event is
    /// emitted inside `span`.
    pub fn with_span(namespace: impl Into<String>, backend: B, options: DcronOptions, span: Span) -> Self {
        let namespace = namespace.into();
        let pool = Arc::new(NodePool::new(namespace.clone(), backend, &options, span.clone()));
        let engine = CronEngine::with_span(options.engine.clone(), span.clone());
        let (state, _) = watch::channel(RunState::Created);

        Self {
            inner: Arc::new(Inner {
                namespace,
                pool,
                engine,
                jobs: Mutex::new(HashMap::new()),
                state,
                span,
            }),
        }
    }

    // ── Registry ──────────────────────────────────────────────────────────

    pub fn add_job<J: Job>(&self, name: impl Into<String>, expr: &str, job: J) -> Result<EntryId, DcronError> {
        self.register(name.into(), expr, Arc::new(job))
    }

    pub fn add_func<F>(&self, name: impl Into<String>, expr: &str, f: F) -> Result<EntryId, DcronError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(name.into(), expr, Arc::new(f))
    }

    fn register(&self, name: String, expr: &str, job: Arc<dyn Job>) -> Result<EntryId, DcronError> {
        let mut jobs = self.inner.lock_jobs();
        if jobs.contains_key(&name) {
            return Err(DcronError::DuplicateJob { name });
        }

        let weak = Arc::downgrade(&self.inner);
        let job_name = name.clone();
        let entry_id = self.inner.engine.schedule(expr, move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire(&job_name);
            }
        })?;

        jobs.insert(
            name.clone(),
            JobWrapper::new(name.clone(), expr.trim().to_string(), entry_id, job),
        );
        info!(parent: &self.inner.span, job = %name, expr, entry = %entry_id, "Job registered");
        Ok(entry_id)
    }

    /// Unregister a job. Future firings stop immediately; a running body is
    /// left to finish. Returns the cancelled entry, `None` for unknown names.
    pub fn remove(&self, name: &str) -> Option<EntryId> {
        let wrapper = self.inner.lock_jobs().remove(name)?;
        self.inner.engine.cancel(wrapper.entry_id());
        info!(parent: &self.inner.span, job = name, "Job removed");
        Some(wrapper.entry_id())
    }

    /// Next scheduled firing of `name`.
    pub fn next(&self, name: &str) -> Option<DateTime<Utc>> {
        self.health_check(name)?.next
    }

    pub fn health_check(&self, name: &str) -> Option<EntryInfo> {
        let entry_id = self.inner.lock_jobs().get(name)?.entry_id();
        self.inner.engine.inspect(entry_id)
    }

    /// Registered job names, sorted.
    pub fn jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock_jobs().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn locate(&self, name: &str) -> Option<NodeId> {
        self.inner.pool.locate(name)
    }

    /// Run the ownership gate for `name` right now, outside its schedule.
    pub async fn fire_now(&self, name: &str) -> Option<FireOutcome> {
        let inner = Arc::clone(&self.inner);
        let job = name.to_string();
        match tokio::task::spawn_blocking(move || inner.fire(&job)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(parent: &self.inner.span, job = name, error = %e, "Manual firing did not complete");
                None
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let ring = self.inner.pool.ring();
        let node_id = self.inner.pool.node_id();
        let wrappers: Vec<JobWrapper> = self.inner.lock_jobs().values().cloned().collect();

        let mut jobs: Vec<JobStatus> = wrappers
            .iter()
            .map(|wrapper| {
                let info = self.inner.engine.inspect(wrapper.entry_id());
                let owner = ring.locate(wrapper.name()).cloned();
                JobStatus {
                    name: wrapper.name().to_string(),
                    expr: wrapper.expr().to_string(),
                    local: owner.is_some() && owner == node_id,
                    owner,
                    next: info.as_ref().and_then(|i| i.next),
                    prev: info.as_ref().and_then(|i| i.prev),
                }
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));

        StatusSnapshot {
            namespace: self.inner.namespace.clone(),
            node_id,
            state: self.state(),
            members: ring.nodes().to_vec(),
            jobs,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Join the namespace and start firing. No-op when already running.
    ///
    /// If registration fails the previous state is restored and the engine is
    /// never started. A call that arrives while another start is in progress
    /// waits for it: it returns `Ok` if that start succeeded and otherwise
    /// makes its own attempt.
    pub async fn start(&self) -> Result<(), DcronError> {
        let previous = loop {
            let mut current = RunState::Created;
            let mut claimed = None;
            self.inner.state.send_if_modified(|state| {
                current = *state;
                match *state {
                    RunState::Starting | RunState::Running => false,
                    other => {
                        claimed = Some(other);
                        *state = RunState::Starting;
                        true
                    }
                }
            });
            if let Some(previous) = claimed {
                break previous;
            }
            if current == RunState::Running {
                debug!(parent: &self.inner.span, "Already started");
                return Ok(());
            }
            self.settled().await;
        };

        match self.inner.pool.start().await {
            Ok(node_id) => {
                self.inner.engine.start();
                self.inner.state.send_replace(RunState::Running);
                let jobs = self.inner.lock_jobs().len();
                info!(parent: &self.inner.span, node_id = %node_id, jobs, "Distributed cron started");
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(previous);
                error!(parent: &self.inner.span, error = %e, "Distributed cron failed to start");
                Err(e)
            }
        }
    }

    /// [`start`](Self::start), then wait until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), DcronError> {
        self.start().await?;
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == RunState::Stopped).await;
        Ok(())
    }

    /// Stop firing, then stop the heartbeat and refresh loops. The presence
    /// record is not deleted; peers drop this node once it expires.
    ///
    /// A start in progress is allowed to finish first, then stopped if it
    /// succeeded.
    pub async fn stop(&self) {
        if self.settled().await != RunState::Running {
            return;
        }
        self.inner.engine.stop().await;
        self.inner.pool.stop().await;
        self.inner.state.send_replace(RunState::Stopped);
        info!(parent: &self.inner.span, "Distributed cron stopped");
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    /// Wait out an in-progress start and return the state it left behind.
    async fn settled(&self) -> RunState {
        let mut state = self.inner.state.subscribe();
        match state.wait_for(|s| *s != RunState::Starting).await {
            Ok(current) => *current,
            Err(_) => self.state(),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.pool.node_id()
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn node_pool(&self) -> &Arc<NodePool<B>> {
        &self.inner.pool
    }

    pub fn engine(&self) -> &CronEngine {
        &self.inner.engine
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

impl<B: LivenessBackend> Inner<B> {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobWrapper>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ownership gate. Runs on the blocking pool.
    fn fire(&self, name: &str) -> Option<FireOutcome> {
        let job = self.lock_jobs().get(name).map(JobWrapper::job)?;
        let _entered = self.span.enter();

        let local = self.pool.node_id();
        let outcome = match self.pool.locate(name) {
            None => {
                warn!(job = name, "No live nodes in the ring, skipping firing");
                FireOutcome::NoOwner
            }
            Some(owner) if local.as_ref() == Some(&owner) => {
                debug!(job = name, "Executing job");
                if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                    error!(job = name, "Job panicked");
                }
                FireOutcome::Executed
            }
            Some(owner) => {
                debug!(job = name, owner = %owner, "Owned by another node, skipping");
                FireOutcome::Skipped { owner }
            }
        };
        Some(outcome)
    }
}

impl<B: LivenessBackend> Drop for Inner<B> {
    fn drop(&mut self) {
        self.engine.halt();
    }
}
