//! In-memory [`LivenessBackend`] backed by `Arc<Mutex<BTreeMap>>`.
//!
//! Records live under the `distributed-cron:<namespace>:<node_id>` keys the
//! network backends use, expire according to a pluggable [`Clock`], and are
//! discovered through the same paged scan protocol a Redis `SCAN` exposes.
//! Clones share state, so several schedulers in one process can use it as a
//! common registry.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{LivenessBackend, Renewal};
use crate::clock::{Clock, SystemClock};
use crate::error::validate_namespace;
use crate::node::{NodeId, namespace_prefix, node_id_from_key, presence_key};

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBackendError {
    /// Simulated outage, see [`MemoryBackend::set_unavailable`].
    Unavailable,
    /// Simulated failure part-way through a paged scan.
    ScanInterrupted { pages_read: usize },
    InvalidNamespace(String),
}

impl fmt::Display for MemoryBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "memory backend unavailable"),
            Self::ScanInterrupted { pages_read } => {
                write!(f, "scan interrupted after {pages_read} page(s)")
            }
            Self::InvalidNamespace(ns) => write!(f, "invalid namespace '{ns}'"),
        }
    }
}

impl std::error::Error for MemoryBackendError {}

/// One page of a [`MemoryBackend::scan`]. `cursor` is `None` once the scan is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

#[derive(Debug)]
struct Record<I> {
    value: String,
    expires_at: I,
}

#[derive(Clone)]
pub struct MemoryBackend<C: Clock = SystemClock> {
    records: Arc<Mutex<BTreeMap<String, Record<C::Instant>>>>,
    clock: C,
    ttl: Duration,
    page_size: usize,
    unavailable: Arc<AtomicBool>,
    /// Remaining pages a scan may read before failing; `usize::MAX` disables the fault.
    scan_budget: Arc<AtomicUsize>,
}

impl MemoryBackend<SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }
}

impl<C: Clock> MemoryBackend<C> {
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
            ttl,
            page_size: DEFAULT_PAGE_SIZE,
            unavailable: Arc::new(AtomicBool::new(false)),
            scan_budget: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Number of keys returned per scan page. Clamped to at least 1.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// While set, every operation fails with [`MemoryBackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Let the next scans read `pages` pages in total, then fail. Any later
    /// call to [`clear_faults`](Self::clear_faults) removes the limit.
    pub fn fail_scan_after(&self, pages: usize) {
        self.scan_budget.store(pages, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
        self.scan_budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Seed a live record without going through `register_node`.
    pub fn insert_node(&self, namespace: &str, node_id: &NodeId) {
        let expires_at = self.clock.now() + self.ttl;
        self.lock().insert(
            presence_key(namespace, node_id),
            Record {
                value: node_id.to_string(),
                expires_at,
            },
        );
    }

    /// Drop a record immediately, as if its TTL had run out.
    pub fn evict_node(&self, namespace: &str, node_id: &NodeId) -> bool {
        self.lock().remove(&presence_key(namespace, node_id)).is_some()
    }

    /// Live records across every namespace.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock().values().filter(|r| r.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to one page of live keys starting with `prefix`, strictly after
    /// `after` in key order. Keys inserted behind the cursor are not revisited,
    /// keys present for the whole scan are returned exactly once.
    pub fn scan(&self, after: Option<&str>, prefix: &str) -> Result<ScanPage, MemoryBackendError> {
        self.check_available()?;
        let budget = self.scan_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(MemoryBackendError::ScanInterrupted { pages_read: 0 });
        }
        if budget != usize::MAX {
            self.scan_budget.store(budget - 1, Ordering::SeqCst);
        }

        let now = self.clock.now();
        let mut records = self.lock();
        records.retain(|_, r| r.expires_at > now);

        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut matching = records
            .range((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));

        let keys: Vec<String> = matching.by_ref().take(self.page_size).cloned().collect();
        let more = matching.next().is_some();
        let cursor = if more { keys.last().cloned() } else { None };
        Ok(ScanPage { keys, cursor })
    }

    fn check_available(&self) -> Result<(), MemoryBackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MemoryBackendError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Record<C::Instant>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_namespace(namespace: &str) -> Result<(), MemoryBackendError> {
    validate_namespace(namespace).map_err(|_| MemoryBackendError::InvalidNamespace(namespace.to_string()))
}

impl<C: Clock> LivenessBackend for MemoryBackend<C> {
    type Error = MemoryBackendError;

    async fn ping(&self) -> Result<(), MemoryBackendError> {
        self.check_available()
    }

    async fn register_node(&self, namespace: &str) -> Result<NodeId, MemoryBackendError> {
        self.check_available()?;
        check_namespace(namespace)?;
        let node_id = NodeId::generate();
        self.insert_node(namespace, &node_id);
        Ok(node_id)
    }

    async fn heartbeat(&self, namespace: &str, node_id: &NodeId) -> Result<Renewal, MemoryBackendError> {
        self.check_available()?;
        check_namespace(namespace)?;
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let key = presence_key(namespace, node_id);

        let mut records = self.lock();
        match records.get_mut(&key) {
            Some(record) if record.expires_at > now => {
                record.expires_at = expires_at;
                Ok(Renewal::Extended)
            }
            _ => {
                records.insert(
                    key,
                    Record {
                        value: node_id.to_string(),
                        expires_at,
                    },
                );
                Ok(Renewal::Recreated)
            }
        }
    }

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeId>, MemoryBackendError> {
        check_namespace(namespace)?;
        let prefix = namespace_prefix(namespace);
        let mut nodes = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages_read = 0usize;

        loop {
            let page = self.scan(cursor.as_deref(), &prefix).map_err(|e| match e {
                MemoryBackendError::ScanInterrupted { .. } => {
                    MemoryBackendError::ScanInterrupted { pages_read }
                }
                other => other,
            })?;
            pages_read += 1;
            nodes.extend(page.keys.iter().filter_map(|key| node_id_from_key(namespace, key)));
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl<C: Clock> MemoryBackend<C> {
    /// Stored value of a live record, if any.
    pub fn value_of(&self, namespace: &str, node_id: &NodeId) -> Option<String> {
        let now = self.clock.now();
        self.lock()
            .get(&presence_key(namespace, node_id))
            .filter(|r| r.expires_at > now)
            .map(|r| r.value.clone())
    }
}
