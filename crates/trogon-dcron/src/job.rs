use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::EntryId;
use crate::node::NodeId;

/// Unit of work registered under a name on every node of a namespace.
///
/// Bodies run on the blocking thread pool. During membership churn two nodes
/// can briefly disagree on ownership, so bodies should be idempotent.
pub trait Job: Send + Sync + 'static {
    fn run(&self);
}

impl<F> Job for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run(&self) {
        self()
    }
}

/// A registered job bound to its trigger-engine entry.
#[derive(Clone)]
pub struct JobWrapper {
    name: String,
    expr: String,
    entry_id: EntryId,
    job: Arc<dyn Job>,
}

impl JobWrapper {
    pub(crate) fn new(name: String, expr: String, entry_id: EntryId, job: Arc<dyn Job>) -> Self {
        Self {
            name,
            expr,
            entry_id,
            job,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub(crate) fn job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.job)
    }
}

impl fmt::Debug for JobWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWrapper")
            .field("name", &self.name)
            .field("expr", &self.expr)
            .field("entry_id", &self.entry_id)
            .finish_non_exhaustive()
    }
}

/// What the ownership gate decided for one firing on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FireOutcome {
    /// This node owns the job and ran its body.
    Executed,
    /// Another node owns the job.
    Skipped { owner: NodeId },
    /// The ring was empty; nobody ran the body.
    NoOwner,
}

impl FireOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed)
    }
}
