//! Optimistic execution and rollback.
//!
//! An [`OptimisticExecutor`] keeps two trees: the last authoritative
//! (`confirmed`) tree and the local tree, which is the confirmed tree with
//! every pending execution applied on top in submission order. Each pending
//! execution keeps the [`TreeDelta`] that produced it, so a rollback inverts
//! exactly the recorded change instead of replaying an undo stack.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::AtomicAction;
use crate::apply::{apply_action, ApplyOptions};
use crate::delta::{apply_delta, DeltaError, TreeDelta};
use crate::error::{ActionError, ActionResult};
use crate::model::PageDefinition;
use crate::sync::Patch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Confirmed,
    RolledBack,
}

/// Resolves with the authoritative result of an action.
///
/// If the producing side goes away without answering, resolves with
/// [`ActionError::Cancelled`].
#[derive(Debug)]
pub struct PendingConfirmation {
    rx: oneshot::Receiver<ActionResult>,
    version: u64,
}

impl PendingConfirmation {
    pub(crate) fn channel(version: u64) -> (oneshot::Sender<ActionResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, version })
    }
}

impl Future for PendingConfirmation {
    type Output = ActionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ActionResult> {
        let version = self.version;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| ActionResult::failure(version, ActionError::Cancelled)))
    }
}

/// A speculatively applied action.
#[derive(Debug)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub action: AtomicAction,
    /// Authoritative version the action was based on.
    pub base_version: u64,
    /// Local tree version just before the action applied.
    pub prev_version: u64,
    /// Changes that turned the previous local tree into `applied_tree`.
    pub delta: TreeDelta,
    pub applied_tree: Arc<PageDefinition>,
    pub status: ExecutionStatus,
    pub created_at: Instant,
    pub settled_at: Option<Instant>,
    pub result: Option<ActionResult>,
    notify: Option<oneshot::Sender<ActionResult>>,
}

impl ExecutionRecord {
    fn settle(&mut self, status: ExecutionStatus, result: ActionResult, now: Instant) {
        self.status = status;
        self.settled_at = Some(now);
        if let Some(tx) = self.notify.take() {
            // The caller may have dropped the confirmation future.
            let _ = tx.send(result.clone());
        }
        self.result = Some(result);
    }
}

/// What `apply_optimistic` hands back to the caller.
#[derive(Debug)]
pub struct OptimisticApply {
    pub execution_id: ExecutionId,
    pub base_version: u64,
    /// The local tree with the action applied, ready to render.
    pub tree: Arc<PageDefinition>,
    pub confirmation: PendingConfirmation,
}

/// A status change the owner of the executor may want to surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub error: Option<ActionError>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("missed updates: have version {have}, received {received}")]
pub struct NeedsResync {
    pub have: u64,
    pub received: u64,
}

pub struct OptimisticExecutor {
    confirmed: Arc<PageDefinition>,
    tree: Arc<PageDefinition>,
    pending: Vec<ExecutionId>,
    records: IndexMap<ExecutionId, ExecutionRecord>,
    transitions: Vec<Transition>,
    options: ApplyOptions,
    timeout: Duration,
    retention: Duration,
}

impl fmt::Debug for OptimisticExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticExecutor")
            .field("confirmed_version", &self.confirmed.version)
            .field("local_version", &self.tree.version)
            .field("pending", &self.pending)
            .field("records", &self.records.len())
            .finish()
    }
}

impl OptimisticExecutor {
    pub fn new(tree: PageDefinition) -> Self {
        let tree = Arc::new(tree);
        Self {
            confirmed: tree.clone(),
            tree,
            pending: Vec::new(),
            records: IndexMap::new(),
            transitions: Vec::new(),
            options: ApplyOptions::default(),
            timeout: Duration::from_secs(10),
            retention: Duration::from_secs(60),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Pending records older than `timeout` are rolled back by [`sweep`](Self::sweep);
    /// settled records are dropped after `retention`.
    pub fn with_windows(mut self, timeout: Duration, retention: Duration) -> Self {
        self.timeout = timeout;
        self.retention = retention;
        self
    }

    /// The local tree, including pending executions.
    pub fn tree(&self) -> Arc<PageDefinition> {
        self.tree.clone()
    }

    /// The last authoritative tree.
    pub fn confirmed(&self) -> Arc<PageDefinition> {
        self.confirmed.clone()
    }

    pub fn pending(&self) -> &[ExecutionId] {
        &self.pending
    }

    pub fn record(&self, id: ExecutionId) -> Option<&ExecutionRecord> {
        self.records.get(&id)
    }

    pub fn status(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    /// Apply `action` to the local tree right away.
    ///
    /// Fails without creating a record if the action does not apply locally.
    pub fn apply_optimistic(&mut self, action: AtomicAction) -> Result<OptimisticApply, ActionError> {
        self.apply_optimistic_at(action, Instant::now())
    }

    pub fn apply_optimistic_at(&mut self, action: AtomicAction, now: Instant) -> Result<OptimisticApply, ActionError> {
        let outcome = apply_action(&self.tree, &action, &self.options);
        if let Some(err) = outcome.result.error {
            return Err(err);
        }
        let execution_id = ExecutionId::new();
        let base_version = self.confirmed.version;
        let (tx, confirmation) = PendingConfirmation::channel(base_version);
        let applied_tree = Arc::new(outcome.tree);

        self.records.insert(
            execution_id,
            ExecutionRecord {
                execution_id,
                action,
                base_version,
                prev_version: self.tree.version,
                delta: outcome.delta,
                applied_tree: applied_tree.clone(),
                status: ExecutionStatus::Pending,
                created_at: now,
                settled_at: None,
                result: None,
                notify: Some(tx),
            },
        );
        self.pending.push(execution_id);
        self.tree = applied_tree.clone();
        debug!(execution_id = %execution_id, base_version, local_version = self.tree.version, "optimistic apply");

        Ok(OptimisticApply {
            execution_id,
            base_version,
            tree: applied_tree,
            confirmation,
        })
    }

    /// Undo an execution. Unknown or already rolled-back ids are a no-op.
    pub fn rollback(&mut self, id: ExecutionId) -> Arc<PageDefinition> {
        let version = self.confirmed.version;
        self.rollback_with(id, ActionResult::failure(version, ActionError::Cancelled))
    }

    /// Undo an execution and resolve its confirmation with `result`.
    pub fn rollback_with(&mut self, id: ExecutionId, result: ActionResult) -> Arc<PageDefinition> {
        let now = Instant::now();
        let Some(pos) = self.pending.iter().position(|p| *p == id) else {
            // Settled already, or part of the confirmed tree: nothing to undo.
            return self.tree.clone();
        };

        let later = self.pending.split_off(pos + 1);
        self.pending.truncate(pos);

        match self.rewind(&later, id) {
            Ok(tree) => self.tree = Arc::new(tree),
            Err(err) => {
                warn!(execution_id = %id, error = %err, "delta inversion failed, rebuilding from confirmed tree");
                self.rebuild();
            }
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.settle(ExecutionStatus::RolledBack, result.clone(), now);
        }
        self.transitions.push(Transition {
            execution_id: id,
            status: ExecutionStatus::RolledBack,
            error: result.error,
        });
        debug!(execution_id = %id, local_version = self.tree.version, "rolled back");

        self.replay(later);
        self.tree.clone()
    }

    /// Undo `later` (newest first) and then `target`, by delta inversion.
    fn rewind(&self, later: &[ExecutionId], target: ExecutionId) -> Result<PageDefinition, DeltaError> {
        let mut tree = (*self.tree).clone();
        for id in later.iter().rev().chain(std::iter::once(&target)) {
            if let Some(record) = self.records.get(id) {
                tree = apply_delta(&tree, &record.delta.inverted())?;
                tree.version = record.prev_version;
            }
        }
        Ok(tree)
    }

    /// Re-apply the actions of `ids` on top of the local tree. Actions that
    /// no longer apply are rolled back.
    fn replay(&mut self, ids: Vec<ExecutionId>) {
        for id in ids {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            let outcome = apply_action(&self.tree, &record.action, &self.options);
            if outcome.result.success {
                record.prev_version = self.tree.version;
                record.delta = outcome.delta;
                record.applied_tree = Arc::new(outcome.tree);
                self.tree = record.applied_tree.clone();
                self.pending.push(id);
            } else {
                let error = outcome.result.error.clone();
                debug!(execution_id = %id, "pending action no longer applies, rolling back");
                record.settle(ExecutionStatus::RolledBack, outcome.result, Instant::now());
                self.transitions.push(Transition {
                    execution_id: id,
                    status: ExecutionStatus::RolledBack,
                    error,
                });
            }
        }
    }

    /// Recompute the local tree as confirmed + pending.
    fn rebuild(&mut self) {
        self.tree = self.confirmed.clone();
        let pending = std::mem::take(&mut self.pending);
        self.replay(pending);
    }

    /// Record the authoritative result for an execution.
    ///
    /// A failure rolls the execution back before resolving its confirmation.
    pub fn confirm(&mut self, id: ExecutionId, result: ActionResult) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.status != ExecutionStatus::Pending {
            return;
        }
        if !result.success {
            self.rollback_with(id, result);
            return;
        }

        let version = result.version;
        record.settle(ExecutionStatus::Confirmed, result, Instant::now());
        self.transitions.push(Transition {
            execution_id: id,
            status: ExecutionStatus::Confirmed,
            error: None,
        });

        // A resync may already have brought it in.
        if version <= self.confirmed.version {
            self.pending.retain(|p| *p != id);
            self.records.shift_remove(&id);
            self.rebuild();
        }
    }

    /// Fold an authoritative patch into the confirmed tree and rebase the
    /// pending executions on it.
    pub fn apply_remote(&mut self, patch: &Patch) -> Result<Arc<PageDefinition>, NeedsResync> {
        if patch.version <= self.confirmed.version {
            return Ok(self.tree.clone());
        }
        if patch.version != self.confirmed.version + 1 {
            return Err(NeedsResync {
                have: self.confirmed.version,
                received: patch.version,
            });
        }
        self.confirmed = patch.tree.clone();

        if let Some(id) = patch.execution_id {
            self.fold(id, ActionResult::success(patch.version, patch.affected_section_ids.clone()));
        }
        self.rebuild();
        Ok(self.tree.clone())
    }

    /// The confirmed tree now contains `id`. Whatever the local state said,
    /// the execution is confirmed from here on.
    fn fold(&mut self, id: ExecutionId, result: ActionResult) {
        let overlaid = self.pending.contains(&id);
        self.pending.retain(|p| *p != id);
        let Some(mut record) = self.records.shift_remove(&id) else {
            return;
        };
        if record.status == ExecutionStatus::Confirmed {
            return;
        }
        if !overlaid {
            debug!(execution_id = %id, status = ?record.status, "authority applied a settled execution");
        }
        record.settle(ExecutionStatus::Confirmed, result, Instant::now());
        self.transitions.push(Transition {
            execution_id: id,
            status: ExecutionStatus::Confirmed,
            error: None,
        });
    }

    /// Replace the confirmed tree with a fresh snapshot and replay pending
    /// executions on top of it.
    pub fn resync(&mut self, tree: Arc<PageDefinition>) -> Arc<PageDefinition> {
        self.confirmed = tree;
        let snapshot_version = self.confirmed.version;
        let folded: Vec<ExecutionId> = self
            .pending
            .iter()
            .filter(|id| {
                self.records.get(*id).is_some_and(|r| {
                    r.status == ExecutionStatus::Confirmed
                        && r.result.as_ref().is_some_and(|res| res.version <= snapshot_version)
                })
            })
            .copied()
            .collect();
        for id in folded {
            self.fold(id, ActionResult::success(snapshot_version, Vec::new()));
        }
        self.rebuild();
        debug!(version = snapshot_version, pending = self.pending.len(), "resynced");
        self.tree.clone()
    }

    /// Roll back pending executions older than the confirmation timeout and
    /// drop settled records older than the retention window. Returns the ids
    /// that timed out.
    pub fn sweep(&mut self, now: Instant) -> Vec<ExecutionId> {
        let expired: Vec<ExecutionId> = self
            .records
            .values()
            .filter(|r| r.status == ExecutionStatus::Pending && now.saturating_duration_since(r.created_at) >= self.timeout)
            .map(|r| r.execution_id)
            .collect();
        for id in &expired {
            let version = self.confirmed.version;
            warn!(execution_id = %id, "confirmation timed out");
            self.rollback_with(*id, ActionResult::failure(version, ActionError::ConfirmationTimeout));
        }

        let retention = self.retention;
        self.records.retain(|_, r| match r.settled_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        expired
    }
}
