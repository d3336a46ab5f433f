//! Producer-side session.
//!
//! A [`ClientSession`] keeps a local copy of one tree instance. Actions are
//! applied optimistically and rendered at once, then submitted to the
//! authority through a [`Transport`]. A background sync loop folds in the
//! authority's patches, rolls back executions that lost a conflict, and
//! reconnects with exponential backoff. Every (re)connect and every detected
//! gap is healed with a full snapshot rather than by replaying patches.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::AtomicAction;
use crate::authority::{Engine, Submission};
use crate::config::{EngineConfig, ReconnectPolicy};
use crate::error::{ActionError, ActionResult, EngineError};
use crate::governance::GovernanceContext;
use crate::model::PageDefinition;
use crate::optimistic::{ExecutionId, ExecutionStatus, OptimisticApply, OptimisticExecutor, Transition};
use crate::sync::{ConflictOutcome, Patch, Subscription, SyncEvent, SyncMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown tree instance `{0}`")]
    UnknownInstance(String),
    #[error("closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<EngineError> for TransportError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownInstance(id) => TransportError::UnknownInstance(id),
            EngineError::InstanceClosed(_) => TransportError::Closed,
            other => TransportError::Internal(other.to_string()),
        }
    }
}

/// Ordered events from the authority for one instance.
#[async_trait]
pub trait PatchStream: Send {
    async fn next_event(&mut self) -> SyncEvent;
}

#[async_trait]
impl PatchStream for Subscription {
    async fn next_event(&mut self) -> SyncEvent {
        self.recv().await
    }
}

/// How a session reaches the authority.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, instance: &str) -> Result<Box<dyn PatchStream>, TransportError>;

    async fn fetch_snapshot(&self, instance: &str) -> Result<Arc<PageDefinition>, TransportError>;

    /// Submit and wait for the authoritative result. Rejections are returned
    /// as failed results, not as transport errors.
    async fn submit(&self, instance: &str, submission: Submission) -> Result<ActionResult, TransportError>;
}

/// In-process transport backed by an [`Engine`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    engine: Arc<Engine>,
}

impl LocalTransport {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, instance: &str) -> Result<Box<dyn PatchStream>, TransportError> {
        Ok(Box::new(self.engine.subscribe(instance)?))
    }

    async fn fetch_snapshot(&self, instance: &str) -> Result<Arc<PageDefinition>, TransportError> {
        Ok(self.engine.snapshot(instance)?)
    }

    async fn submit(&self, instance: &str, submission: Submission) -> Result<ActionResult, TransportError> {
        let version = self.engine.snapshot(instance)?.version;
        match self.engine.submit_action(instance, submission).await {
            Ok(ticket) => Ok(ticket.confirmation.await),
            Err(EngineError::Action(error)) => Ok(ActionResult::failure(version, error)),
            Err(other) => Err(other.into()),
        }
    }
}

/// What a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { version: u64 },
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected,
    /// The local tree changed because of an authoritative patch.
    TreeUpdated { version: u64 },
    Resynced { version: u64 },
    Confirmed { execution_id: ExecutionId },
    RolledBack {
        execution_id: ExecutionId,
        error: Option<ActionError>,
    },
    Conflict(Arc<ConflictOutcome>),
}

struct SessionState {
    executor: OptimisticExecutor,
    /// Recent executions submitted by this session, to recognise our own
    /// losers in conflict outcomes after their records are gone.
    submitted: VecDeque<ExecutionId>,
}

struct Inner {
    instance: String,
    origin: String,
    context: GovernanceContext,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    policy: ReconnectPolicy,
    sweep_interval: Duration,
    remembered: usize,
}

#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("instance", &self.inner.instance)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

impl ClientSession {
    /// Fetch the current tree and set up a session. Call
    /// [`spawn_sync`](Self::spawn_sync) to start receiving patches.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        instance: &str,
        context: GovernanceContext,
        config: &EngineConfig,
    ) -> Result<Self, TransportError> {
        let tree = transport.fetch_snapshot(instance).await?;
        let executor = OptimisticExecutor::new((*tree).clone())
            .with_options(config.apply_options())
            .with_windows(config.confirmation_timeout(), config.execution_retention());
        let (events, _) = broadcast::channel(config.subscriber_capacity.max(1));

        Ok(Self {
            inner: Arc::new(Inner {
                instance: instance.to_string(),
                origin: Uuid::new_v4().to_string(),
                context,
                transport,
                state: Mutex::new(SessionState {
                    executor,
                    submitted: VecDeque::new(),
                }),
                events,
                policy: config.reconnect.clone(),
                sweep_interval: (config.confirmation_timeout() / 4).max(Duration::from_millis(10)),
                remembered: config.conflict_window.max(1),
            }),
        })
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    /// Origin id attached to every submission from this session.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// The local tree, including unconfirmed actions.
    pub fn tree(&self) -> Arc<PageDefinition> {
        self.state().executor.tree()
    }

    pub fn confirmed_tree(&self) -> Arc<PageDefinition> {
        self.state().executor.confirmed()
    }

    pub fn status(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        self.state().executor.status(id)
    }

    pub fn pending(&self) -> Vec<ExecutionId> {
        self.state().executor.pending().to_vec()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_transitions(&self, transitions: Vec<Transition>) {
        for t in transitions {
            let event = match t.status {
                ExecutionStatus::Confirmed => ClientEvent::Confirmed {
                    execution_id: t.execution_id,
                },
                ExecutionStatus::RolledBack => ClientEvent::RolledBack {
                    execution_id: t.execution_id,
                    error: t.error,
                },
                ExecutionStatus::Pending => continue,
            };
            self.emit(event);
        }
    }

    /// Apply `action` locally and submit it in the background.
    ///
    /// Returns as soon as the local tree is updated. Must be called from
    /// within a Tokio runtime.
    pub fn submit(&self, action: AtomicAction) -> Result<OptimisticApply, ActionError> {
        let applied = {
            let mut state = self.state();
            let applied = state.executor.apply_optimistic(action.clone())?;
            state.submitted.push_back(applied.execution_id);
            while state.submitted.len() > self.inner.remembered {
                state.submitted.pop_front();
            }
            applied
        };

        let submission = Submission::new(action, self.inner.context.clone())
            .with_base_version(applied.base_version)
            .with_origin(self.inner.origin.clone())
            .with_execution_id(applied.execution_id);
        let session = self.clone();
        let id = applied.execution_id;
        tokio::spawn(async move {
            let result = match session.inner.transport.submit(&session.inner.instance, submission).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(execution_id = %id, error = %err, "submit failed");
                    let version = session.confirmed_tree().version;
                    ActionResult::failure(version, ActionError::Cancelled)
                }
            };
            session.confirm(id, result);
        });
        Ok(applied)
    }

    fn confirm(&self, id: ExecutionId, result: ActionResult) {
        let transitions = {
            let mut state = self.state();
            state.executor.confirm(id, result);
            state.executor.drain_transitions()
        };
        self.emit_transitions(transitions);
    }

    /// Undo a local execution. Idempotent.
    pub fn rollback(&self, id: ExecutionId) -> Arc<PageDefinition> {
        let (tree, transitions) = {
            let mut state = self.state();
            let tree = state.executor.rollback(id);
            (tree, state.executor.drain_transitions())
        };
        self.emit_transitions(transitions);
        tree
    }

    /// Run the sync loop until reconnecting is given up.
    pub fn spawn_sync(&self) -> JoinHandle<Result<(), TransportError>> {
        let session = self.clone();
        tokio::spawn(async move { session.run_sync().await })
    }

    pub async fn run_sync(&self) -> Result<(), TransportError> {
        let instance = self.inner.instance.clone();
        let mut failures = 0u32;
        loop {
            let mut stream = match self.open(&instance).await {
                Ok(stream) => stream,
                Err(err) => {
                    failures += 1;
                    if self.inner.policy.exhausted(failures) {
                        warn!(tree_instance_id = %instance, failures, error = %err, "giving up reconnecting");
                        self.emit(ClientEvent::Disconnected);
                        return Err(err);
                    }
                    let delay = self.inner.policy.delay(failures - 1);
                    debug!(tree_instance_id = %instance, attempt = failures, ?delay, error = %err, "reconnecting");
                    self.emit(ClientEvent::Reconnecting {
                        attempt: failures,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            failures = 0;
            let version = self.confirmed_tree().version;
            info!(tree_instance_id = %instance, version, "connected");
            self.emit(ClientEvent::Connected { version });

            let mut sweep = tokio::time::interval(self.inner.sweep_interval);
            loop {
                tokio::select! {
                    event = stream.next_event() => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    _ = sweep.tick() => self.sweep(),
                }
            }
            self.emit(ClientEvent::Disconnected);
        }
    }

    /// Subscribe first, then fetch the snapshot, so no patch falls between.
    async fn open(&self, instance: &str) -> Result<Box<dyn PatchStream>, TransportError> {
        let stream = self.inner.transport.connect(instance).await?;
        self.resync().await?;
        Ok(stream)
    }

    async fn resync(&self) -> Result<(), TransportError> {
        let tree = self.inner.transport.fetch_snapshot(&self.inner.instance).await?;
        let version = tree.version;
        let transitions = {
            let mut state = self.state();
            state.executor.resync(tree);
            state.executor.drain_transitions()
        };
        self.emit_transitions(transitions);
        self.emit(ClientEvent::Resynced { version });
        Ok(())
    }

    /// Returns false when the stream should be reopened.
    async fn handle_event(&self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::Message(SyncMessage::Patch(patch)) => {
                if self.apply_patch(&patch) {
                    true
                } else {
                    self.resync().await.is_ok()
                }
            }
            SyncEvent::Message(SyncMessage::Conflict(outcome)) => {
                self.apply_conflict(outcome);
                true
            }
            SyncEvent::ResyncRequired { missed } => {
                debug!(tree_instance_id = %self.inner.instance, missed, "lagged, resyncing");
                self.resync().await.is_ok()
            }
            SyncEvent::Closed => false,
        }
    }

    /// False when a version gap needs a resync.
    fn apply_patch(&self, patch: &Patch) -> bool {
        let (applied, transitions) = {
            let mut state = self.state();
            let applied = state.executor.apply_remote(patch);
            (applied, state.executor.drain_transitions())
        };
        self.emit_transitions(transitions);
        match applied {
            Ok(tree) => {
                self.emit(ClientEvent::TreeUpdated { version: tree.version });
                true
            }
            Err(gap) => {
                debug!(tree_instance_id = %self.inner.instance, have = gap.have, received = gap.received, "version gap");
                false
            }
        }
    }

    /// Roll back our executions that lost `outcome`.
    fn apply_conflict(&self, outcome: Arc<ConflictOutcome>) {
        let mut forgotten = Vec::new();
        let transitions = {
            let mut state = self.state();
            let SessionState { executor, submitted } = &mut *state;
            for id in outcome.losers.iter().filter(|id| submitted.contains(*id)) {
                let error = ActionError::VersionConflict {
                    base: executor.record(*id).map_or(outcome.version, |r| r.base_version),
                    current: outcome.version,
                    reason: format!("lost conflict {}", outcome.conflict_id),
                };
                match executor.status(*id) {
                    Some(ExecutionStatus::RolledBack) => {}
                    Some(_) if executor.pending().contains(id) => {
                        let version = executor.confirmed().version;
                        executor.rollback_with(*id, ActionResult::failure(version, error));
                    }
                    // Already folded: the winner's patch has overwritten it.
                    _ => forgotten.push((*id, error)),
                }
            }
            executor.drain_transitions()
        };
        self.emit_transitions(transitions);
        for (execution_id, error) in forgotten {
            self.emit(ClientEvent::RolledBack {
                execution_id,
                error: Some(error),
            });
        }
        self.emit(ClientEvent::Conflict(outcome));
    }

    fn sweep(&self) {
        let (expired, transitions) = {
            let mut state = self.state();
            let expired = state.executor.sweep(Instant::now());
            (expired, state.executor.drain_transitions())
        };
        if !expired.is_empty() {
            debug!(tree_instance_id = %self.inner.instance, expired = expired.len(), "confirmations timed out");
        }
        self.emit_transitions(transitions);
    }
}
