//! The authoritative applier.
//!
//! [`Engine`] owns every open tree instance. Each instance is driven by one
//! actor task reading a bounded `mpsc` command queue, so actions against an
//! instance apply strictly one after another and the version grows by
//! exactly one per applied action. Everything else reads immutable
//! snapshots from a `watch` channel or from the [`SyncHub`].
//!
//! Governance runs in [`Engine::submit_action`], before the command is
//! queued, so a blocked action is rejected synchronously and never reaches
//! the actor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::AtomicAction;
use crate::apply::{apply_action, ApplyOptions, ApplyOutcome};
use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::delta::Footprint;
use crate::error::{ActionError, ActionResult, EngineError};
use crate::governance::{GovernanceContext, GovernanceGate, OverrideAuthorization, Violation};
use crate::model::PageDefinition;
use crate::optimistic::{ExecutionId, PendingConfirmation};
use crate::store::{StoreError, TreeStore};
use crate::sync::{
    arbitrate, AppliedEntry, ConflictOutcome, ConflictResolution, ConflictStrategy, ConflictWindow, ManualScope,
    Patch, Resolution, Subscription, SyncEvent, SyncHub, SyncMessage, Unsubscribe, Verdict,
};

/// An action on its way to the authority.
#[derive(Debug, Clone)]
pub struct Submission {
    pub action: AtomicAction,
    pub context: GovernanceContext,
    /// Version the producer based the action on. `None` means "whatever is
    /// current", which never conflicts.
    pub base_version: Option<u64>,
    /// Identifies the submitting client; actions from the same origin never
    /// conflict with each other.
    pub origin: Option<String>,
    /// Reuse an id minted by an optimistic apply.
    pub execution_id: Option<ExecutionId>,
}

impl Submission {
    pub fn new(action: AtomicAction, context: GovernanceContext) -> Self {
        Self {
            action,
            context,
            base_version: None,
            origin: None,
            execution_id: None,
        }
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }
}

/// Acceptance by the governance gate.
#[derive(Debug)]
pub struct Ticket {
    pub execution_id: ExecutionId,
    /// `warn` violations to show the producer.
    pub warnings: Vec<Violation>,
    pub override_applied: Option<OverrideAuthorization>,
    /// Resolves once the authority applied or rejected the action.
    pub confirmation: PendingConfirmation,
}

// ── Commands ──────────────────────────────────────────────────────────────

struct ApplyCommand {
    execution_id: ExecutionId,
    action: AtomicAction,
    actor: String,
    base_version: u64,
    origin: Option<String>,
    reply: oneshot::Sender<ActionResult>,
}

enum Command {
    Apply(Box<ApplyCommand>),
    Resolve {
        conflict_id: String,
        resolution: Resolution,
        reply: oneshot::Sender<Result<ConflictOutcome, EngineError>>,
    },
    Conflicts {
        reply: oneshot::Sender<Vec<ConflictOutcome>>,
    },
    Close,
}

struct InstanceHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<PageDefinition>>,
    task: JoinHandle<()>,
}

// ── Engine ────────────────────────────────────────────────────────────────

pub struct Engine {
    config: EngineConfig,
    gate: GovernanceGate,
    hub: Arc<SyncHub>,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<dyn TreeStore>>,
    instances: RwLock<HashMap<String, InstanceHandle>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instances: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("instances", &instances)
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            hub: Arc::new(SyncHub::new(config.subscriber_capacity)),
            config,
            gate: GovernanceGate::new(),
            audit: Arc::new(TracingAuditSink),
            store: None,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_gate(mut self, gate: GovernanceGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TreeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    /// Start serving `tree` as instance `id`. Must be called from within a
    /// Tokio runtime.
    pub fn open_instance(
        &self,
        id: &str,
        tree: PageDefinition,
        strategy: Option<ConflictStrategy>,
    ) -> Result<(), EngineError> {
        let duplicates = tree.duplicate_ids();
        if !duplicates.is_empty() {
            return Err(EngineError::InvalidTree(format!(
                "duplicate section ids: {}",
                duplicates.join(", ")
            )));
        }

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(id) {
            return Err(EngineError::InstanceExists(id.to_string()));
        }

        let tree = Arc::new(tree);
        let strategy = strategy.unwrap_or(self.config.conflict_strategy);
        let (commands, rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (snapshot_tx, snapshot) = watch::channel(tree.clone());

        let actor = InstanceActor {
            id: id.to_string(),
            tree,
            strategy,
            scope: self.config.manual_scope,
            options: self.config.apply_options(),
            window: ConflictWindow::new(self.config.conflict_window),
            held: IndexMap::new(),
            hub: self.hub.clone(),
            audit: self.audit.clone(),
            store: self.store.clone(),
            snapshot: snapshot_tx,
        };
        actor.persist();
        let task = tokio::spawn(actor.run(rx));

        instances.insert(
            id.to_string(),
            InstanceHandle {
                commands,
                snapshot,
                task,
            },
        );
        info!(tree_instance_id = id, ?strategy, "instance opened");
        Ok(())
    }

    /// Open `id` from the latest version in the configured store.
    pub fn open_from_store(&self, id: &str, strategy: Option<ConflictStrategy>) -> Result<(), EngineError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StoreError::Backend("no tree store configured".into()))?;
        let tree = store.load(id)?;
        self.open_instance(id, tree, strategy)
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn handle(&self, id: &str) -> Result<(mpsc::Sender<Command>, watch::Receiver<Arc<PageDefinition>>), EngineError> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let handle = instances
            .get(id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        Ok((handle.commands.clone(), handle.snapshot.clone()))
    }

    /// The current authoritative tree.
    pub fn snapshot(&self, id: &str) -> Result<Arc<PageDefinition>, EngineError> {
        let (_, snapshot) = self.handle(id)?;
        let tree = snapshot.borrow().clone();
        Ok(tree)
    }

    /// A receiver that always holds the latest tree.
    pub fn watch(&self, id: &str) -> Result<watch::Receiver<Arc<PageDefinition>>, EngineError> {
        Ok(self.handle(id)?.1)
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription, EngineError> {
        self.handle(id)?;
        Ok(self.hub.subscribe(id))
    }

    pub fn subscribe_listener<F>(&self, id: &str, listener: F) -> Result<Unsubscribe, EngineError>
    where
        F: FnMut(SyncEvent) + Send + 'static,
    {
        self.handle(id)?;
        Ok(self.hub.subscribe_listener(id, listener))
    }

    /// Check `submission` against the governance gate and queue it.
    ///
    /// Returns `Err(GovernanceBlocked)` right away when a block is not
    /// lifted by an authorized override. Otherwise the returned ticket's
    /// confirmation resolves with the authoritative result.
    pub async fn submit_action(&self, id: &str, submission: Submission) -> Result<Ticket, EngineError> {
        let (commands, snapshot) = self.handle(id)?;
        let tree = snapshot.borrow().clone();
        let version = tree.version;
        let execution_id = submission.execution_id.unwrap_or_default();
        let actor = submission.context.actor.id.clone();

        let context = submission.context.with_tree(tree);
        let decision = self.gate.check(&submission.action, &context);
        for violation in &decision.violations {
            self.audit.record(AuditEvent::Violation {
                tree_instance_id: id.to_string(),
                execution_id,
                version,
                violation: violation.clone(),
                blocked: violation.is_block() && !decision.allowed,
            });
        }
        let decision = match decision.into_result() {
            Ok(decision) => decision,
            Err(error) => {
                self.audit.record(AuditEvent::Rejected {
                    tree_instance_id: id.to_string(),
                    execution_id,
                    version,
                    error: error.clone(),
                });
                return Err(error.into());
            }
        };
        if let Some(authorization) = &decision.override_applied {
            self.audit.record(AuditEvent::Override {
                tree_instance_id: id.to_string(),
                execution_id,
                version,
                authorization: authorization.clone(),
            });
        }

        let (reply, confirmation) = PendingConfirmation::channel(version);
        let command = ApplyCommand {
            execution_id,
            action: submission.action,
            actor,
            base_version: submission.base_version.unwrap_or(version),
            origin: submission.origin,
            reply,
        };
        commands
            .send(Command::Apply(Box::new(command)))
            .await
            .map_err(|_| EngineError::InstanceClosed(id.to_string()))?;
        debug!(tree_instance_id = id, execution_id = %execution_id, "action queued");

        Ok(Ticket {
            execution_id,
            warnings: decision.warnings(),
            override_applied: decision.override_applied,
            confirmation,
        })
    }

    /// Manual conflicts waiting for a decision.
    pub async fn pending_conflicts(&self, id: &str) -> Result<Vec<ConflictOutcome>, EngineError> {
        let (commands, _) = self.handle(id)?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Conflicts { reply })
            .await
            .map_err(|_| EngineError::InstanceClosed(id.to_string()))?;
        rx.await.map_err(|_| EngineError::InstanceClosed(id.to_string()))
    }

    /// Settle a held manual conflict and lift its block.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<ConflictOutcome, EngineError> {
        let (commands, _) = self.handle(id)?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Resolve {
                conflict_id: conflict_id.to_string(),
                resolution,
                reply,
            })
            .await
            .map_err(|_| EngineError::InstanceClosed(id.to_string()))?;
        rx.await.map_err(|_| EngineError::InstanceClosed(id.to_string()))?
    }

    /// Stop the instance. Queued actions are cancelled and subscribers see
    /// [`SyncEvent::Closed`].
    pub async fn close_instance(&self, id: &str) -> Result<(), EngineError> {
        let handle = self
            .instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        // The actor may already be gone.
        let _ = handle.commands.send(Command::Close).await;
        if let Err(err) = handle.task.await {
            warn!(tree_instance_id = id, error = %err, "instance actor failed");
        }
        self.hub.disconnect(id);
        info!(tree_instance_id = id, "instance closed");
        Ok(())
    }
}

// ── Instance actor ────────────────────────────────────────────────────────

struct Held {
    command: ApplyCommand,
    outcome: ConflictOutcome,
    existing: Vec<ExecutionId>,
}

struct InstanceActor {
    id: String,
    tree: Arc<PageDefinition>,
    strategy: ConflictStrategy,
    scope: ManualScope,
    options: ApplyOptions,
    window: ConflictWindow,
    held: IndexMap<String, Held>,
    hub: Arc<SyncHub>,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<dyn TreeStore>>,
    snapshot: watch::Sender<Arc<PageDefinition>>,
}

impl InstanceActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Apply(command) => self.handle_apply(*command),
                Command::Resolve {
                    conflict_id,
                    resolution,
                    reply,
                } => {
                    let _ = reply.send(self.resolve(&conflict_id, resolution));
                }
                Command::Conflicts { reply } => {
                    let _ = reply.send(self.held.values().map(|h| h.outcome.clone()).collect());
                }
                Command::Close => break,
            }
        }
        debug!(tree_instance_id = %self.id, held = self.held.len(), "instance actor stopped");
    }

    fn handle_apply(&mut self, command: ApplyCommand) {
        let current = self.tree.version;
        let base = command.base_version;
        if base > current {
            return self.reject(
                command,
                ActionError::VersionConflict {
                    base,
                    current,
                    reason: "base version is ahead of the authority".into(),
                },
            );
        }

        let outcome = apply_action(&self.tree, &command.action, &self.options);
        if !outcome.is_success() {
            self.audit_rejected(&command, &outcome.result);
            let _ = command.reply.send(outcome.result);
            return;
        }

        if let Some(reason) = self.blocked_by(&outcome.footprint) {
            return self.reject(command, ActionError::VersionConflict { base, current, reason });
        }

        let verdict = match self.window.concurrent(base, current, command.origin.as_deref()) {
            Ok(concurrent) => arbitrate(self.strategy, &outcome.footprint, &concurrent),
            Err(error) => return self.reject(command, error),
        };

        match verdict {
            Verdict::Clear => {
                let result = self.commit(&command, outcome);
                let _ = command.reply.send(result);
            }
            Verdict::Apply {
                resolution,
                mut winners,
                losers,
                section_ids,
            } => {
                let result = self.commit(&command, outcome);
                winners.push(command.execution_id);
                let conflict = self.conflict(resolution, winners, losers, section_ids);
                self.publish_conflict(command.execution_id, conflict);
                let _ = command.reply.send(result);
            }
            Verdict::Reject { winners, section_ids } => {
                let reason = format!("{} changed since version {base}", describe(&section_ids));
                let conflict = self.conflict(
                    ConflictResolution::FirstWriteWins,
                    winners,
                    vec![command.execution_id],
                    section_ids,
                );
                self.publish_conflict(command.execution_id, conflict);
                self.reject(command, ActionError::VersionConflict { base, current, reason });
            }
            Verdict::Hold { existing, section_ids } => {
                let conflict = self.conflict(ConflictResolution::Pending, Vec::new(), Vec::new(), section_ids);
                info!(
                    tree_instance_id = %self.id,
                    execution_id = %command.execution_id,
                    conflict_id = %conflict.conflict_id,
                    "action held for manual resolution"
                );
                self.publish_conflict(command.execution_id, conflict.clone());
                self.held.insert(
                    conflict.conflict_id.clone(),
                    Held {
                        command,
                        outcome: conflict,
                        existing,
                    },
                );
            }
        }
    }

    fn resolve(&mut self, conflict_id: &str, resolution: Resolution) -> Result<ConflictOutcome, EngineError> {
        let Held {
            command,
            outcome: pending,
            existing,
        } = self
            .held
            .shift_remove(conflict_id)
            .ok_or_else(|| EngineError::UnknownConflict(conflict_id.to_string()))?;

        let base = command.base_version;
        let current = self.tree.version;
        let (outcome, result) = match resolution {
            Resolution::AcceptIncoming => {
                let applied = apply_action(&self.tree, &command.action, &self.options);
                if applied.is_success() {
                    let result = self.commit(&command, applied);
                    let mut outcome = pending;
                    outcome.resolution = ConflictResolution::AcceptedIncoming;
                    outcome.winners = vec![command.execution_id];
                    outcome.losers = existing;
                    (outcome, result)
                } else {
                    self.audit_rejected(&command, &applied.result);
                    let mut outcome = pending;
                    outcome.resolution = ConflictResolution::KeptExisting;
                    outcome.winners = existing;
                    outcome.losers = vec![command.execution_id];
                    (outcome, applied.result)
                }
            }
            Resolution::KeepExisting => {
                let result = ActionResult::failure(
                    current,
                    ActionError::VersionConflict {
                        base,
                        current,
                        reason: "conflict resolved in favour of existing changes".into(),
                    },
                );
                self.audit_rejected(&command, &result);
                let mut outcome = pending;
                outcome.resolution = ConflictResolution::KeptExisting;
                outcome.winners = existing;
                outcome.losers = vec![command.execution_id];
                (outcome, result)
            }
        };

        let mut outcome = outcome;
        outcome.version = self.tree.version;
        self.publish_conflict(command.execution_id, outcome.clone());
        let _ = command.reply.send(result);
        Ok(outcome)
    }

    /// Why a manual hold blocks `footprint`, if one does.
    fn blocked_by(&self, footprint: &Footprint) -> Option<String> {
        if self.held.is_empty() {
            return None;
        }
        match self.scope {
            ManualScope::Instance => Some("instance is awaiting manual conflict resolution".into()),
            ManualScope::Section => {
                let touched = footprint.section_ids();
                self.held
                    .values()
                    .flat_map(|h| h.outcome.section_ids.iter())
                    .find(|id| touched.contains(*id))
                    .map(|id| format!("section `{id}` is awaiting manual conflict resolution"))
            }
        }
    }

    fn commit(&mut self, command: &ApplyCommand, outcome: ApplyOutcome) -> ActionResult {
        let ApplyOutcome {
            tree,
            result,
            delta,
            footprint,
        } = outcome;
        let tree = Arc::new(tree);
        self.tree = tree.clone();
        self.window.record(AppliedEntry {
            version: tree.version,
            base_version: command.base_version,
            execution_id: command.execution_id,
            origin: command.origin.clone(),
            footprint,
        });
        self.persist();
        self.snapshot.send_replace(tree.clone());

        let patch = Patch {
            tree_instance_id: self.id.clone(),
            version: tree.version,
            base_version: command.base_version,
            execution_id: Some(command.execution_id),
            origin: command.origin.clone(),
            affected_section_ids: result.affected_section_ids.clone(),
            delta,
            tree,
        };
        self.hub.publish(&self.id, SyncMessage::Patch(Arc::new(patch)));

        self.audit.record(AuditEvent::Applied {
            tree_instance_id: self.id.clone(),
            execution_id: command.execution_id,
            version: result.version,
            action_kind: command.action.kind().to_string(),
            actor: command.actor.clone(),
            affected_section_ids: result.affected_section_ids.clone(),
        });
        result
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.id, &self.tree) {
                warn!(tree_instance_id = %self.id, version = self.tree.version, error = %err, "failed to persist tree");
            }
        }
    }

    fn conflict(
        &self,
        resolution: ConflictResolution,
        winners: Vec<ExecutionId>,
        losers: Vec<ExecutionId>,
        section_ids: Vec<String>,
    ) -> ConflictOutcome {
        ConflictOutcome {
            conflict_id: Uuid::new_v4().to_string(),
            tree_instance_id: self.id.clone(),
            strategy: self.strategy,
            resolution,
            winners,
            losers,
            section_ids,
            version: self.tree.version,
        }
    }

    /// `execution_id` is the incoming action the outcome was decided for.
    fn publish_conflict(&self, execution_id: ExecutionId, outcome: ConflictOutcome) {
        self.audit.record(AuditEvent::Conflict {
            tree_instance_id: self.id.clone(),
            execution_id,
            version: outcome.version,
            outcome: outcome.clone(),
        });
        self.hub.publish(&self.id, SyncMessage::Conflict(Arc::new(outcome)));
    }

    fn reject(&self, command: ApplyCommand, error: ActionError) {
        let result = ActionResult::failure(self.tree.version, error);
        self.audit_rejected(&command, &result);
        let _ = command.reply.send(result);
    }

    fn audit_rejected(&self, command: &ApplyCommand, result: &ActionResult) {
        if let Some(error) = &result.error {
            self.audit.record(AuditEvent::Rejected {
                tree_instance_id: self.id.clone(),
                execution_id: command.execution_id,
                version: self.tree.version,
                error: error.clone(),
            });
        }
    }
}

fn describe(section_ids: &[String]) -> String {
    match section_ids {
        [] => "the tree".to_string(),
        [one] => format!("section `{one}`"),
        many => format!("sections {}", many.join(", ")),
    }
}
