//! Audit trail.
//!
//! The engine reports every applied action, governance finding, rejection
//! and conflict outcome to an [`AuditSink`]. The default sink writes them as
//! structured `tracing` events under the `sdui::audit` target.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::governance::{OverrideAuthorization, Violation};
use crate::optimistic::ExecutionId;
use crate::sync::ConflictOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Applied {
        tree_instance_id: String,
        execution_id: ExecutionId,
        version: u64,
        action_kind: String,
        actor: String,
        affected_section_ids: Vec<String>,
    },
    Violation {
        tree_instance_id: String,
        execution_id: ExecutionId,
        version: u64,
        violation: Violation,
        blocked: bool,
    },
    Override {
        tree_instance_id: String,
        execution_id: ExecutionId,
        version: u64,
        authorization: OverrideAuthorization,
    },
    Rejected {
        tree_instance_id: String,
        execution_id: ExecutionId,
        version: u64,
        error: ActionError,
    },
    Conflict {
        tree_instance_id: String,
        /// The incoming action that raised the conflict.
        execution_id: ExecutionId,
        version: u64,
        outcome: ConflictOutcome,
    },
}

impl AuditEvent {
    pub fn tree_instance_id(&self) -> &str {
        match self {
            AuditEvent::Applied { tree_instance_id, .. }
            | AuditEvent::Violation { tree_instance_id, .. }
            | AuditEvent::Override { tree_instance_id, .. }
            | AuditEvent::Rejected { tree_instance_id, .. }
            | AuditEvent::Conflict { tree_instance_id, .. } => tree_instance_id,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Logs audit events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Applied {
                tree_instance_id,
                execution_id,
                version,
                action_kind,
                actor,
                affected_section_ids,
            } => tracing::info!(
                target: "sdui::audit",
                tree_instance_id = %tree_instance_id,
                execution_id = %execution_id,
                version,
                action = %action_kind,
                actor = %actor,
                affected = ?affected_section_ids,
                "action applied"
            ),
            AuditEvent::Violation {
                tree_instance_id,
                execution_id,
                version,
                violation,
                blocked,
            } => tracing::warn!(
                target: "sdui::audit",
                tree_instance_id = %tree_instance_id,
                execution_id = %execution_id,
                version,
                rule = %violation.rule_id,
                severity = ?violation.severity,
                blocked,
                "{}",
                violation.message
            ),
            AuditEvent::Override {
                tree_instance_id,
                execution_id,
                version,
                authorization,
            } => tracing::warn!(
                target: "sdui::audit",
                tree_instance_id = %tree_instance_id,
                execution_id = %execution_id,
                version,
                authorized_by = %authorization.authorized_by,
                reason = %authorization.reason,
                "governance override applied"
            ),
            AuditEvent::Rejected {
                tree_instance_id,
                execution_id,
                version,
                error,
            } => tracing::info!(
                target: "sdui::audit",
                tree_instance_id = %tree_instance_id,
                execution_id = %execution_id,
                version,
                kind = error.kind(),
                "action rejected: {error}"
            ),
            AuditEvent::Conflict {
                tree_instance_id,
                execution_id,
                version,
                outcome,
            } => tracing::info!(
                target: "sdui::audit",
                tree_instance_id = %tree_instance_id,
                execution_id = %execution_id,
                version,
                conflict_id = %outcome.conflict_id,
                strategy = ?outcome.strategy,
                winners = ?outcome.winners,
                losers = ?outcome.losers,
                "conflict resolved"
            ),
        }
    }
}

/// Keeps events in memory, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order_across_clones() {
        let sink = MemoryAuditSink::new();
        let shared = sink.clone();
        let id = ExecutionId::new();
        for version in 1..=3 {
            shared.record(AuditEvent::Rejected {
                tree_instance_id: "page".into(),
                execution_id: id,
                version,
                error: ActionError::Cancelled,
            });
        }
        let versions: Vec<u64> = sink
            .events()
            .iter()
            .map(|e| match e {
                AuditEvent::Rejected { version, .. } => *version,
                _ => 0,
            })
            .collect();
        assert_eq!(versions, [1, 2, 3]);
        assert_eq!(sink.events()[0].tree_instance_id(), "page");
        sink.clear();
        assert!(shared.events().is_empty());
    }

    #[test]
    fn tracing_sink_accepts_every_event() {
        let sink = TracingAuditSink;
        sink.record(AuditEvent::Override {
            tree_instance_id: "page".into(),
            execution_id: ExecutionId::new(),
            version: 2,
            authorization: OverrideAuthorization {
                authorized_by: "lead".into(),
                reason: "launch".into(),
            },
        });
    }
}
