//! Error types for the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::governance::Violation;
use crate::store::StoreError;

/// Why an action did not apply.
///
/// Every variant is recoverable by the producer: retry with a corrected
/// action, ask for disambiguation, or surface the violation to a human.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    #[error("selector {selector} is ambiguous: {} candidates", .candidates.len())]
    SelectorAmbiguous { selector: String, candidates: Vec<String> },
    #[error("selector {selector} matched nothing")]
    SelectorNotFound { selector: String },
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("blocked by governance: {}", summarize(.violations))]
    GovernanceBlocked { violations: Vec<Violation> },
    #[error("version conflict: base {base}, current {current}: {reason}")]
    VersionConflict { base: u64, current: u64, reason: String },
    #[error("malformed action: {reason}")]
    MalformedAction { reason: String },
    #[error("no confirmation before the deadline")]
    ConfirmationTimeout,
    #[error("execution cancelled")]
    Cancelled,
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("[{}] {}", v.rule_id, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ActionError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ActionError::MalformedAction { reason: reason.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::SelectorAmbiguous { .. } => "selector_ambiguous",
            ActionError::SelectorNotFound { .. } => "selector_not_found",
            ActionError::InvalidPath { .. } => "invalid_path",
            ActionError::GovernanceBlocked { .. } => "governance_blocked",
            ActionError::VersionConflict { .. } => "version_conflict",
            ActionError::MalformedAction { .. } => "malformed_action",
            ActionError::ConfirmationTimeout => "confirmation_timeout",
            ActionError::Cancelled => "cancelled",
        }
    }
}

impl From<sdui_path::PathError> for ActionError {
    fn from(err: sdui_path::PathError) -> Self {
        use sdui_path::PathError;
        let path = match &err {
            PathError::Malformed { input, .. } => input.clone(),
            PathError::NotFound { path }
            | PathError::IndexOutOfBounds { path, .. }
            | PathError::TypeMismatch { path, .. } => path.clone(),
            PathError::TooLong { .. } | PathError::TooDeep { .. } | PathError::RemoveRoot => String::new(),
        };
        ActionError::InvalidPath {
            path,
            reason: err.to_string(),
        }
    }
}

/// Errors from the engine's own plumbing rather than from an action.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("unknown tree instance `{0}`")]
    UnknownInstance(String),
    #[error("tree instance `{0}` already exists")]
    InstanceExists(String),
    #[error("tree instance `{0}` is closed")]
    InstanceClosed(String),
    #[error("unknown conflict `{0}`")]
    UnknownConflict(String),
    #[error("invalid page definition: {0}")]
    InvalidTree(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// The outcome reported for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    /// Tree version after the action; unchanged on failure.
    pub version: u64,
    pub affected_section_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// Index of the failing sub-action when a batch fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
}

impl ActionResult {
    pub fn success(version: u64, affected_section_ids: Vec<String>) -> Self {
        Self {
            success: true,
            version,
            affected_section_ids,
            error: None,
            failed_step: None,
        }
    }

    pub fn failure(version: u64, error: ActionError) -> Self {
        Self {
            success: false,
            version,
            affected_section_ids: Vec::new(),
            error: Some(error),
            failed_step: None,
        }
    }

    pub fn with_failed_step(mut self, step: Option<usize>) -> Self {
        self.failed_step = step;
        self
    }

    /// `Ok(self)` on success, the carried error otherwise.
    pub fn into_result(self) -> Result<ActionResult, ActionError> {
        match self.error.clone() {
            Some(err) if !self.success => Err(err),
            _ => Ok(self),
        }
    }
}
