//! Built-in governance rules.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::{ActorKind, GovernanceContext, GovernanceRule, Severity, Violation};
use crate::action::AtomicAction;
use crate::apply::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::selector::{resolve, ComponentSelector};

// ── Protected sections ────────────────────────────────────────────────────

/// Blocks mutate, remove and layout changes on a fixed set of Section ids.
/// Removing an ancestor of a protected Section is blocked too.
#[derive(Debug, Clone)]
pub struct ProtectedSectionsRule {
    ids: BTreeSet<String>,
    severity: Severity,
}

impl ProtectedSectionsRule {
    pub const ID: &'static str = "protected_sections";

    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            severity: Severity::Block,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Ids the selector may land on. Without a tree only a literal id counts.
    fn targets(selector: &ComponentSelector, ctx: &GovernanceContext) -> Vec<String> {
        match &ctx.tree {
            Some(tree) => resolve(tree, selector)
                .into_iter()
                .filter(|m| m.confidence >= DEFAULT_CONFIDENCE_THRESHOLD)
                .map(|m| m.section_id)
                .collect(),
            None => selector.id.iter().cloned().collect(),
        }
    }
}

impl GovernanceRule for ProtectedSectionsRule {
    fn id(&self) -> &str {
        Self::ID
    }

    fn evaluate(&self, action: &AtomicAction, ctx: &GovernanceContext) -> Vec<Violation> {
        let mut out = Vec::new();
        for leaf in action.leaves() {
            let (verb, selector, whole_subtree) = match leaf {
                AtomicAction::MutateComponent { selector, .. } => ("mutate", selector, false),
                AtomicAction::RemoveComponent { selector } => ("remove", selector, true),
                AtomicAction::UpdateLayout { selector, .. } => ("change the layout of", selector, false),
                _ => continue,
            };
            for target in Self::targets(selector, ctx) {
                let hit = if whole_subtree {
                    ctx.tree
                        .as_ref()
                        .and_then(|t| t.section(&target))
                        .map(|s| s.subtree_ids())
                        .unwrap_or_else(|| vec![target.clone()])
                        .into_iter()
                        .find(|id| self.ids.contains(id))
                } else {
                    self.ids.contains(&target).then(|| target.clone())
                };
                if let Some(protected) = hit {
                    out.push(
                        Violation::new(
                            Self::ID,
                            format!("cannot {verb} protected section `{protected}`"),
                            self.severity,
                        )
                        .with_section(protected),
                    );
                }
            }
        }
        out
    }
}

// ── Agent removal ─────────────────────────────────────────────────────────

/// Automated actors may not remove components.
#[derive(Debug, Clone, Default)]
pub struct AgentRemovalRule;

impl AgentRemovalRule {
    pub const ID: &'static str = "agent_removal";
}

impl GovernanceRule for AgentRemovalRule {
    fn id(&self) -> &str {
        Self::ID
    }

    fn evaluate(&self, action: &AtomicAction, ctx: &GovernanceContext) -> Vec<Violation> {
        if ctx.actor.kind != ActorKind::Agent {
            return Vec::new();
        }
        action
            .leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                AtomicAction::RemoveComponent { selector } => Some(Violation::new(
                    Self::ID,
                    format!("agent `{}` may not remove {selector}", ctx.actor.id),
                    Severity::Block,
                )),
                _ => None,
            })
            .collect()
    }
}

// ── Batch size ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MaxBatchSizeRule {
    max: usize,
}

impl MaxBatchSizeRule {
    pub const ID: &'static str = "max_batch_size";

    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl GovernanceRule for MaxBatchSizeRule {
    fn id(&self) -> &str {
        Self::ID
    }

    fn evaluate(&self, action: &AtomicAction, _ctx: &GovernanceContext) -> Vec<Violation> {
        let size = action.leaves().len();
        if size <= self.max {
            return Vec::new();
        }
        vec![Violation::new(
            Self::ID,
            format!("batch of {size} actions exceeds the limit of {}", self.max),
            Severity::Block,
        )]
    }
}

// ── Banned terms ──────────────────────────────────────────────────────────

/// Flags copy containing banned words (whole words, any case) in any value
/// the action writes.
#[derive(Debug, Clone)]
pub struct BannedTermsRule {
    terms: Vec<String>,
    matcher: Option<Regex>,
    severity: Severity,
}

impl Default for BannedTermsRule {
    fn default() -> Self {
        Self::new(["guaranteed"])
    }
}

impl BannedTermsRule {
    pub const ID: &'static str = "banned_terms";

    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let terms: Vec<String> = terms.into_iter().map(Into::into).collect();
        let alternation = terms.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join("|");
        // Falls back to substring matching if the pattern does not build.
        let matcher = RegexBuilder::new(&format!(r"\b(?:{alternation})\b"))
            .case_insensitive(true)
            .build()
            .ok();
        Self {
            terms,
            matcher,
            severity: Severity::Warn,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    fn find(&self, text: &str) -> Option<String> {
        if self.terms.is_empty() {
            return None;
        }
        match &self.matcher {
            Some(re) => re.find(text).map(|m| m.as_str().to_lowercase()),
            None => {
                let lower = text.to_lowercase();
                self.terms
                    .iter()
                    .find(|t| lower.contains(&t.to_lowercase()))
                    .map(|t| t.to_lowercase())
            }
        }
    }

    fn scan(&self, value: &Value, found: &mut BTreeSet<String>) {
        match value {
            Value::String(s) => found.extend(self.find(s)),
            Value::Array(items) => items.iter().for_each(|v| self.scan(v, found)),
            Value::Object(map) => map.values().for_each(|v| self.scan(v, found)),
            _ => {}
        }
    }
}

impl GovernanceRule for BannedTermsRule {
    fn id(&self) -> &str {
        Self::ID
    }

    fn evaluate(&self, action: &AtomicAction, _ctx: &GovernanceContext) -> Vec<Violation> {
        let mut found = BTreeSet::new();
        for value in action.written_values() {
            self.scan(value, &mut found);
        }
        found
            .into_iter()
            .map(|term| Violation::new(Self::ID, format!("\"{term}\" is not allowed in UI copy"), self.severity))
            .collect()
    }
}
