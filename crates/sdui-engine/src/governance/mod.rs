//! Governance gate.
//!
//! Rules are supplied from outside as [`GovernanceRule`] implementations and
//! registered on a [`GovernanceGate`]. The gate evaluates every rule, in
//! registration order, and folds the violations into a [`GateDecision`].
//! `block` violations stop the action unless the caller is elevated and
//! carries an [`OverrideAuthorization`]; `warn` violations never block.

mod rules;

pub use rules::{AgentRemovalRule, BannedTermsRule, MaxBatchSizeRule, ProtectedSectionsRule};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::AtomicAction;
use crate::error::ActionError;
use crate::model::PageDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Block,
    Warn,
}

/// One finding produced by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    /// Whether an elevated override may lift this block.
    #[serde(default = "default_true")]
    pub overridable: bool,
}

fn default_true() -> bool {
    true
}

impl Violation {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            severity,
            section_id: None,
            overridable: true,
        }
    }

    pub fn with_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }

    pub fn not_overridable(mut self) -> Self {
        self.overridable = false;
        self
    }

    pub fn is_block(&self) -> bool {
        self.severity == Severity::Block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    #[default]
    Human,
    Agent,
}

/// Who is submitting an action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub kind: ActorKind,
}

impl Actor {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Human,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Agent,
        }
    }
}

/// Record of who approved lifting a block, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideAuthorization {
    pub authorized_by: String,
    pub reason: String,
}

/// Everything a rule may look at besides the action itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceContext {
    pub actor: Actor,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_authorization: Option<OverrideAuthorization>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Snapshot the action will run against. Filled in by the engine.
    #[serde(skip)]
    pub tree: Option<Arc<PageDefinition>>,
}

impl GovernanceContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            ..Self::default()
        }
    }

    /// Builder: mark the context elevated and attach an override.
    pub fn with_override(mut self, authorized_by: impl Into<String>, reason: impl Into<String>) -> Self {
        self.elevated = true;
        self.override_authorization = Some(OverrideAuthorization {
            authorized_by: authorized_by.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn with_tree(mut self, tree: Arc<PageDefinition>) -> Self {
        self.tree = Some(tree);
        self
    }
}

/// A pluggable policy check. Must be pure: no side effects, same answer for
/// the same action and context.
pub trait GovernanceRule: Send + Sync {
    fn id(&self) -> &str;
    fn evaluate(&self, action: &AtomicAction, ctx: &GovernanceContext) -> Vec<Violation>;
}

/// Adapter turning a closure into a rule.
pub struct FnRule<F> {
    id: String,
    check: F,
}

impl<F> FnRule<F>
where
    F: Fn(&AtomicAction, &GovernanceContext) -> Vec<Violation> + Send + Sync,
{
    pub fn new(id: impl Into<String>, check: F) -> Self {
        Self { id: id.into(), check }
    }
}

impl<F> GovernanceRule for FnRule<F>
where
    F: Fn(&AtomicAction, &GovernanceContext) -> Vec<Violation> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, action: &AtomicAction, ctx: &GovernanceContext) -> Vec<Violation> {
        (self.check)(action, ctx)
    }
}

/// Aggregate verdict for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    /// True when every block is overridable, so an elevated caller may lift it.
    pub allow_override: bool,
    /// The override that lifted the blocks, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_applied: Option<OverrideAuthorization>,
}

impl GateDecision {
    pub fn blocking(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_block())
    }

    pub fn warnings(&self) -> Vec<Violation> {
        self.violations.iter().filter(|v| !v.is_block()).cloned().collect()
    }

    /// `Err(GovernanceBlocked)` with the blocking violations when not allowed.
    pub fn into_result(self) -> Result<GateDecision, ActionError> {
        if self.allowed {
            return Ok(self);
        }
        Err(ActionError::GovernanceBlocked {
            violations: self.blocking().cloned().collect(),
        })
    }
}

#[derive(Clone, Default)]
pub struct GovernanceGate {
    rules: Vec<Arc<dyn GovernanceRule>>,
}

impl fmt::Debug for GovernanceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceGate")
            .field("rules", &self.rule_ids())
            .finish()
    }
}

impl GovernanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: impl GovernanceRule + 'static) {
        self.rules.push(Arc::new(rule));
    }

    pub fn with_rule(mut self, rule: impl GovernanceRule + 'static) -> Self {
        self.register(rule);
        self
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Evaluate every rule in registration order.
    pub fn check(&self, action: &AtomicAction, ctx: &GovernanceContext) -> GateDecision {
        let violations: Vec<Violation> = self
            .rules
            .iter()
            .flat_map(|rule| rule.evaluate(action, ctx))
            .collect();

        let blocks: Vec<&Violation> = violations.iter().filter(|v| v.is_block()).collect();
        let allow_override = !blocks.is_empty() && blocks.iter().all(|v| v.overridable);
        let override_applied = match &ctx.override_authorization {
            Some(auth) if allow_override && ctx.elevated => Some(auth.clone()),
            _ => None,
        };
        let allowed = blocks.is_empty() || override_applied.is_some();

        GateDecision {
            allowed,
            violations,
            allow_override,
            override_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::ComponentSelector;

    fn remove_header() -> AtomicAction {
        AtomicAction::RemoveComponent {
            selector: ComponentSelector::by_id("header"),
        }
    }

    fn gate() -> GovernanceGate {
        GovernanceGate::new()
            .with_rule(FnRule::new("always-warn", |_: &AtomicAction, _: &GovernanceContext| {
                vec![Violation::new("always-warn", "heads up", Severity::Warn)]
            }))
            .with_rule(FnRule::new("no-remove", |action: &AtomicAction, _: &GovernanceContext| {
                match action {
                    AtomicAction::RemoveComponent { .. } => {
                        vec![Violation::new("no-remove", "removal disabled", Severity::Block)]
                    }
                    _ => Vec::new(),
                }
            }))
    }

    #[test]
    fn violations_keep_registration_order() {
        let decision = gate().check(&remove_header(), &GovernanceContext::default());
        let ids: Vec<&str> = decision.violations.iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, ["always-warn", "no-remove"]);
        assert!(!decision.allowed);
        assert!(decision.allow_override);
        assert_eq!(decision.warnings().len(), 1);
        assert!(matches!(
            decision.into_result(),
            Err(ActionError::GovernanceBlocked { violations }) if violations.len() == 1
        ));
    }

    #[test]
    fn warnings_do_not_block() {
        let action = AtomicAction::UpdateLayout {
            selector: ComponentSelector::by_id("grid"),
            layout: serde_json::json!({}),
        };
        let decision = gate().check(&action, &GovernanceContext::default());
        assert!(decision.allowed);
        assert!(!decision.allow_override);
    }

    #[test]
    fn override_requires_elevation_and_authorization() {
        let mut ctx = GovernanceContext::new(Actor::human("ops")).with_override("lead", "launch day");
        let decision = gate().check(&remove_header(), &ctx);
        assert!(decision.allowed);
        assert_eq!(decision.override_applied.as_ref().unwrap().authorized_by, "lead");

        ctx.elevated = false;
        assert!(!gate().check(&remove_header(), &ctx).allowed);

        let hard = GovernanceGate::new().with_rule(FnRule::new("hard", |_: &AtomicAction, _: &GovernanceContext| {
            vec![Violation::new("hard", "never", Severity::Block).not_overridable()]
        }));
        let elevated = GovernanceContext::default().with_override("lead", "please");
        let decision = hard.check(&remove_header(), &elevated);
        assert!(!decision.allowed);
        assert!(!decision.allow_override);
        assert!(decision.override_applied.is_none());
    }

    #[test]
    fn check_is_deterministic() {
        let ctx = GovernanceContext::default();
        assert_eq!(gate().check(&remove_header(), &ctx), gate().check(&remove_header(), &ctx));
        assert_eq!(format!("{:?}", gate()), r#"GovernanceGate { rules: ["always-warn", "no-remove"] }"#);
    }
}
