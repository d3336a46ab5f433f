//! Atomic mutation applier.
//!
//! [`apply_action`] runs an action against a working copy of the tree. On
//! success the copy becomes the new tree with `version + 1`; on any failure
//! the input tree is returned untouched, so a failing batch step never leaks
//! the effects of the steps before it.

use std::sync::Arc;

use sdui_path::PropertyPath;
use serde_json::Value;

use crate::action::{AtomicAction, MutationOp, Position, PropertyMutation};
use crate::delta::{apply_section_op, Footprint, SectionOp, Touch, TreeDelta};
use crate::error::{ActionError, ActionResult};
use crate::model::{PageDefinition, Section, SectionState};
use crate::selector::{resolve_one, ComponentSelector};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApplyOptions {
    /// Minimum confidence for a selector match to count as a target.
    pub confidence_threshold: f64,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// The result of applying one action.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The new tree on success, the unchanged input on failure.
    pub tree: PageDefinition,
    pub result: ActionResult,
    /// Ops that turn the input tree into `tree` (empty on failure).
    pub delta: TreeDelta,
    pub footprint: Footprint,
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        self.result.success
    }
}

/// Apply `action` to `tree`.
///
/// # Example
///
/// ```
/// use sdui_engine::{apply_action, ApplyOptions, AtomicAction, ComponentSelector, MutationOp,
///     PageDefinition, PropertyMutation, Section};
/// use serde_json::json;
///
/// let tree = PageDefinition::new(vec![
///     Section::new("chart1", "InteractiveChart").with_props(json!({"type": "line"})),
/// ]);
/// let action = AtomicAction::MutateComponent {
///     selector: ComponentSelector::by_id("chart1"),
///     mutations: vec![PropertyMutation::parse("props.type", MutationOp::Set, json!("bar")).unwrap()],
/// };
/// let outcome = apply_action(&tree, &action, &ApplyOptions::default());
/// assert!(outcome.result.success);
/// assert_eq!(outcome.tree.version, 1);
/// assert_eq!(outcome.tree.section("chart1").unwrap().props["type"], json!("bar"));
/// ```
pub fn apply_action(tree: &PageDefinition, action: &AtomicAction, options: &ApplyOptions) -> ApplyOutcome {
    let mut work = Working {
        tree: tree.clone(),
        delta: TreeDelta::new(),
        footprint: Footprint::default(),
        options,
    };

    let applied = match action {
        AtomicAction::Batch { actions } if !actions.is_empty() => actions
            .iter()
            .enumerate()
            .try_for_each(|(step, sub)| work.run(sub).map_err(|err| (Some(step), err))),
        other => work.run(other).map_err(|err| (None, err)),
    };

    match applied {
        Ok(()) => {
            let mut next = work.tree;
            next.version = tree.version + 1;
            let result = ActionResult::success(next.version, work.delta.section_ids());
            ApplyOutcome {
                tree: next,
                result,
                delta: work.delta,
                footprint: work.footprint,
            }
        }
        Err((step, error)) => ApplyOutcome {
            tree: tree.clone(),
            result: ActionResult::failure(tree.version, error).with_failed_step(step),
            delta: TreeDelta::new(),
            footprint: Footprint::default(),
        },
    }
}

struct Working<'o> {
    tree: PageDefinition,
    delta: TreeDelta,
    footprint: Footprint,
    options: &'o ApplyOptions,
}

impl Working<'_> {
    fn run(&mut self, action: &AtomicAction) -> Result<(), ActionError> {
        match action {
            AtomicAction::MutateComponent { selector, mutations } => self.mutate(selector, mutations),
            AtomicAction::AddComponent {
                section,
                position,
                parent_id,
            } => self.add(section, position, parent_id.as_deref()),
            AtomicAction::RemoveComponent { selector } => self.remove(selector),
            AtomicAction::ReorderComponents { parent_id, order } => self.reorder(parent_id.as_deref(), order),
            AtomicAction::UpdateLayout { selector, layout } => self.update_layout(selector, layout),
            AtomicAction::Batch { actions } => {
                if actions.is_empty() {
                    return Err(ActionError::malformed("batch has no actions"));
                }
                actions.iter().try_for_each(|a| self.run(a))
            }
        }
    }

    fn commit(&mut self, op: SectionOp) -> Result<(), ActionError> {
        apply_section_op(&mut self.tree, &op).map_err(|e| ActionError::malformed(e.to_string()))?;
        self.delta.push(op);
        Ok(())
    }

    fn target(&self, selector: &ComponentSelector) -> Result<String, ActionError> {
        resolve_one(&self.tree, selector, self.options.confidence_threshold).map(|m| m.section_id)
    }

    fn mutate(&mut self, selector: &ComponentSelector, mutations: &[PropertyMutation]) -> Result<(), ActionError> {
        if mutations.is_empty() {
            return Err(ActionError::malformed("mutate_component has no mutations"));
        }
        let id = self.target(selector)?;
        let before = self.state_of(&id)?;

        let mut props = Value::Object(before.props.clone());
        for mutation in mutations {
            let path = mutation.path.strip_key_prefix("props");
            apply_mutation(&mut props, &path, mutation.operation, mutation.value.clone())?;
            self.footprint.touch(if path.is_root() {
                Touch::Section { id: id.clone() }
            } else {
                Touch::Property { id: id.clone(), path }
            });
        }
        let Value::Object(props) = props else {
            return Err(ActionError::InvalidPath {
                path: "props".into(),
                reason: "props must remain a mapping".into(),
            });
        };

        let after = SectionState {
            props,
            layout: before.layout.clone(),
        };
        self.commit(SectionOp::Update { id, before, after })
    }

    fn add(&mut self, section: &Section, position: &Position, parent_id: Option<&str>) -> Result<(), ActionError> {
        let new_ids = section.subtree_ids();
        for (i, id) in new_ids.iter().enumerate() {
            if id.is_empty() {
                return Err(ActionError::malformed("section id must not be empty"));
            }
            if new_ids[..i].contains(id) {
                return Err(ActionError::malformed(format!("id `{id}` appears twice in the new section")));
            }
            if self.tree.contains_id(id) {
                return Err(ActionError::malformed(format!("id `{id}` already exists")));
            }
            if self.tree.retired_ids.contains(id) {
                return Err(ActionError::malformed(format!("id `{id}` was used by a removed section")));
            }
        }

        let (parent, index) = match position {
            Position::Prepend | Position::Append => {
                let len = self.container(parent_id)?.len();
                let index = if *position == Position::Prepend { 0 } else { len };
                (parent_id.map(str::to_string), index)
            }
            Position::BeforeId(anchor) | Position::AfterId(anchor) => {
                let entry = self.tree.find(anchor).ok_or_else(|| ActionError::SelectorNotFound {
                    selector: ComponentSelector::by_id(anchor.as_str()).to_string(),
                })?;
                if parent_id.is_some() && parent_id != entry.parent {
                    return Err(ActionError::malformed(format!(
                        "`{anchor}` is not a child of `{}`",
                        parent_id.unwrap_or_default()
                    )));
                }
                let offset = usize::from(matches!(position, Position::AfterId(_)));
                (entry.parent.map(str::to_string), entry.index + offset)
            }
        };

        self.footprint.touch(Touch::Section {
            id: section.id.clone(),
        });
        self.footprint.touch(Touch::Children { parent: parent.clone() });
        self.commit(SectionOp::Insert {
            parent,
            index,
            section: Arc::new(section.clone()),
            retires: false,
        })
    }

    fn remove(&mut self, selector: &ComponentSelector) -> Result<(), ActionError> {
        let id = self.target(selector)?;
        let (parent, index, section) = {
            let entry = self.tree.find(&id).ok_or_else(|| not_found(&id))?;
            (entry.parent.map(str::to_string), entry.index, entry.section.clone())
        };
        for removed in section.subtree_ids() {
            self.footprint.touch(Touch::Section { id: removed });
        }
        self.footprint.touch(Touch::Children { parent: parent.clone() });
        self.commit(SectionOp::Remove {
            parent,
            index,
            section,
            retires: true,
        })
    }

    fn reorder(&mut self, parent_id: Option<&str>, order: &[String]) -> Result<(), ActionError> {
        let current: Vec<String> = self.container(parent_id)?.iter().map(|s| s.id.clone()).collect();
        let mut wanted = order.to_vec();
        wanted.sort();
        let mut existing = current.clone();
        existing.sort();
        if wanted != existing {
            return Err(ActionError::malformed(format!(
                "order {order:?} is not a permutation of the children of {}",
                parent_id.unwrap_or("the page")
            )));
        }
        let parent = parent_id.map(str::to_string);
        self.footprint.touch(Touch::Children { parent: parent.clone() });
        self.commit(SectionOp::Reorder {
            parent,
            before: current,
            after: order.to_vec(),
        })
    }

    fn update_layout(&mut self, selector: &ComponentSelector, layout: &Value) -> Result<(), ActionError> {
        let id = self.target(selector)?;
        let section = self.tree.section(&id).ok_or_else(|| not_found(&id))?;
        if !section.is_container() {
            return Err(ActionError::malformed(format!("`{id}` is not a container")));
        }
        let before = section.state();
        let after = SectionState {
            props: before.props.clone(),
            layout: Some(layout.clone()),
        };
        self.footprint.touch(Touch::Layout { id: id.clone() });
        self.commit(SectionOp::Update { id, before, after })
    }

    fn state_of(&self, id: &str) -> Result<SectionState, ActionError> {
        self.tree.section(id).map(Section::state).ok_or_else(|| not_found(id))
    }

    /// Child list of `parent_id`, or the top level.
    fn container(&self, parent_id: Option<&str>) -> Result<&[Arc<Section>], ActionError> {
        if let Some(children) = self.tree.children(parent_id) {
            return Ok(children);
        }
        match parent_id {
            Some(id) if self.tree.contains_id(id) => Err(ActionError::malformed(format!("`{id}` is not a container"))),
            Some(id) => Err(not_found(id)),
            None => Ok(&[]),
        }
    }
}

fn not_found(id: &str) -> ActionError {
    ActionError::SelectorNotFound {
        selector: ComponentSelector::by_id(id).to_string(),
    }
}

fn apply_mutation(props: &mut Value, path: &PropertyPath, op: MutationOp, value: Value) -> Result<(), ActionError> {
    match op {
        MutationOp::Set => sdui_path::set(props, path, value).map(|_| ()),
        MutationOp::Replace => sdui_path::replace(props, path, value).map(|_| ()),
        MutationOp::Merge => sdui_path::merge(props, path, value),
        MutationOp::Append => sdui_path::append(props, path, value),
        MutationOp::Prepend => sdui_path::prepend(props, path, value),
        MutationOp::Remove => sdui_path::remove(props, path).map(|_| ()),
    }
    .map_err(ActionError::from)
}
