//! Atomic actions: the unit of change submitted to the engine.

use sdui_path::PropertyPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ActionError;
use crate::model::Section;
use crate::selector::ComponentSelector;

/// Mutation operation applied at a property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Set,
    Merge,
    Append,
    Prepend,
    Remove,
    Replace,
}

/// One edit to a Section's props. `path` is relative to `props`; a leading
/// `props` step is accepted and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMutation {
    pub path: PropertyPath,
    pub operation: MutationOp,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl PropertyMutation {
    pub fn new(path: PropertyPath, operation: MutationOp, value: Value) -> Self {
        Self { path, operation, value }
    }

    /// Parse `path` and build a mutation.
    pub fn parse(path: &str, operation: MutationOp, value: Value) -> Result<Self, ActionError> {
        Ok(Self::new(PropertyPath::parse(path)?, operation, value))
    }
}

/// Where `add_component` puts the new Section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Position {
    Prepend,
    #[default]
    Append,
    BeforeId(String),
    AfterId(String),
}

/// A single logical change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AtomicAction {
    MutateComponent {
        selector: ComponentSelector,
        mutations: Vec<PropertyMutation>,
    },
    #[serde(rename_all = "camelCase")]
    AddComponent {
        section: Section,
        #[serde(default)]
        position: Position,
        /// Container for `prepend`/`append`; top level when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    RemoveComponent {
        selector: ComponentSelector,
    },
    #[serde(rename_all = "camelCase")]
    ReorderComponents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        order: Vec<String>,
    },
    UpdateLayout {
        selector: ComponentSelector,
        layout: Value,
    },
    Batch {
        actions: Vec<AtomicAction>,
    },
}

impl AtomicAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AtomicAction::MutateComponent { .. } => "mutate_component",
            AtomicAction::AddComponent { .. } => "add_component",
            AtomicAction::RemoveComponent { .. } => "remove_component",
            AtomicAction::ReorderComponents { .. } => "reorder_components",
            AtomicAction::UpdateLayout { .. } => "update_layout",
            AtomicAction::Batch { .. } => "batch",
        }
    }

    /// Non-batch actions, with nested batches flattened in order.
    pub fn leaves(&self) -> Vec<&AtomicAction> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }

    /// Every value this action would write into the tree.
    pub fn written_values(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        for leaf in self.leaves() {
            match leaf {
                AtomicAction::MutateComponent { mutations, .. } => {
                    out.extend(mutations.iter().map(|m| &m.value));
                }
                AtomicAction::AddComponent { section, .. } => collect_section_values(section, &mut out),
                AtomicAction::UpdateLayout { layout, .. } => out.push(layout),
                _ => {}
            }
        }
        out
    }
}

fn collect_leaves<'a>(action: &'a AtomicAction, out: &mut Vec<&'a AtomicAction>) {
    match action {
        AtomicAction::Batch { actions } => actions.iter().for_each(|a| collect_leaves(a, out)),
        other => out.push(other),
    }
}

fn collect_section_values<'a>(section: &'a Section, out: &mut Vec<&'a Value>) {
    out.extend(section.props.values());
    if let Some(layout) = &section.layout {
        out.push(layout);
    }
    for child in section.children.iter().flatten() {
        collect_section_values(child, out);
    }
}
