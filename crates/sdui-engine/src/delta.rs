//! Section-level tree deltas.
//!
//! Every successful action is recorded as a [`TreeDelta`]: an ordered list of
//! [`SectionOp`]s, each carrying enough of the prior state to be reversed.
//! The same delta is broadcast to subscribers as the diff form of a patch and
//! inverted by the optimistic executor to roll an action back.

use std::collections::BTreeSet;
use std::sync::Arc;

use sdui_path::PropertyPath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{PageDefinition, Section, SectionState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("unknown section `{0}`")]
    UnknownSection(String),
    #[error("unknown container `{}`", .0.as_deref().unwrap_or("<root>"))]
    UnknownContainer(Option<String>),
    #[error("index {index} out of bounds in `{}`", .parent.as_deref().unwrap_or("<root>"))]
    IndexOutOfBounds { parent: Option<String>, index: usize },
    #[error("tree diverged from the delta at `{0}`")]
    Diverged(String),
}

/// One structural or state change to a single Section or child list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SectionOp {
    Update {
        id: String,
        before: SectionState,
        after: SectionState,
    },
    /// Insert a subtree. With `retires` set, its ids leave the retired set.
    Insert {
        parent: Option<String>,
        index: usize,
        section: Arc<Section>,
        #[serde(default)]
        retires: bool,
    },
    /// Remove a subtree. With `retires` set, its ids join the retired set.
    Remove {
        parent: Option<String>,
        index: usize,
        section: Arc<Section>,
        #[serde(default)]
        retires: bool,
    },
    Reorder {
        parent: Option<String>,
        before: Vec<String>,
        after: Vec<String>,
    },
}

impl SectionOp {
    pub fn inverted(&self) -> SectionOp {
        match self.clone() {
            SectionOp::Update { id, before, after } => SectionOp::Update {
                id,
                before: after,
                after: before,
            },
            SectionOp::Insert {
                parent,
                index,
                section,
                retires,
            } => SectionOp::Remove {
                parent,
                index,
                section,
                retires,
            },
            SectionOp::Remove {
                parent,
                index,
                section,
                retires,
            } => SectionOp::Insert {
                parent,
                index,
                section,
                retires,
            },
            SectionOp::Reorder { parent, before, after } => SectionOp::Reorder {
                parent,
                before: after,
                after: before,
            },
        }
    }

    /// Ids of Sections this op directly changes.
    pub fn section_ids(&self) -> Vec<String> {
        match self {
            SectionOp::Update { id, .. } => vec![id.clone()],
            SectionOp::Insert { section, .. } | SectionOp::Remove { section, .. } => vec![section.id.clone()],
            SectionOp::Reorder { after, .. } => after.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeDelta {
    pub ops: Vec<SectionOp>,
}

impl TreeDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: SectionOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The delta that undoes this one: ops reversed, each op inverted.
    pub fn inverted(&self) -> TreeDelta {
        TreeDelta {
            ops: self.ops.iter().rev().map(SectionOp::inverted).collect(),
        }
    }

    /// Affected Section ids, first occurrence order.
    pub fn section_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for id in self.ops.iter().flat_map(SectionOp::section_ids) {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
        out
    }
}

/// Apply a delta to a copy of `tree`. The version is left untouched; callers
/// own version bookkeeping.
pub fn apply_delta(tree: &PageDefinition, delta: &TreeDelta) -> Result<PageDefinition, DeltaError> {
    let mut work = tree.clone();
    for op in &delta.ops {
        apply_section_op(&mut work, op)?;
    }
    Ok(work)
}

pub(crate) fn apply_section_op(tree: &mut PageDefinition, op: &SectionOp) -> Result<(), DeltaError> {
    match op {
        SectionOp::Update { id, before, after } => {
            let section = tree
                .section_mut(id)
                .ok_or_else(|| DeltaError::UnknownSection(id.clone()))?;
            if section.props != before.props || section.layout != before.layout {
                return Err(DeltaError::Diverged(id.clone()));
            }
            section.props = after.props.clone();
            section.layout = after.layout.clone();
        }
        SectionOp::Insert {
            parent,
            index,
            section,
            retires,
        } => {
            let children = tree
                .children_mut(parent.as_deref())
                .ok_or_else(|| DeltaError::UnknownContainer(parent.clone()))?;
            if *index > children.len() {
                return Err(DeltaError::IndexOutOfBounds {
                    parent: parent.clone(),
                    index: *index,
                });
            }
            children.insert(*index, section.clone());
            if *retires {
                for id in section.subtree_ids() {
                    tree.retired_ids.remove(&id);
                }
            }
        }
        SectionOp::Remove {
            parent,
            index,
            section,
            retires,
        } => {
            let children = tree
                .children_mut(parent.as_deref())
                .ok_or_else(|| DeltaError::UnknownContainer(parent.clone()))?;
            match children.get(*index) {
                Some(existing) if existing.id == section.id => {}
                Some(_) => return Err(DeltaError::Diverged(section.id.clone())),
                None => {
                    return Err(DeltaError::IndexOutOfBounds {
                        parent: parent.clone(),
                        index: *index,
                    })
                }
            }
            let removed = children.remove(*index);
            if *retires {
                tree.retired_ids.extend(removed.subtree_ids());
            }
        }
        SectionOp::Reorder { parent, before, after } => {
            let children = tree
                .children_mut(parent.as_deref())
                .ok_or_else(|| DeltaError::UnknownContainer(parent.clone()))?;
            let current: Vec<&str> = children.iter().map(|s| s.id.as_str()).collect();
            if current != before.iter().map(String::as_str).collect::<Vec<_>>() {
                return Err(DeltaError::Diverged(parent.clone().unwrap_or_default()));
            }
            let mut reordered = Vec::with_capacity(children.len());
            for id in after {
                let node = children
                    .iter()
                    .find(|s| &s.id == id)
                    .ok_or_else(|| DeltaError::UnknownSection(id.clone()))?;
                reordered.push(node.clone());
            }
            *children = reordered;
        }
    }
    Ok(())
}

// ── Footprint ─────────────────────────────────────────────────────────────

/// One thing an action touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Touch {
    /// The whole Section (added or removed).
    Section { id: String },
    /// A property path inside a Section's props.
    Property { id: String, path: PropertyPath },
    /// A container's layout directive.
    Layout { id: String },
    /// The child list of a container (`None` = top level).
    Children { parent: Option<String> },
}

impl Touch {
    fn section_id(&self) -> Option<&str> {
        match self {
            Touch::Section { id } | Touch::Property { id, .. } | Touch::Layout { id } => Some(id),
            Touch::Children { parent } => parent.as_deref(),
        }
    }

    /// True if the two touches can write the same state.
    fn overlaps(&self, other: &Touch) -> bool {
        match (self, other) {
            (Touch::Children { parent: a }, Touch::Children { parent: b }) => a == b,
            (Touch::Children { .. }, _) | (_, Touch::Children { .. }) => false,
            (Touch::Property { id: a, path: p }, Touch::Property { id: b, path: q }) => a == b && p.overlaps(q),
            (Touch::Layout { id: a }, Touch::Layout { id: b }) => a == b,
            (Touch::Layout { .. }, Touch::Property { .. }) | (Touch::Property { .. }, Touch::Layout { .. }) => false,
            (a, b) => a.section_id() == b.section_id(),
        }
    }
}

/// Everything an applied action touched, used for conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Footprint {
    touches: BTreeSet<Touch>,
}

impl Footprint {
    pub fn touch(&mut self, touch: Touch) {
        self.touches.insert(touch);
    }

    pub fn extend(&mut self, other: Footprint) {
        self.touches.extend(other.touches);
    }

    pub fn touches(&self) -> impl Iterator<Item = &Touch> {
        self.touches.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.touches.is_empty()
    }

    /// Section ids named by any touch. Child-list touches name their
    /// container; top-level child-list touches name nothing.
    pub fn section_ids(&self) -> BTreeSet<String> {
        self.touches
            .iter()
            .filter_map(|t| t.section_id().map(str::to_string))
            .collect()
    }

    /// Coarse overlap: both footprints name a common Section, or both
    /// rewrite the same child list.
    pub fn overlaps_sections(&self, other: &Footprint) -> bool {
        let mine = self.section_ids();
        if other.section_ids().iter().any(|id| mine.contains(id)) {
            return true;
        }
        self.touches.iter().any(|a| {
            matches!(a, Touch::Children { .. }) && other.touches.iter().any(|b| a.overlaps(b))
        })
    }

    /// Fine overlap: some pair of touches can write the same state.
    pub fn overlaps_paths(&self, other: &Footprint) -> bool {
        self.touches
            .iter()
            .any(|a| other.touches.iter().any(|b| a.overlaps(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> PageDefinition {
        PageDefinition::new(vec![
            Section::new("a", "Text").with_props(json!({"text": "hi"})),
            Section::new("box", "Container").with_children(vec![Section::new("b", "Text")]),
        ])
    }

    #[test]
    fn delta_then_inverse_restores_tree() {
        let original = tree();
        let mut after = original.state_of("a");
        after.props.insert("text".into(), json!("bye"));
        let delta = TreeDelta {
            ops: vec![
                SectionOp::Update {
                    id: "a".into(),
                    before: original.state_of("a"),
                    after,
                },
                SectionOp::Insert {
                    parent: Some("box".into()),
                    index: 1,
                    section: Arc::new(Section::new("c", "Text")),
                    retires: false,
                },
                SectionOp::Reorder {
                    parent: None,
                    before: vec!["a".into(), "box".into()],
                    after: vec!["box".into(), "a".into()],
                },
                SectionOp::Remove {
                    parent: Some("box".into()),
                    index: 0,
                    section: original.find("b").unwrap().section.clone(),
                    retires: true,
                },
            ],
        };
        let changed = apply_delta(&original, &delta).unwrap();
        assert_eq!(changed.child_ids(None).unwrap(), ["box", "a"]);
        assert_eq!(changed.child_ids(Some("box")).unwrap(), ["c"]);
        assert!(changed.retired_ids.contains("b"));

        let restored = apply_delta(&changed, &delta.inverted()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn diverged_update_is_rejected() {
        let original = tree();
        let mut stale = original.state_of("a");
        stale.props.insert("text".into(), json!("something else"));
        let op = SectionOp::Update {
            id: "a".into(),
            before: stale,
            after: original.state_of("a"),
        };
        let err = apply_delta(&original, &TreeDelta { ops: vec![op] }).unwrap_err();
        assert_eq!(err, DeltaError::Diverged("a".into()));
    }

    #[test]
    fn footprint_overlap_granularity() {
        let mut color = Footprint::default();
        color.touch(Touch::Property {
            id: "chart".into(),
            path: PropertyPath::parse("style.color").unwrap(),
        });
        let mut title = Footprint::default();
        title.touch(Touch::Property {
            id: "chart".into(),
            path: PropertyPath::parse("title").unwrap(),
        });
        let mut style = Footprint::default();
        style.touch(Touch::Property {
            id: "chart".into(),
            path: PropertyPath::parse("style").unwrap(),
        });

        assert!(color.overlaps_sections(&title));
        assert!(!color.overlaps_paths(&title));
        assert!(color.overlaps_paths(&style));

        let mut removal = Footprint::default();
        removal.touch(Touch::Section { id: "chart".into() });
        assert!(removal.overlaps_paths(&title));

        let mut reorder = Footprint::default();
        reorder.touch(Touch::Children { parent: None });
        let mut add = Footprint::default();
        add.touch(Touch::Section { id: "new".into() });
        add.touch(Touch::Children { parent: None });
        assert!(reorder.overlaps_sections(&add));
        assert!(!reorder.overlaps_sections(&title));
    }

    impl PageDefinition {
        fn state_of(&self, id: &str) -> SectionState {
            self.section(id).unwrap().state()
        }
    }
}
