//! The page definition tree.
//!
//! A [`PageDefinition`] owns an ordered list of [`Section`] nodes. Children are
//! held behind `Arc` so edits are copy-on-write: [`PageDefinition::section_mut`]
//! and [`PageDefinition::children_mut`] clone only the nodes on the path from
//! the root to the edited Section, and every other subtree stays shared with
//! the previous version of the tree.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node in the UI tree: a component instance or a layout container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub component_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Arc<Section>>>,
}

impl Section {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            props: Map::new(),
            layout: None,
            children: None,
        }
    }

    /// Builder: set props from a JSON mapping. Non-mapping values are ignored.
    pub fn with_props(mut self, props: Value) -> Self {
        if let Value::Object(map) = props {
            self.props = map;
        }
        self
    }

    pub fn with_layout(mut self, layout: Value) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Builder: make this Section a container holding `children`.
    pub fn with_children(mut self, children: Vec<Section>) -> Self {
        self.children = Some(children.into_iter().map(Arc::new).collect());
        self
    }

    pub fn is_container(&self) -> bool {
        self.children.is_some()
    }

    /// Ids of this Section and all of its descendants, in document order.
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_ids(self, &mut out);
        out
    }

    pub fn state(&self) -> SectionState {
        SectionState {
            props: self.props.clone(),
            layout: self.layout.clone(),
        }
    }
}

fn collect_ids(section: &Section, out: &mut Vec<String>) {
    out.push(section.id.clone());
    for child in section.children.iter().flatten() {
        collect_ids(child, out);
    }
}

/// The mutable, non-structural part of a Section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionState {
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
}

/// The root, versioned UI tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDefinition {
    pub version: u64,
    #[serde(default)]
    pub sections: Vec<Arc<Section>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Ids that were removed from the tree and may not be assigned again.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub retired_ids: BTreeSet<String>,
}

/// A Section together with where it sits in the tree.
#[derive(Debug, Clone, Copy)]
pub struct SectionEntry<'a> {
    pub section: &'a Arc<Section>,
    /// Id of the containing Section, `None` for top-level Sections.
    pub parent: Option<&'a str>,
    /// Position among its siblings.
    pub index: usize,
    /// Position in a depth-first, pre-order walk of the whole tree.
    pub order: usize,
}

impl PageDefinition {
    pub fn new(sections: Vec<Section>) -> Self {
        Self {
            version: 0,
            sections: sections.into_iter().map(Arc::new).collect(),
            metadata: Map::new(),
            retired_ids: BTreeSet::new(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Every Section in document order (depth-first, pre-order).
    pub fn entries(&self) -> Vec<SectionEntry<'_>> {
        let mut out = Vec::new();
        walk(&self.sections, None, &mut out);
        out
    }

    pub fn find(&self, id: &str) -> Option<SectionEntry<'_>> {
        self.entries().into_iter().find(|e| e.section.id == id)
    }

    pub fn section(&self, id: &str) -> Option<&Section> {
        self.find(id).map(|e| e.section.as_ref())
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Children of a container, or the top-level Sections for `None`.
    /// Returns `None` if the parent does not exist or is not a container.
    pub fn children(&self, parent: Option<&str>) -> Option<&[Arc<Section>]> {
        match parent {
            None => Some(&self.sections),
            Some(id) => self.section(id)?.children.as_deref(),
        }
    }

    pub fn child_ids(&self, parent: Option<&str>) -> Option<Vec<String>> {
        self.children(parent)
            .map(|c| c.iter().map(|s| s.id.clone()).collect())
    }

    /// Copy-on-write access to a Section.
    pub fn section_mut(&mut self, id: &str) -> Option<&mut Section> {
        let path = self.index_path(id)?;
        section_at_mut(&mut self.sections, &path)
    }

    /// Copy-on-write access to a container's child list.
    pub fn children_mut(&mut self, parent: Option<&str>) -> Option<&mut Vec<Arc<Section>>> {
        match parent {
            None => Some(&mut self.sections),
            Some(id) => self.section_mut(id)?.children.as_mut(),
        }
    }

    /// Index of each ancestor on the way down to `id`.
    fn index_path(&self, id: &str) -> Option<Vec<usize>> {
        let mut path = Vec::new();
        if find_path(&self.sections, id, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    /// Check that no id occurs twice anywhere in the tree.
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dupes = Vec::new();
        for entry in self.entries() {
            if !seen.insert(entry.section.id.as_str()) {
                dupes.push(entry.section.id.clone());
            }
        }
        dupes
    }
}

fn walk<'a>(sections: &'a [Arc<Section>], parent: Option<&'a str>, out: &mut Vec<SectionEntry<'a>>) {
    for (index, section) in sections.iter().enumerate() {
        let order = out.len();
        out.push(SectionEntry {
            section,
            parent,
            index,
            order,
        });
        if let Some(children) = &section.children {
            walk(children, Some(section.id.as_str()), out);
        }
    }
}

fn find_path(sections: &[Arc<Section>], id: &str, path: &mut Vec<usize>) -> bool {
    for (i, section) in sections.iter().enumerate() {
        path.push(i);
        if section.id == id {
            return true;
        }
        if let Some(children) = &section.children {
            if find_path(children, id, path) {
                return true;
            }
        }
        path.pop();
    }
    false
}

fn section_at_mut<'a>(sections: &'a mut Vec<Arc<Section>>, path: &[usize]) -> Option<&'a mut Section> {
    let (first, rest) = path.split_first()?;
    let node = Arc::make_mut(sections.get_mut(*first)?);
    if rest.is_empty() {
        return Some(node);
    }
    section_at_mut(node.children.as_mut()?, rest)
}
