//! Component selector resolution.
//!
//! [`resolve`] scores every Section against a [`ComponentSelector`] and
//! returns ranked [`MatchResult`]s. Scoring is a fixed, deterministic
//! pipeline over static signals:
//!
//! | signal                 | weight |
//! |------------------------|--------|
//! | `componentType`        | 0.4    |
//! | `propsPredicate`       | 0.4, proportional to matching keys |
//! | description alias hit  | 0.3    |
//! | description text hit   | 0.2, proportional to matching terms |
//!
//! Confidence is the weight achieved divided by the weight available to the
//! criteria the selector actually supplies. An `id` that exists
//! short-circuits to 1.0.

use std::fmt;

use sdui_path::{PathStep, PropertyPath};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ActionError;
use crate::model::{PageDefinition, Section, SectionEntry};

pub const TYPE_WEIGHT: f64 = 0.4;
pub const PROPS_WEIGHT: f64 = 0.4;
pub const ALIAS_WEIGHT: f64 = 0.3;
pub const TEXT_WEIGHT: f64 = 0.2;

/// Synonyms in free-text descriptions, mapped to component types.
pub const ALIASES: &[(&str, &str)] = &[
    ("chart", "InteractiveChart"),
    ("graph", "InteractiveChart"),
    ("plot", "InteractiveChart"),
    ("metric", "StatCard"),
    ("kpi", "StatCard"),
    ("card", "StatCard"),
    ("stat", "StatCard"),
    ("table", "DataTable"),
    ("grid", "DataTable"),
    ("text", "TextBlock"),
    ("paragraph", "TextBlock"),
    ("copy", "TextBlock"),
    ("header", "Header"),
    ("heading", "Header"),
    ("title", "Header"),
    ("button", "Button"),
    ("cta", "Button"),
    ("image", "Image"),
    ("picture", "Image"),
    ("photo", "Image"),
    ("list", "List"),
    ("form", "Form"),
    ("container", "Container"),
    ("section", "Container"),
    ("row", "Container"),
    ("column", "Container"),
];

/// A query for Sections. Every field is optional; at least one is required.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props_predicate: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ComponentSelector {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn by_type(component_type: impl Into<String>) -> Self {
        Self {
            component_type: Some(component_type.into()),
            ..Self::default()
        }
    }

    pub fn by_description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Builder: props predicate from a JSON mapping.
    pub fn with_props(mut self, predicate: Value) -> Self {
        if let Value::Object(map) = predicate {
            self.props_predicate = Some(map);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.component_type.is_none()
            && self.index.is_none()
            && self.props_predicate.as_ref().map_or(true, Map::is_empty)
            && self.description.as_deref().map_or(true, |d| d.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        if self.is_empty() {
            return Err(ActionError::malformed("selector has no criteria"));
        }
        Ok(())
    }
}

impl fmt::Display for ComponentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.id {
            parts.push(format!("id={id}"));
        }
        if let Some(t) = &self.component_type {
            parts.push(format!("type={t}"));
        }
        if let Some(i) = self.index {
            parts.push(format!("index={i}"));
        }
        if let Some(p) = &self.props_predicate {
            parts.push(format!("props={}", Value::Object(p.clone())));
        }
        if let Some(d) = &self.description {
            parts.push(format!("description={d:?}"));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// One candidate Section for a selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub section_id: String,
    pub confidence: f64,
    pub match_reasons: Vec<String>,
}

/// Resolve a selector against a tree, best match first.
///
/// Never fails: an empty or unmatched selector yields an empty list. Ties
/// keep document order.
pub fn resolve(tree: &PageDefinition, selector: &ComponentSelector) -> Vec<MatchResult> {
    if selector.is_empty() {
        return Vec::new();
    }

    if let Some(id) = &selector.id {
        return match tree.find(id) {
            Some(entry) if type_allows(selector, &entry.section.component_type) => vec![MatchResult {
                section_id: id.clone(),
                confidence: 1.0,
                match_reasons: vec!["id match".to_string()],
            }],
            _ => Vec::new(),
        };
    }

    let description = selector.description.as_deref().map(DescriptionTerms::parse);
    let entries = tree.entries();

    let mut scored: Vec<(SectionEntry<'_>, MatchResult)> = if has_scoring_criteria(selector, description.as_ref()) {
        entries
            .iter()
            .filter_map(|entry| score(entry.section, selector, description.as_ref()).map(|m| (*entry, m)))
            .collect()
    } else {
        // Index only: position among the top-level Sections.
        entries
            .iter()
            .filter(|e| e.parent.is_none())
            .map(|e| {
                (
                    *e,
                    MatchResult {
                        section_id: e.section.id.clone(),
                        confidence: 1.0,
                        match_reasons: Vec::new(),
                    },
                )
            })
            .collect()
    };

    if let Some(index) = selector.index {
        // Only Sections the props predicate actually hit take a position.
        if let Some(predicate) = selector.props_predicate.as_ref().filter(|p| !p.is_empty()) {
            scored.retain(|(entry, _)| predicate_hits(&entry.section.props, predicate) > 0);
        }
        if index >= scored.len() {
            return Vec::new();
        }
        let (entry, mut chosen) = scored.swap_remove(index);
        chosen.match_reasons.push(match &selector.component_type {
            Some(t) => format!("index {index} among {t}"),
            None if entry.parent.is_none() && !has_scoring_criteria(selector, description.as_ref()) => {
                format!("index {index} among top-level sections")
            }
            None => format!("index {index} among matches"),
        });
        return vec![chosen];
    }

    // Stable sort keeps document order among equal scores.
    let mut results: Vec<MatchResult> = scored.into_iter().map(|(_, m)| m).collect();
    results.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    results
}

/// Resolve to exactly one Section at or above `threshold`.
pub fn resolve_one(
    tree: &PageDefinition,
    selector: &ComponentSelector,
    threshold: f64,
) -> Result<MatchResult, ActionError> {
    selector.validate()?;
    let mut above: Vec<MatchResult> = resolve(tree, selector)
        .into_iter()
        .filter(|m| m.confidence >= threshold)
        .collect();
    match above.len() {
        0 => Err(ActionError::SelectorNotFound {
            selector: selector.to_string(),
        }),
        1 => Ok(above.remove(0)),
        _ => Err(ActionError::SelectorAmbiguous {
            selector: selector.to_string(),
            candidates: above.into_iter().map(|m| m.section_id).collect(),
        }),
    }
}

fn type_allows(selector: &ComponentSelector, component_type: &str) -> bool {
    selector
        .component_type
        .as_deref()
        .map_or(true, |t| t.eq_ignore_ascii_case(component_type))
}

fn has_scoring_criteria(selector: &ComponentSelector, description: Option<&DescriptionTerms>) -> bool {
    selector.component_type.is_some()
        || selector.props_predicate.as_ref().is_some_and(|p| !p.is_empty())
        || description.is_some_and(|d| !d.is_empty())
}

fn score(section: &Section, selector: &ComponentSelector, description: Option<&DescriptionTerms>) -> Option<MatchResult> {
    let mut available = 0.0;
    let mut achieved = 0.0;
    let mut reasons = Vec::new();

    if let Some(wanted) = &selector.component_type {
        if !wanted.eq_ignore_ascii_case(&section.component_type) {
            return None;
        }
        available += TYPE_WEIGHT;
        achieved += TYPE_WEIGHT;
        reasons.push("type match".to_string());
    }

    if let Some(predicate) = selector.props_predicate.as_ref().filter(|p| !p.is_empty()) {
        available += PROPS_WEIGHT;
        let hits = predicate_hits(&section.props, predicate);
        if hits > 0 {
            let fraction = hits as f64 / predicate.len() as f64;
            achieved += PROPS_WEIGHT * fraction;
            reasons.push(format!("props match {}%", (fraction * 100.0).round()));
        }
    }

    if let Some(terms) = description.filter(|d| !d.is_empty()) {
        if !terms.aliases.is_empty() {
            available += ALIAS_WEIGHT;
            if let Some((word, ty)) = terms
                .aliases
                .iter()
                .find(|(_, ty)| ty.eq_ignore_ascii_case(&section.component_type))
            {
                achieved += ALIAS_WEIGHT;
                reasons.push(format!("alias \"{word}\" -> {ty}"));
            }
        }
        if !terms.words.is_empty() {
            available += TEXT_WEIGHT;
            let haystack = haystack(section);
            let hits = terms.words.iter().filter(|w| haystack.contains(w.as_str())).count();
            if hits > 0 {
                let fraction = hits as f64 / terms.words.len() as f64;
                achieved += TEXT_WEIGHT * fraction;
                reasons.push(format!("description match {}%", (fraction * 100.0).round()));
            }
        }
    }

    if achieved <= 0.0 || available <= 0.0 {
        return None;
    }
    let confidence = ((achieved / available).min(1.0) * 10_000.0).round() / 10_000.0;
    Some(MatchResult {
        section_id: section.id.clone(),
        confidence,
        match_reasons: reasons,
    })
}

fn predicate_hits(props: &Map<String, Value>, predicate: &Map<String, Value>) -> usize {
    predicate
        .iter()
        .filter(|(key, expected)| prop_at(props, key) == Some(*expected))
        .count()
}

/// Look up a predicate key (a property path, optionally prefixed `props.`).
/// Keys that are not valid paths match nothing.
fn prop_at<'a>(props: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let path = PropertyPath::parse(key).ok()?.strip_key_prefix("props");
    let (first, rest) = path.steps().split_first()?;
    let PathStep::Key(first) = first else {
        return None;
    };
    sdui_path::get(props.get(first)?, &PropertyPath::from_steps(rest.to_vec()))
}

/// Lowercased id plus every scalar in props, space separated.
fn haystack(section: &Section) -> String {
    let mut out = section.id.to_lowercase();
    for value in section.props.values() {
        flatten_text(value, &mut out);
    }
    out
}

fn flatten_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(&s.to_lowercase());
        }
        Value::Number(n) => {
            out.push(' ');
            out.push_str(&n.to_string());
        }
        Value::Bool(b) => {
            out.push(' ');
            out.push_str(if *b { "true" } else { "false" });
        }
        Value::Array(items) => items.iter().for_each(|v| flatten_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| flatten_text(v, out)),
        Value::Null => {}
    }
}

/// A normalized description, split into alias hits and plain search terms.
#[derive(Debug, Default)]
struct DescriptionTerms {
    aliases: Vec<(String, &'static str)>,
    words: Vec<String>,
}

impl DescriptionTerms {
    fn parse(text: &str) -> Self {
        let normalized: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let mut terms = Self::default();
        for token in normalized.split_whitespace().filter(|t| t.chars().count() >= 3) {
            let singular = token.strip_suffix('s').filter(|s| s.len() >= 3).unwrap_or(token);
            match ALIASES.iter().find(|(word, _)| *word == token || *word == singular) {
                Some((word, ty)) => terms.aliases.push((word.to_string(), *ty)),
                None => terms.words.push(token.to_string()),
            }
        }
        terms
    }

    fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dashboard() -> PageDefinition {
        PageDefinition::new(vec![
            Section::new("header", "Header").with_props(json!({"title": "Quarterly review"})),
            Section::new("kpis", "Container").with_children(vec![
                Section::new("kpi-revenue", "StatCard").with_props(json!({"label": "Revenue", "trend": "up"})),
                Section::new("kpi-churn", "StatCard").with_props(json!({"label": "Churn", "trend": "down"})),
            ]),
            Section::new("chart1", "InteractiveChart").with_props(json!({"type": "line", "title": "Revenue by month"})),
            Section::new("chart2", "InteractiveChart").with_props(json!({"type": "bar", "title": "Signups"})),
        ])
    }

    fn ids(results: &[MatchResult]) -> Vec<&str> {
        results.iter().map(|m| m.section_id.as_str()).collect()
    }

    #[test]
    fn id_short_circuits() {
        let tree = dashboard();
        let results = resolve(&tree, &ComponentSelector::by_id("chart2"));
        assert_eq!(ids(&results), ["chart2"]);
        assert_eq!(results[0].confidence, 1.0);
        assert!(resolve(&tree, &ComponentSelector::by_id("nope")).is_empty());
    }

    #[test]
    fn type_filters_and_is_case_insensitive() {
        let tree = dashboard();
        let results = resolve(&tree, &ComponentSelector::by_type("statcard"));
        assert_eq!(ids(&results), ["kpi-revenue", "kpi-churn"]);
        assert!(results.iter().all(|m| m.confidence == 1.0));
    }

    #[test]
    fn props_predicate_is_proportional() {
        let tree = dashboard();
        let sel = ComponentSelector::by_type("StatCard").with_props(json!({"label": "Churn", "trend": "up"}));
        let results = resolve(&tree, &sel);
        // Each card matches one of two keys: (0.4 + 0.2) / 0.8.
        assert_eq!(ids(&results), ["kpi-revenue", "kpi-churn"]);
        assert_eq!(results[0].confidence, 0.75);
        assert_eq!(results[0].match_reasons, ["type match", "props match 50%"]);

        let exact = ComponentSelector::default().with_props(json!({"props.label": "Churn", "trend": "down"}));
        let results = resolve(&tree, &exact);
        assert_eq!(ids(&results), ["kpi-churn"]);
        assert_eq!(results[0].confidence, 1.0);
    }

    #[test]
    fn description_uses_aliases_and_text() {
        let tree = dashboard();
        let results = resolve(&tree, &ComponentSelector::by_description("Revenue chart!"));
        assert_eq!(ids(&results), ["chart1", "chart2", "kpi-revenue"]);
        assert_eq!(results[0].confidence, 1.0);
        assert_eq!(results[1].confidence, 0.6);
        assert_eq!(results[2].confidence, 0.4);
        assert_eq!(results[0].match_reasons[0], "alias \"chart\" -> InteractiveChart");

        let metrics = resolve(&tree, &ComponentSelector::by_description("KPIs"));
        assert_eq!(ids(&metrics), ["kpi-revenue", "kpi-churn"]);
    }

    #[test]
    fn index_narrows_candidates() {
        let tree = dashboard();
        let second_chart = resolve(&tree, &ComponentSelector::by_type("InteractiveChart").with_index(1));
        assert_eq!(ids(&second_chart), ["chart2"]);
        assert_eq!(second_chart[0].match_reasons, ["type match", "index 1 among InteractiveChart"]);

        let top_level = resolve(&tree, &ComponentSelector::default().with_index(2));
        assert_eq!(ids(&top_level), ["chart1"]);
        assert!(resolve(&tree, &ComponentSelector::by_type("Header").with_index(1)).is_empty());

        let churn = ComponentSelector::by_type("StatCard")
            .with_props(json!({"label": "Churn"}))
            .with_index(0);
        assert_eq!(ids(&resolve(&tree, &churn)), ["kpi-churn"]);
        assert!(resolve(&tree, &churn.clone().with_index(1)).is_empty());
    }

    #[test]
    fn resolve_one_enforces_threshold_and_ambiguity() {
        let tree = dashboard();
        let err = resolve_one(&tree, &ComponentSelector::by_type("StatCard"), 0.5).unwrap_err();
        assert_eq!(
            err,
            ActionError::SelectorAmbiguous {
                selector: "{type=StatCard}".into(),
                candidates: vec!["kpi-revenue".into(), "kpi-churn".into()],
            }
        );
        let one = resolve_one(&tree, &ComponentSelector::by_description("revenue chart"), 0.7).unwrap();
        assert_eq!(one.section_id, "chart1");
        assert!(matches!(
            resolve_one(&tree, &ComponentSelector::by_type("Video"), 0.5),
            Err(ActionError::SelectorNotFound { .. })
        ));
        assert!(matches!(
            resolve_one(&tree, &ComponentSelector::default(), 0.5),
            Err(ActionError::MalformedAction { .. })
        ));
    }

    #[test]
    fn empty_selector_resolves_to_nothing() {
        assert!(resolve(&dashboard(), &ComponentSelector::by_description("  ")).is_empty());
    }
}
