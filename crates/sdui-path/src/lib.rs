//! Property path utilities for server-driven UI schemas.
//!
//! Paths use the dotted/bracketed form that UI producers write by hand:
//! `title`, `style.color`, `items[2].label`, `["odd.key"]`.
//!
//! # Example
//!
//! ```
//! use sdui_path::{append, get, merge, set, PropertyPath};
//! use serde_json::json;
//!
//! let mut props = json!({"title": "Revenue"});
//!
//! set(&mut props, &PropertyPath::parse("style.color").unwrap(), json!("red")).unwrap();
//! merge(&mut props, &PropertyPath::parse("style").unwrap(), json!({"weight": 600})).unwrap();
//! append(&mut props, &PropertyPath::parse("series").unwrap(), json!(42)).unwrap();
//!
//! assert_eq!(
//!     props,
//!     json!({"title": "Revenue", "style": {"color": "red", "weight": 600}, "series": [42]})
//! );
//! assert_eq!(get(&props, &PropertyPath::parse("series[0]").unwrap()), Some(&json!(42)));
//! ```

use serde_json::{Map, Value};
use thiserror::Error;

pub mod types;
pub use types::{PathStep, PropertyPath};

pub mod validate;
pub use validate::{validate_depth, validate_path_str, MAX_PATH_CHARS, MAX_PATH_DEPTH};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed path {input:?}: {reason}")]
    Malformed { input: String, reason: String },
    #[error("path is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("path has {depth} steps (max {max})")]
    TooDeep { depth: usize, max: usize },
    #[error("nothing at `{path}`")]
    NotFound { path: String },
    #[error("index {index} out of bounds at `{path}` (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
    #[error("expected {expected} at `{path}`, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot remove the root value")]
    RemoveRoot,
}

impl PathError {
    pub(crate) fn malformed(input: &str, reason: &str) -> Self {
        PathError::Malformed {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Short name of a JSON value's kind, used in error messages.
pub fn value_kind(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn prefix_string(path: &PropertyPath, len: usize) -> String {
    PropertyPath::from_steps(path.steps()[..len].to_vec()).to_string()
}

// ── Navigation ────────────────────────────────────────────────────────────

/// Get a value by path. Returns `None` if any step is missing or the
/// container kind does not fit the step.
pub fn get<'a>(val: &'a Value, path: &PropertyPath) -> Option<&'a Value> {
    let mut current = val;
    for step in path.steps() {
        current = match (step, current) {
            (PathStep::Key(k), Value::Object(map)) => map.get(k)?,
            (PathStep::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Get a mutable reference to a value by path.
pub fn get_mut<'a>(val: &'a mut Value, path: &PropertyPath) -> Option<&'a mut Value> {
    let mut current = val;
    for step in path.steps() {
        current = match (step, current) {
            (PathStep::Key(k), Value::Object(map)) => map.get_mut(k)?,
            (PathStep::Index(i), Value::Array(arr)) => arr.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk to the container holding the last step of `path`.
///
/// With `create`, missing mapping entries along the way are created as empty
/// mappings. Index steps never create anything.
fn parent_mut<'a>(doc: &'a mut Value, path: &PropertyPath, create: bool) -> Result<&'a mut Value, PathError> {
    let steps = path.steps();
    let mut current = doc;
    for (depth, step) in steps[..steps.len().saturating_sub(1)].iter().enumerate() {
        current = match step {
            PathStep::Key(k) => match current {
                Value::Object(map) => {
                    if create {
                        map.entry(k.clone()).or_insert_with(|| Value::Object(Map::new()))
                    } else {
                        map.get_mut(k).ok_or_else(|| PathError::NotFound {
                            path: prefix_string(path, depth + 1),
                        })?
                    }
                }
                other => {
                    return Err(PathError::TypeMismatch {
                        path: prefix_string(path, depth),
                        expected: "mapping",
                        found: value_kind(other),
                    })
                }
            },
            PathStep::Index(i) => match current {
                Value::Array(arr) => {
                    let len = arr.len();
                    arr.get_mut(*i).ok_or_else(|| PathError::IndexOutOfBounds {
                        path: prefix_string(path, depth),
                        index: *i,
                        len,
                    })?
                }
                other => {
                    return Err(PathError::TypeMismatch {
                        path: prefix_string(path, depth),
                        expected: "sequence",
                        found: value_kind(other),
                    })
                }
            },
        };
    }
    Ok(current)
}

fn container_mismatch(path: &PropertyPath, step: &PathStep, found: &Value) -> PathError {
    PathError::TypeMismatch {
        path: prefix_string(path, path.len() - 1),
        expected: match step {
            PathStep::Key(_) => "mapping",
            PathStep::Index(_) => "sequence",
        },
        found: value_kind(found),
    }
}

// ── Writes ────────────────────────────────────────────────────────────────

/// Set the value at `path`, creating missing intermediate mappings.
///
/// An index step must address an existing element or the end of the
/// sequence (which appends). Returns the previous value, if any.
pub fn set(doc: &mut Value, path: &PropertyPath, value: Value) -> Result<Option<Value>, PathError> {
    let Some(last) = path.last() else {
        return Ok(Some(std::mem::replace(doc, value)));
    };
    let parent = parent_mut(doc, path, true)?;
    match (last, parent) {
        (PathStep::Key(k), Value::Object(map)) => Ok(map.insert(k.clone(), value)),
        (PathStep::Index(i), Value::Array(arr)) => {
            if *i < arr.len() {
                Ok(Some(std::mem::replace(&mut arr[*i], value)))
            } else if *i == arr.len() {
                arr.push(value);
                Ok(None)
            } else {
                Err(PathError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: *i,
                    len: arr.len(),
                })
            }
        }
        (step, other) => Err(container_mismatch(path, step, other)),
    }
}

/// Replace an existing value at `path`. Fails with `NotFound` if absent.
pub fn replace(doc: &mut Value, path: &PropertyPath, value: Value) -> Result<Value, PathError> {
    match get_mut(doc, path) {
        Some(slot) => Ok(std::mem::replace(slot, value)),
        None => Err(PathError::NotFound {
            path: path.to_string(),
        }),
    }
}

/// Remove the value at `path`, keeping the order of remaining entries.
pub fn remove(doc: &mut Value, path: &PropertyPath) -> Result<Value, PathError> {
    let Some(last) = path.last() else {
        return Err(PathError::RemoveRoot);
    };
    let parent = parent_mut(doc, path, false)?;
    match (last, parent) {
        (PathStep::Key(k), Value::Object(map)) => map.shift_remove(k).ok_or_else(|| PathError::NotFound {
            path: path.to_string(),
        }),
        (PathStep::Index(i), Value::Array(arr)) => {
            if *i < arr.len() {
                Ok(arr.remove(*i))
            } else {
                Err(PathError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: *i,
                    len: arr.len(),
                })
            }
        }
        (step, other) => Err(container_mismatch(path, step, other)),
    }
}

/// Deep-merge a mapping into the mapping at `path`.
///
/// An absent target is set to `value`. Nested mappings merge recursively;
/// every other value in `value` overwrites.
pub fn merge(doc: &mut Value, path: &PropertyPath, value: Value) -> Result<(), PathError> {
    let incoming = match value {
        Value::Object(map) => map,
        other => {
            return Err(PathError::TypeMismatch {
                path: path.to_string(),
                expected: "mapping value",
                found: value_kind(&other),
            })
        }
    };
    match get_mut(doc, path) {
        Some(Value::Object(existing)) => {
            deep_merge(existing, incoming);
            Ok(())
        }
        Some(other) => Err(PathError::TypeMismatch {
            path: path.to_string(),
            expected: "mapping",
            found: value_kind(other),
        }),
        None => set(doc, path, Value::Object(incoming)).map(|_| ()),
    }
}

fn deep_merge(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Object(nested) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    deep_merge(existing, nested);
                } else {
                    target.insert(key, Value::Object(nested));
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

/// Push `value` as one element onto the sequence at `path`.
/// An absent target is treated as an empty sequence.
pub fn append(doc: &mut Value, path: &PropertyPath, value: Value) -> Result<(), PathError> {
    insert_into_sequence(doc, path, value, false)
}

/// Insert `value` as one element at the front of the sequence at `path`.
/// An absent target is treated as an empty sequence.
pub fn prepend(doc: &mut Value, path: &PropertyPath, value: Value) -> Result<(), PathError> {
    insert_into_sequence(doc, path, value, true)
}

fn insert_into_sequence(doc: &mut Value, path: &PropertyPath, value: Value, front: bool) -> Result<(), PathError> {
    match get_mut(doc, path) {
        Some(Value::Array(arr)) => {
            if front {
                arr.insert(0, value);
            } else {
                arr.push(value);
            }
            Ok(())
        }
        Some(other) => Err(PathError::TypeMismatch {
            path: path.to_string(),
            expected: "sequence",
            found: value_kind(other),
        }),
        None => set(doc, path, Value::Array(vec![value])).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> PropertyPath {
        PropertyPath::parse(s).unwrap()
    }

    #[test]
    fn test_get() {
        let doc = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(get(&doc, &p("a.b[0]")), Some(&json!(10)));
        assert_eq!(get(&doc, &p("a.b[1].c")), Some(&json!("x")));
        assert_eq!(get(&doc, &p("a.b[5]")), None);
        assert_eq!(get(&doc, &p("a.b.c")), None);
        assert_eq!(get(&doc, &PropertyPath::root()), Some(&doc));
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({});
        set(&mut doc, &p("style.font.size"), json!(12)).unwrap();
        assert_eq!(doc, json!({"style": {"font": {"size": 12}}}));
    }

    #[test]
    fn test_set_returns_old() {
        let mut doc = json!({"type": "line"});
        let old = set(&mut doc, &p("type"), json!("bar")).unwrap();
        assert_eq!(old, Some(json!("line")));
        assert_eq!(doc, json!({"type": "bar"}));
    }

    #[test]
    fn test_set_index() {
        let mut doc = json!({"xs": [1, 2]});
        set(&mut doc, &p("xs[1]"), json!(20)).unwrap();
        set(&mut doc, &p("xs[2]"), json!(30)).unwrap();
        assert_eq!(doc, json!({"xs": [1, 20, 30]}));
        let err = set(&mut doc, &p("xs[9]"), json!(0)).unwrap_err();
        assert!(matches!(err, PathError::IndexOutOfBounds { index: 9, len: 3, .. }));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = json!({"title": "x"});
        let err = set(&mut doc, &p("title.size"), json!(1)).unwrap_err();
        assert_eq!(
            err,
            PathError::TypeMismatch {
                path: "title".into(),
                expected: "mapping",
                found: "string"
            }
        );
    }

    #[test]
    fn test_replace_requires_existing() {
        let mut doc = json!({"a": 1});
        assert_eq!(replace(&mut doc, &p("a"), json!(2)).unwrap(), json!(1));
        assert!(matches!(
            replace(&mut doc, &p("b"), json!(2)),
            Err(PathError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut doc = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(remove(&mut doc, &p("a")).unwrap(), json!(1));
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b", "c"]);
        assert!(matches!(remove(&mut doc, &p("zz")), Err(PathError::NotFound { .. })));
        assert_eq!(remove(&mut doc, &PropertyPath::root()), Err(PathError::RemoveRoot));
    }

    #[test]
    fn test_merge_deep() {
        let mut doc = json!({"style": {"color": "red", "font": {"size": 10, "weight": 400}}});
        merge(&mut doc, &p("style"), json!({"font": {"size": 12}, "border": 1})).unwrap();
        assert_eq!(
            doc,
            json!({"style": {"color": "red", "font": {"size": 12, "weight": 400}, "border": 1}})
        );
    }

    #[test]
    fn test_merge_absent_and_mismatch() {
        let mut doc = json!({"title": "x"});
        merge(&mut doc, &p("style"), json!({"a": 1})).unwrap();
        assert_eq!(doc["style"], json!({"a": 1}));
        assert!(matches!(
            merge(&mut doc, &p("title"), json!({"a": 1})),
            Err(PathError::TypeMismatch { expected: "mapping", found: "string", .. })
        ));
        assert!(matches!(
            merge(&mut doc, &p("style"), json!(5)),
            Err(PathError::TypeMismatch { expected: "mapping value", .. })
        ));
    }

    #[test]
    fn test_append_prepend() {
        let mut doc = json!({"xs": [2]});
        append(&mut doc, &p("xs"), json!(3)).unwrap();
        prepend(&mut doc, &p("xs"), json!(1)).unwrap();
        append(&mut doc, &p("ys"), json!([9])).unwrap();
        assert_eq!(doc, json!({"xs": [1, 2, 3], "ys": [[9]]}));
        assert!(matches!(
            append(&mut json!({"xs": {}}), &p("xs"), json!(1)),
            Err(PathError::TypeMismatch { expected: "sequence", found: "mapping", .. })
        ));
    }
}
