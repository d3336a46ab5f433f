//! Type definitions for property paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::validate::{validate_depth, validate_path_str};
use crate::PathError;

/// A single step in a property path.
///
/// Either a mapping key (`title`, `["odd.key"]`) or a sequence index (`[2]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

impl PathStep {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathStep::Key(k) => Some(k),
            PathStep::Index(_) => None,
        }
    }
}

impl From<&str> for PathStep {
    fn from(key: &str) -> Self {
        PathStep::Key(key.to_string())
    }
}

impl From<usize> for PathStep {
    fn from(index: usize) -> Self {
        PathStep::Index(index)
    }
}

/// A parsed dotted/bracketed property path such as `items[2].label`.
///
/// The empty path addresses the root value itself. It cannot be produced by
/// [`PropertyPath::parse`] but is available through [`PropertyPath::root`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PropertyPath {
    steps: Vec<PathStep>,
}

impl PropertyPath {
    pub fn root() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn from_steps(steps: Vec<PathStep>) -> Self {
        Self { steps }
    }

    /// Parse a dotted/bracketed path.
    ///
    /// # Errors
    ///
    /// - `PathError::Malformed` for empty segments, unterminated brackets,
    ///   or non-numeric unquoted indices
    /// - `PathError::TooLong` / `PathError::TooDeep` past the limits in
    ///   [`crate::validate`]
    ///
    /// # Example
    ///
    /// ```
    /// use sdui_path::{PathStep, PropertyPath};
    ///
    /// let path = PropertyPath::parse(r#"items[2]["odd.key"].label"#).unwrap();
    /// assert_eq!(
    ///     path.steps(),
    ///     &[
    ///         PathStep::Key("items".into()),
    ///         PathStep::Index(2),
    ///         PathStep::Key("odd.key".into()),
    ///         PathStep::Key("label".into()),
    ///     ]
    /// );
    /// assert!(PropertyPath::parse("a..b").is_err());
    /// assert!(PropertyPath::parse("a[x]").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, PathError> {
        validate_path_str(input)?;

        let chars: Vec<char> = input.chars().collect();
        let mut steps = Vec::new();
        let mut pos = 0;
        // True at the start and right after a '.', where a bare key must follow.
        let mut expect_key = true;
        let mut after_dot = false;

        while pos < chars.len() {
            match chars[pos] {
                '[' => {
                    if after_dot {
                        return Err(PathError::malformed(input, "'[' directly after '.'"));
                    }
                    let (step, next) = parse_bracket(input, &chars, pos)?;
                    steps.push(step);
                    pos = next;
                    expect_key = false;
                }
                '.' => {
                    if expect_key {
                        return Err(PathError::malformed(input, "empty segment"));
                    }
                    expect_key = true;
                    after_dot = true;
                    pos += 1;
                    continue;
                }
                ']' => return Err(PathError::malformed(input, "unexpected ']'")),
                _ => {
                    if !expect_key {
                        return Err(PathError::malformed(input, "expected '.' or '['"));
                    }
                    let start = pos;
                    while pos < chars.len() && !matches!(chars[pos], '.' | '[' | ']') {
                        pos += 1;
                    }
                    steps.push(PathStep::Key(chars[start..pos].iter().collect()));
                    expect_key = false;
                }
            }
            after_dot = false;
        }
        if expect_key {
            return Err(PathError::malformed(input, "trailing '.'"));
        }
        validate_depth(steps.len())?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, step: impl Into<PathStep>) {
        self.steps.push(step.into());
    }

    pub fn last(&self) -> Option<&PathStep> {
        self.steps.last()
    }

    /// The path without its last step, or `None` for the root path.
    pub fn parent(&self) -> Option<PropertyPath> {
        if self.steps.is_empty() {
            return None;
        }
        Some(Self {
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }

    /// Drop a leading key step equal to `key`, if present.
    ///
    /// ```
    /// use sdui_path::PropertyPath;
    ///
    /// let p = PropertyPath::parse("props.title").unwrap();
    /// assert_eq!(p.strip_key_prefix("props").to_string(), "title");
    /// let q = PropertyPath::parse("title").unwrap();
    /// assert_eq!(q.strip_key_prefix("props").to_string(), "title");
    /// ```
    pub fn strip_key_prefix(&self, key: &str) -> PropertyPath {
        match self.steps.first() {
            Some(PathStep::Key(k)) if k == key => Self {
                steps: self.steps[1..].to_vec(),
            },
            _ => self.clone(),
        }
    }

    /// True if `prefix` is equal to or an ancestor of this path.
    pub fn starts_with(&self, prefix: &PropertyPath) -> bool {
        self.steps.len() >= prefix.steps.len() && self.steps[..prefix.steps.len()] == prefix.steps[..]
    }

    /// True if one path is equal to or an ancestor of the other, i.e. writes
    /// to the two paths can touch the same value.
    pub fn overlaps(&self, other: &PropertyPath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

/// Parse a `[...]` step starting at `start`; returns the step and the
/// position just past the closing bracket.
fn parse_bracket(input: &str, chars: &[char], start: usize) -> Result<(PathStep, usize), PathError> {
    let mut pos = start + 1;
    match chars.get(pos) {
        Some(&quote @ ('"' | '\'')) => {
            pos += 1;
            let mut key = String::new();
            loop {
                match chars.get(pos) {
                    None => return Err(PathError::malformed(input, "unterminated quoted key")),
                    Some('\\') => {
                        let escaped = chars
                            .get(pos + 1)
                            .ok_or_else(|| PathError::malformed(input, "dangling escape"))?;
                        key.push(*escaped);
                        pos += 2;
                    }
                    Some(c) if *c == quote => {
                        pos += 1;
                        break;
                    }
                    Some(c) => {
                        key.push(*c);
                        pos += 1;
                    }
                }
            }
            if chars.get(pos) != Some(&']') {
                return Err(PathError::malformed(input, "expected ']' after quoted key"));
            }
            Ok((PathStep::Key(key), pos + 1))
        }
        _ => {
            let digits_start = pos;
            while pos < chars.len() && chars[pos] != ']' {
                pos += 1;
            }
            if pos >= chars.len() {
                return Err(PathError::malformed(input, "unterminated '['"));
            }
            let digits: String = chars[digits_start..pos].iter().collect();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(PathError::malformed(input, "index must be a non-negative integer"));
            }
            let index = digits
                .parse()
                .map_err(|_| PathError::malformed(input, "index out of range"))?;
            Ok((PathStep::Index(index), pos + 1))
        }
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && !key
            .chars()
            .any(|c| matches!(c, '.' | '[' | ']' | '"' | '\'' | '\\'))
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Key(k) if is_plain_key(k) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                PathStep::Key(k) => {
                    f.write_str("[\"")?;
                    for c in k.chars() {
                        if c == '"' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\"]")?;
                }
                PathStep::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for PropertyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyPath::parse(s)
    }
}

impl Serialize for PropertyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PropertyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PropertyPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
