//! Core event types for Relay.
//!
//! An [`Event`] is an opaque JSON document produced by the tracking pipeline.
//! The engine never mutates it; subscriptions and mappings read from it
//! through [`FieldPath`] expressions.
//!
//! # Path syntax
//!
//! ```text
//! Path                    | Reads
//! ------------------------|------------------------------
//! $                       | the whole event
//! $.properties.plan       | event["properties"]["plan"]
//! $.products[0].sku       | first product's sku
//! $["user id"]            | keys that are not identifiers
//! properties.plan         | leading `$.` is optional
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An inbound analytics event: an arbitrary JSON document.
pub type Event = Value;

/// Errors produced while parsing a path expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid path '{path}': {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: String,
}

impl PathError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// The root path (`$`).
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from already-split segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parse a path expression.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let text = input.trim();
        let mut chars = text.char_indices().peekable();
        let mut segments = Vec::new();

        // `$` is optional; `$.a` and `a` are the same path.
        let mut expect_key = true;
        if text.starts_with('$') {
            chars.next();
            expect_key = false;
        }

        while let Some(&(pos, c)) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                    expect_key = true;
                }
                '[' => {
                    chars.next();
                    let segment = match chars.peek().map(|&(_, c)| c) {
                        Some(quote @ ('"' | '\'')) => {
                            chars.next();
                            let mut key = String::new();
                            let mut closed = false;
                            for (_, c) in chars.by_ref() {
                                if c == quote {
                                    closed = true;
                                    break;
                                }
                                key.push(c);
                            }
                            if !closed {
                                return Err(PathError::new(input, "unterminated quoted key"));
                            }
                            Segment::Key(key)
                        }
                        _ => {
                            let mut digits = String::new();
                            while let Some(&(_, c)) = chars.peek() {
                                if c == ']' {
                                    break;
                                }
                                digits.push(c);
                                chars.next();
                            }
                            let index = digits.trim().parse::<usize>().map_err(|_| {
                                PathError::new(input, format!("'{}' is not an array index", digits))
                            })?;
                            Segment::Index(index)
                        }
                    };
                    match chars.next() {
                        Some((_, ']')) => {}
                        _ => return Err(PathError::new(input, "expected ']'")),
                    }
                    segments.push(segment);
                    expect_key = false;
                }
                _ if expect_key => {
                    let mut key = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c == '.' || c == '[' {
                            break;
                        }
                        key.push(c);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(PathError::new(input, "empty key"));
                    }
                    segments.push(Segment::Key(key));
                    expect_key = false;
                }
                _ => {
                    return Err(PathError::new(
                        input,
                        format!("unexpected '{}' at offset {}", c, pos),
                    ))
                }
            }
        }

        if expect_key && !segments.is_empty() {
            return Err(PathError::new(input, "path ends with '.'"));
        }

        Ok(Self { segments })
    }

    /// Read the value at this path, `None` when any step is missing.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
                (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate objects.
    ///
    /// Returns `false` when the path crosses a non-container value or an
    /// out-of-range array index.
    pub fn set(&self, root: &mut Value, value: Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = value;
            return true;
        };

        let mut current = root;
        for segment in parents {
            current = match segment {
                Segment::Key(key) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map
                            .entry(key.clone())
                            .or_insert_with(|| Value::Object(Map::new())),
                        _ => return false,
                    }
                }
                Segment::Index(index) => match current {
                    Value::Array(items) => match items.get_mut(*index) {
                        Some(item) => item,
                        None => return false,
                    },
                    _ => return false,
                },
            };
        }

        if current.is_null() && matches!(last, Segment::Key(_)) {
            *current = Value::Object(Map::new());
        }

        match (last, current) {
            (Segment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
                true
            }
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                items[*index] = value;
                true
            }
            _ => false,
        }
    }

    /// Remove and return the value at this path.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;

        let mut current = root;
        for segment in parents {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (Segment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
                _ => return None,
            };
        }

        match (last, current) {
            (Segment::Key(key), Value::Object(map)) => map.remove(key),
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        }
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.segments {
            match segment {
                Segment::Key(key) if is_plain_key(key) => write!(f, ".{}", key)?,
                Segment::Key(key) => write!(f, "[\"{}\"]", key)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '$')
}
