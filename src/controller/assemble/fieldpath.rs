//! Dotted field paths into JSON documents
//!
//! Paths look like `spec.workloadRef` or `spec.targets[0].ref`. Setting a
//! value paves every missing intermediate object or array on the way.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("empty field path")]
    Empty,

    #[error("invalid field path {path:?}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("field path {path:?}: {segment} is not {expected}")]
    TypeMismatch {
        path: String,
        segment: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse(path: &str) -> Result<Vec<Segment>, FieldPathError> {
    if path.is_empty() {
        return Err(FieldPathError::Empty);
    }
    let invalid = |reason: &str| FieldPathError::Invalid {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        let (field, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if field.is_empty() {
            return Err(invalid("empty field name"));
        }
        segments.push(Segment::Field(field.to_string()));

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let index = rest[1..close]
                .parse::<usize>()
                .map_err(|_| invalid("array index must be a non-negative integer"))?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid("unexpected characters after ']'"));
            }
        }
    }
    Ok(segments)
}

/// Set `value` at `path` inside `doc`, creating intermediate containers
///
/// Existing values of the wrong shape along the path are an error rather than
/// being overwritten.
pub fn set_value(doc: &mut Value, path: &str, value: Value) -> Result<(), FieldPathError> {
    let segments = parse(path)?;
    let mut current = doc;

    for (i, segment) in segments.iter().enumerate() {
        let next_is_index = matches!(segments.get(i + 1), Some(Segment::Index(_)));
        let last = i + 1 == segments.len();
        let empty_child = || {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        };
        let mismatch = |expected: &'static str| FieldPathError::TypeMismatch {
            path: path.to_string(),
            segment: describe(&segments[..i]),
            expected,
        };

        match segment {
            Segment::Field(name) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let obj = current.as_object_mut().ok_or_else(|| mismatch("an object"))?;
                if last {
                    obj.insert(name.clone(), value);
                    return Ok(());
                }
                current = obj.entry(name.clone()).or_insert_with(empty_child);
            }
            Segment::Index(index) => {
                if current.is_null() {
                    *current = Value::Array(Vec::new());
                }
                let arr = current.as_array_mut().ok_or_else(|| mismatch("an array"))?;
                if arr.len() <= *index {
                    arr.resize(*index + 1, Value::Null);
                }
                if last {
                    arr[*index] = value;
                    return Ok(());
                }
                current = &mut arr[*index];
            }
        }
    }
    Ok(())
}

fn describe(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "the document root".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            Segment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}
