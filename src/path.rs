//! Variable path parser - dot segments with array indexing
//!
//! Supports:
//! - a.b.c (dot notation)
//! - a.b[0].c (array index)
//! - a.b.0 (numeric segment as index)
//!
//! Does NOT support filters, wildcards, or slices.

use serde_json::Value;

use crate::error::WeftError;

/// A parsed path segment
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Object field access: .field
    Field(String),
    /// Array index access: [0]
    Index(usize),
}

/// Parse a variable path into segments
///
/// Examples:
/// - "t1.output_data.result" → [Field("t1"), Field("output_data"), Field("result")]
/// - "items[0].name" → [Field("items"), Index(0), Field("name")]
pub fn parse(path: &str) -> Result<Vec<Segment>, WeftError> {
    if path.is_empty() {
        return Err(WeftError::InvalidPath {
            path: path.to_string(),
        });
    }

    let mut segments = Vec::new();

    for part in path.split('.') {
        if part.is_empty() {
            return Err(WeftError::InvalidPath {
                path: path.to_string(),
            });
        }

        // Check for array index: field[0] or just [0]
        if let Some(bracket_pos) = part.find('[') {
            let field = &part[..bracket_pos];
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            }

            if !part.ends_with(']') {
                return Err(WeftError::InvalidPath {
                    path: path.to_string(),
                });
            }

            let index_str = &part[bracket_pos + 1..part.len() - 1];
            let index: usize = index_str.parse().map_err(|_| WeftError::InvalidPath {
                path: path.to_string(),
            })?;

            segments.push(Segment::Index(index));
        } else if let Ok(index) = part.parse::<usize>() {
            // Numeric segment treated as array index (e.g., "items.0")
            segments.push(Segment::Index(index));
        } else {
            segments.push(Segment::Field(part.to_string()));
        }
    }

    Ok(segments)
}

/// Apply path segments to a JSON value
///
/// Uses references internally, only clones once at the end.
pub fn apply(value: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = value;

    for segment in segments {
        current = match segment {
            Segment::Field(name) => current.get(name)?,
            Segment::Index(idx) => current.get(*idx)?,
        };
    }

    Some(current.clone())
}
