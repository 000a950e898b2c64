//! Dotted-path resolution over JSON values.
//!
//! Resolves paths like `events[0].properties.name` against a
//! `serde_json::Value`. Both dot and bracket notation are accepted; a
//! step that misses yields `None` rather than an error.

use serde_json::Value;

/// One step of a parsed path: a key lookup, optionally followed by an
/// array index (`events[0]`).
#[derive(Debug, Clone, PartialEq)]
struct PathStep {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Vec<PathStep> {
    path.split('.')
        .map(|segment| match segment.find('[') {
            Some(open) if segment.ends_with(']') => {
                let key = &segment[..open];
                let index = segment[open + 1..segment.len() - 1].parse::<usize>().ok();
                match index {
                    Some(i) => PathStep {
                        key: key.to_string(),
                        index: Some(i),
                    },
                    // Malformed index: treat the segment as a literal key
                    None => PathStep {
                        key: segment.to_string(),
                        index: None,
                    },
                }
            }
            _ => PathStep {
                key: segment.to_string(),
                index: None,
            },
        })
        .collect()
}

/// Resolve `path` against `data`. Returns `None` when any intermediate
/// step is missing or of the wrong shape.
pub fn resolve<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }

    let mut current = data;
    for step in parse_path(path) {
        // A bare numeric segment indexes directly into an array
        if step.index.is_none() {
            if let Value::Array(arr) = current {
                let i: usize = step.key.parse().ok()?;
                current = arr.get(i)?;
                continue;
            }
        }

        let obj = current.as_object()?;
        current = obj.get(&step.key)?;

        if let Some(i) = step.index {
            current = current.as_array()?.get(i)?;
        }
    }

    Some(current)
}

/// Resolve `path` and return the value as a string, if it is one.
pub fn resolve_str<'a>(data: &'a Value, path: &str) -> Option<&'a str> {
    resolve(data, path).and_then(Value::as_str)
}
