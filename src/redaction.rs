//! Sensitive-argument redaction (supplement B.4), grounded in
//! `nameko.utils.get_redacted_args`. An entrypoint's `sensitive_arguments`
//! (§4.2, §8) name paths into the call's arguments using the syntax
//! `name`, `name.key`, or `name[index]`; [`redact_args`] returns a copy of
//! the call's keyword-argument map with those paths blanked out.

use std::collections::HashMap;

use serde_json::Value;

pub const REDACTED: &str = "********";

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits `name.key[index]` into `[Key("name"), Key("key"), Index(index)]`,
/// mirroring the source regex `(\w+)|\[(\d+)\]`: separators (`.`, `[`, `]`)
/// are structural only, never emitted as segments.
fn parse_path(pattern: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                chars.next();
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                }
                if let Ok(index) = digits.parse() {
                    segments.push(PathSegment::Index(index));
                }
            }
            _ => {
                current.push(c);
                chars.next();
            }
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    segments
}

fn redact_path(value: &mut Value, path: &[PathSegment]) {
    let Some((head, rest)) = path.split_first() else { return };
    let target = match (head, &mut *value) {
        (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
        (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
        _ => None,
    };
    let Some(target) = target else { return };
    if rest.is_empty() {
        *target = Value::String(REDACTED.to_string());
    } else {
        redact_path(target, rest);
    }
}

/// Returns a redacted copy of `call_args` (a call's arguments keyed by
/// parameter name). A pattern whose path doesn't match anything in the call
/// is a no-op rather than an error (§8 fuzz property — "fuzzy" matching so
/// a redaction rule can be written defensively for an optional field).
pub fn redact_args(call_args: &HashMap<String, Value>, sensitive_arguments: &[&str]) -> HashMap<String, Value> {
    let mut redacted = call_args.clone();
    for pattern in sensitive_arguments {
        let segments = parse_path(pattern);
        let Some((PathSegment::Key(root), rest)) = segments.split_first().map(|(h, r)| (h.clone(), r)) else {
            continue;
        };
        let Some(value) = redacted.get_mut(&root) else { continue };
        if rest.is_empty() {
            *value = Value::String(REDACTED.to_string());
        } else {
            redact_path(value, rest);
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_a_whole_top_level_argument() {
        let mut args = HashMap::new();
        args.insert("password".to_string(), json!("hunter2"));
        let redacted = redact_args(&args, &["password"]);
        assert_eq!(redacted["password"], json!(REDACTED));
    }

    #[test]
    fn redacts_a_nested_dict_key() {
        let mut args = HashMap::new();
        args.insert("foo".to_string(), json!({"bar": "secret", "baz": "normal"}));
        let redacted = redact_args(&args, &["foo.bar"]);
        assert_eq!(redacted["foo"]["bar"], json!(REDACTED));
        assert_eq!(redacted["foo"]["baz"], json!("normal"));
    }

    #[test]
    fn redacts_a_list_index() {
        let mut args = HashMap::new();
        args.insert("items".to_string(), json!(["a", "b", "c"]));
        let redacted = redact_args(&args, &["items[1]"]);
        assert_eq!(redacted["items"], json!(["a", REDACTED, "c"]));
    }

    #[test]
    fn missing_path_is_a_no_op() {
        let mut args = HashMap::new();
        args.insert("foo".to_string(), json!("value"));
        let redacted = redact_args(&args, &["foo.bar.baz", "nonexistent"]);
        assert_eq!(redacted, args);
    }
}
