//! `%(name)s` placeholder substitution against a [`ContextStack`].
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{BraidError, Result};
use crate::scope::ContextStack;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%\(([^)]*)\)s").expect("placeholder pattern is valid"));

/// Substitutes every `%(name)s` in `text` with the textual form of the value
/// bound to `name`. `%%` yields a literal `%`.
///
/// `name` may continue with dotted segments (`q1.value`, `items.0`) that
/// descend into objects and arrays once the first segment is found.
pub fn resolve(text: &str, stack: &ContextStack) -> Result<String> {
    let mut missing = None;

    let resolved = PLACEHOLDER.replace_all(text, |caps: &Captures| {
        let Some(name) = caps.get(1) else {
            return "%".to_string();
        };

        match lookup_path(name.as_str(), stack) {
            Some(value) => to_text(&value),
            None => {
                missing.get_or_insert_with(|| name.as_str().to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(BraidError::UnresolvedTemplateKey { key }),
        None => Ok(resolved.into_owned()),
    }
}

/// Applies [`resolve`] to every string nested anywhere in `value`. Object
/// keys are left untouched.
pub fn resolve_value(value: &Value, stack: &ContextStack) -> Result<Value> {
    Ok(match value {
        Value::String(text) => Value::String(resolve(text, stack)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, stack))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), resolve_value(item, stack)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

/// Names of all placeholders anywhere in `value`, in order of appearance.
pub fn placeholders(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_placeholders(value, &mut names);
    names
}

fn collect_placeholders(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(text) => names.extend(
            PLACEHOLDER
                .captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .map(|name| name.as_str().to_string()),
        ),
        Value::Array(items) => items.iter().for_each(|item| collect_placeholders(item, names)),
        Value::Object(map) => map.values().for_each(|item| collect_placeholders(item, names)),
        _ => {}
    }
}

fn lookup_path(name: &str, stack: &ContextStack) -> Option<Value> {
    if let Some(value) = stack.lookup(name) {
        return Some(value);
    }

    let mut segments = name.split('.');
    let mut value = stack.lookup(segments.next()?)?;

    for segment in segments {
        value = match value {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }

    Some(value)
}

/// Textual form used for substitution: strings verbatim, everything else
/// as compact JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stack(value: Value) -> ContextStack {
        ContextStack::with_bindings(value.as_object().unwrap().clone())
    }

    #[test]
    fn test_substitutes_from_scope() {
        let stack = stack(json!({"query1": "Paris"}));
        assert_eq!(resolve("fact: %(query1)s", &stack).unwrap(), "fact: Paris");
    }

    #[test]
    fn test_missing_key_fails() {
        let err = resolve("fact: %(query2)s", &stack(json!({"query1": "Paris"}))).unwrap_err();
        assert!(matches!(err, BraidError::UnresolvedTemplateKey { key } if key == "query2"));
    }

    #[test]
    fn test_escapes_and_plain_text() {
        let stack = stack(json!({"n": 5}));
        assert_eq!(resolve("100%% of %(n)s", &stack).unwrap(), "100% of 5");
        assert_eq!(resolve("no placeholders", &stack).unwrap(), "no placeholders");
        assert_eq!(resolve("50% off", &stack).unwrap(), "50% off");
    }

    #[test]
    fn test_textual_forms() {
        let stack = stack(json!({
            "s": "text",
            "n": 1.5,
            "b": true,
            "z": null,
            "o": {"value": "Paris"},
        }));

        assert_eq!(
            resolve("%(s)s %(n)s %(b)s %(z)s %(o)s", &stack).unwrap(),
            r#"text 1.5 true null {"value":"Paris"}"#
        );
    }

    #[test]
    fn test_dotted_paths() {
        let stack = stack(json!({
            "q1": {"value": "Paris", "tags": ["a", "b"]},
            "with.dot": "literal",
        }));

        assert_eq!(resolve("%(q1.value)s", &stack).unwrap(), "Paris");
        assert_eq!(resolve("%(q1.tags.1)s", &stack).unwrap(), "b");
        assert_eq!(resolve("%(with.dot)s", &stack).unwrap(), "literal");
        assert!(resolve("%(q1.tags.9)s", &stack).is_err());
    }

    #[test]
    fn test_placeholders() {
        let value = json!(["%(a)s and %%(not)s", {"k": "%(b.value)s"}, 3]);
        assert_eq!(placeholders(&value), vec!["a", "b.value"]);
        assert!(placeholders(&json!("plain 100%%")).is_empty());
    }

    #[test]
    fn test_resolve_value_walks_nested_prompts() {
        let stack = stack(json!({"foo": "bar"}));
        let prompt = json!([["system", "sys %(foo)s"], ["user", "user %(foo)s"], 3]);

        assert_eq!(
            resolve_value(&prompt, &stack).unwrap(),
            json!([["system", "sys bar"], ["user", "user bar"], 3])
        );
    }
}
