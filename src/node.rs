//! Classification of raw declarative input into executable nodes.
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::capability::{Capabilities, Invocation};
use crate::error::{BraidError, Result};

/// Reserved key of an explicit reference.
pub const WAIT: &str = "$wait";
/// Reserved key under which a chain step sees the previous step's result.
pub const RESULT: &str = "$result";
/// Group directive bounding how many branches of the group run at once.
pub const THROTTLE: &str = "$throttle";

/// Shape tag of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    ParallelGroup,
    Chain,
    Reference,
    Leaf,
}

/// A classified node of the braid.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Branches run concurrently, keyed by their declared names.
    ParallelGroup(Group),
    /// Steps run strictly in order, threading `$result` forward.
    Chain(Vec<Arc<Node>>),
    /// Blocks until the named sibling branches complete.
    Reference(Vec<String>),
    Leaf(Leaf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub entries: Vec<(String, Arc<Node>)>,
    pub throttle: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    /// Returned verbatim under `value`.
    Literal(Value),
    /// Delegated to the capability registered for the marker. Strings in the
    /// invocation are still unresolved templates at this point.
    Invoke(Invocation),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::ParallelGroup(_) => NodeKind::ParallelGroup,
            Node::Chain(_) => NodeKind::Chain,
            Node::Reference(_) => NodeKind::Reference,
            Node::Leaf(_) => NodeKind::Leaf,
        }
    }
}

/// Classifies `raw` and every node below it.
///
/// Pure and deterministic: the same input against the same set of markers
/// always produces the same tree. Nothing is executed.
pub fn classify(raw: &Value, markers: &Capabilities) -> Result<Node> {
    classify_at(raw, markers, "")
}

fn classify_at(raw: &Value, markers: &Capabilities, path: &str) -> Result<Node> {
    match raw {
        Value::Object(map) if map.contains_key(WAIT) => classify_wait(map, path),
        Value::String(text) if text.starts_with('@') => {
            parse_alias(text, path).map(Node::Reference)
        }
        Value::Object(map) => {
            let mut found = map.keys().filter(|key| markers.contains(key));

            match (found.next(), found.next()) {
                (Some(marker), None) => Ok(Node::Leaf(Leaf::Invoke(invocation(map, marker)))),
                (Some(a), Some(b)) => Err(BraidError::malformed(
                    path,
                    format!("capability markers '{a}' and '{b}' in one node"),
                )),
                (None, _) => classify_group(map, markers, path),
            }
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| classify_at(item, markers, &join(path, &i.to_string())).map(Arc::new))
            .collect::<Result<Vec<_>>>()
            .map(Node::Chain),
        scalar => Ok(Node::Leaf(Leaf::Literal(scalar.clone()))),
    }
}

fn classify_wait(map: &Map<String, Value>, path: &str) -> Result<Node> {
    if map.len() > 1 {
        return Err(BraidError::malformed(
            path,
            format!("'{WAIT}' cannot be combined with other keys"),
        ));
    }

    let keys = match &map[WAIT] {
        Value::Array(items) if !items.is_empty() => {
            let names = items
                .iter()
                .map(|item| {
                    item.as_str().map(strip_alias).ok_or_else(|| {
                        BraidError::malformed(path, format!("'{WAIT}' entries must be strings"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            reference_keys(names, path)?
        }
        Value::String(text) => reference_keys(strip_alias(text).split(','), path)?,
        _ => {
            return Err(BraidError::malformed(
                path,
                format!("'{WAIT}' expects a non-empty list of keys"),
            ));
        }
    };

    Ok(Node::Reference(keys))
}

/// Expands `@k1,k2,...` into the keys it names.
pub fn parse_alias(text: &str, path: &str) -> Result<Vec<String>> {
    match text.trim().strip_prefix('@') {
        Some(rest) => reference_keys(rest.split(','), path),
        None => Err(BraidError::malformed(path, "alias must start with '@'")),
    }
}

fn strip_alias(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('@').unwrap_or(text)
}

/// Trims and dedups the keys of a reference, keeping first occurrence order.
/// Every form of reference goes through here.
fn reference_keys<'a>(names: impl IntoIterator<Item = &'a str>, path: &str) -> Result<Vec<String>> {
    let mut keys: Vec<String> = Vec::new();

    for key in names.into_iter().map(str::trim) {
        if key.is_empty() {
            return Err(BraidError::malformed(path, "empty key in reference"));
        }
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }

    Ok(keys)
}

fn invocation(map: &Map<String, Value>, marker: &str) -> Invocation {
    Invocation {
        marker: marker.to_string(),
        payload: map[marker].clone(),
        options: map
            .iter()
            .filter(|(key, _)| *key != marker)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

fn classify_group(map: &Map<String, Value>, markers: &Capabilities, path: &str) -> Result<Node> {
    let mut throttle = None;
    let mut entries = Vec::with_capacity(map.len());

    for (key, value) in map {
        if key == THROTTLE {
            throttle = match value.as_u64() {
                Some(n) if n > 0 => Some(n as usize),
                _ => {
                    return Err(BraidError::malformed(
                        path,
                        format!("'{THROTTLE}' expects a positive integer"),
                    ));
                }
            };
            continue;
        }

        if key.starts_with('$') {
            return Err(BraidError::malformed(
                path,
                format!("unsupported marker key '{key}'"),
            ));
        }

        if key.is_empty() || key.contains(',') || key.contains('@') {
            return Err(BraidError::malformed(
                path,
                format!("branch key '{key}' cannot be referenced"),
            ));
        }

        let child = classify_at(value, markers, &join(path, key))?;
        entries.push((key.clone(), Arc::new(child)));
    }

    Ok(Node::ParallelGroup(Group { entries, throttle }))
}

pub(crate) fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}/{segment}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn markers() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.register_fn("$llm", |inv| Ok(inv.payload.clone()));
        caps
    }

    fn kind(raw: Value) -> NodeKind {
        classify(&raw, &markers()).unwrap().kind()
    }

    #[test]
    fn test_shapes() {
        assert_eq!(kind(json!({"$wait": ["a"]})), NodeKind::Reference);
        assert_eq!(kind(json!("@a,b")), NodeKind::Reference);
        assert_eq!(kind(json!({"$llm": "hi", "model": "m"})), NodeKind::Leaf);
        assert_eq!(kind(json!({"a": 1})), NodeKind::ParallelGroup);
        assert_eq!(kind(json!([1, 2])), NodeKind::Chain);
        assert_eq!(kind(json!(3)), NodeKind::Leaf);
        assert_eq!(kind(json!("plain")), NodeKind::Leaf);
        assert_eq!(kind(json!(null)), NodeKind::Leaf);
    }

    #[test]
    fn test_wait_wins_over_marker() {
        assert_eq!(kind(json!({"$wait": ["a"]})), NodeKind::Reference);
        let err = classify(&json!({"$wait": ["a"], "$llm": "x"}), &markers()).unwrap_err();
        assert!(matches!(err, BraidError::MalformedNode { .. }));
    }

    #[test]
    fn test_alias_matches_explicit_form() {
        let caps = markers();
        let alias = classify(&json!("@x, y"), &caps).unwrap();
        let explicit = classify(&json!({"$wait": ["x", "y"]}), &caps).unwrap();

        assert_eq!(alias, explicit);
        assert_eq!(alias, Node::Reference(vec!["x".into(), "y".into()]));
    }

    #[test]
    fn test_wait_string_forms() {
        let caps = markers();
        let expected = Node::Reference(vec!["a".into(), "b".into()]);

        for raw in [
            json!({"$wait": "@a,b"}),
            json!({"$wait": "a, b"}),
            json!({"$wait": ["@a", " b "]}),
            json!("@a,b"),
        ] {
            assert_eq!(classify(&raw, &caps).unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn test_duplicate_keys_collapse_in_every_form() {
        let caps = markers();
        let alias = classify(&json!("@x,x"), &caps).unwrap();
        let explicit = classify(&json!({"$wait": ["x", "x"]}), &caps).unwrap();

        assert_eq!(alias, explicit);
        assert_eq!(alias, Node::Reference(vec!["x".into()]));
    }

    #[test]
    fn test_malformed_alias() {
        for raw in [json!("@"), json!("@a,,b"), json!("@ ,a")] {
            let err = classify(&raw, &markers()).unwrap_err();
            assert!(matches!(err, BraidError::MalformedNode { .. }), "{raw}");
        }
    }

    #[test]
    fn test_malformed_wait() {
        for raw in [
            json!({"$wait": []}),
            json!({"$wait": 3}),
            json!({"$wait": [""]}),
            json!({"$wait": ["@"]}),
            json!({"$wait": [1]}),
            json!({"$wait": "@"}),
        ] {
            let err = classify(&raw, &markers()).unwrap_err();
            assert!(matches!(err, BraidError::MalformedNode { .. }), "{raw}");
        }
    }

    #[test]
    fn test_unsupported_marker_reports_path() {
        let err = classify(&json!({"a": [1, {"$shell": "ls"}]}), &markers()).unwrap_err();

        match err {
            BraidError::MalformedNode { path, reason } => {
                assert_eq!(path, "a/1");
                assert!(reason.contains("$shell"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_invocation_options() {
        let node = classify(
            &json!({"$llm": "Hello %(name)s", "name": "World", "model": "m"}),
            &markers(),
        )
        .unwrap();

        let Node::Leaf(Leaf::Invoke(invocation)) = node else {
            panic!("expected an invocation");
        };

        assert_eq!(invocation.marker, "$llm");
        assert_eq!(invocation.payload, json!("Hello %(name)s"));
        assert_eq!(invocation.option_str("model"), Some("m"));
        assert_eq!(invocation.option_str("name"), Some("World"));
    }

    #[test]
    fn test_group_keeps_declared_order_and_throttle() {
        let node = classify(&json!({"z": 1, "a": 2, "m": 3, "$throttle": 2}), &markers()).unwrap();

        let Node::ParallelGroup(group) = node else {
            panic!("expected a group");
        };
        let keys: Vec<_> = group.entries.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(group.throttle, Some(2));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let raw = json!({"q1": {"$llm": "ping"}, "q2": ["@q1", {"$llm": "pong"}]});
        let caps = markers();

        let first = classify(&raw, &caps).unwrap();
        for _ in 0..8 {
            assert_eq!(classify(&raw, &caps).unwrap(), first);
        }
    }
}
