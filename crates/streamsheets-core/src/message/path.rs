//! Message path strings and JSON subtree helpers.
//!
//! Paths look like `[S1][id]`, `[S1][id][data][k1][k2]`, `[outbox][][metadata][k]`.
//! An empty id addresses the current inbox message or the top outbox message.

use std::fmt;

use serde_json::{Map, Value};

const OUTBOX: &str = "outbox";

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum StoreRef {
    Inbox(String),
    Outbox,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Section {
    /// The whole message.
    Message,
    Data,
    Metadata,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessagePath {
    pub store: StoreRef,
    pub id: String,
    pub section: Section,
    pub keys: Vec<String>,
}

fn segments(text: &str) -> Option<Vec<String>> {
    let mut rest = text.trim();
    let mut out = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let end = inner.find(']')?;
        out.push(inner[..end].to_string());
        rest = &inner[end + 1..];
    }
    Some(out)
}

impl MessagePath {
    pub fn new(store: StoreRef, id: impl Into<String>, section: Section, keys: Vec<String>) -> Self {
        MessagePath {
            store,
            id: id.into(),
            section,
            keys,
        }
    }

    pub fn parse(text: &str) -> Option<MessagePath> {
        let segments = segments(text)?;
        let (store, rest) = segments.split_first()?;
        let store = if store.eq_ignore_ascii_case(OUTBOX) {
            StoreRef::Outbox
        } else if store.is_empty() {
            return None;
        } else {
            StoreRef::Inbox(store.clone())
        };
        let id = rest.first().cloned().unwrap_or_default();
        let section = match rest.get(1).map(|s| s.to_ascii_lowercase()) {
            None => Section::Message,
            Some(s) if s == "data" => Section::Data,
            Some(s) if s == "metadata" => Section::Metadata,
            Some(_) => return None,
        };
        let keys = rest.iter().skip(2).cloned().collect();
        Some(MessagePath::new(store, id, section, keys))
    }

    /// Id to look up, `None` for the current/top message.
    pub fn message_id(&self) -> Option<&str> {
        Some(self.id.as_str()).filter(|id| !id.is_empty())
    }

    /// Last named segment: the deepest key, or the message id.
    pub fn leaf_name(&self) -> &str {
        self.keys.last().map(String::as_str).unwrap_or(&self.id)
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.store {
            StoreRef::Inbox(sheet) => write!(f, "[{}]", sheet)?,
            StoreRef::Outbox => write!(f, "[{}]", OUTBOX)?,
        }
        write!(f, "[{}]", self.id)?;
        match self.section {
            Section::Message => return Ok(()),
            Section::Data => write!(f, "[data]")?,
            Section::Metadata => write!(f, "[metadata]")?,
        }
        for key in &self.keys {
            write!(f, "[{}]", key)?;
        }
        Ok(())
    }
}

/// Parse a loop path like `[data][items]` into keys below `data`.
pub fn loop_keys(text: &str) -> Option<Vec<String>> {
    let mut keys = segments(text)?;
    if keys.first().is_some_and(|k| k.eq_ignore_ascii_case("data")) {
        keys.remove(0);
    }
    Some(keys)
}

/// Value at a key path (object keys or array indices).
pub fn value_at<'a>(root: &'a Value, keys: &[String]) -> Option<&'a Value> {
    keys.iter().try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(key.parse::<usize>().ok()?),
        _ => None,
    })
}

/// Set the value at a key path, creating intermediate objects as needed.
pub fn set_at(root: &mut Value, keys: &[String], value: Value) {
    let Some((last, parents)) = keys.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for key in parents {
        node = child_mut(node, key);
    }
    if let Value::Array(items) = node {
        if let Ok(index) = last.parse::<usize>() {
            if index < items.len() {
                items[index] = value;
                return;
            }
            if index == items.len() {
                items.push(value);
                return;
            }
        }
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

fn child_mut<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
    let index = match &*node {
        Value::Array(items) => key.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    if index.is_none() && !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match (node, index) {
        (Value::Array(items), Some(index)) => &mut items[index],
        (Value::Object(map), _) => map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        (other, _) => other,
    }
}

/// Remove the value at a key path. Returns false if nothing was there.
pub fn remove_at(root: &mut Value, keys: &[String]) -> bool {
    let Some((last, parents)) = keys.split_last() else {
        return false;
    };
    let mut node = root;
    for key in parents {
        node = match node {
            Value::Object(map) => match map.get_mut(key) {
                Some(child) => child,
                None => return false,
            },
            Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(child) => child,
                None => return false,
            },
            _ => return false,
        };
    }
    match node {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(path: &[&str]) -> Vec<String> {
        path.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_parse_and_display() {
        let path = MessagePath::parse("[S1][][data][a][0]").unwrap();
        assert_eq!(path.store, StoreRef::Inbox("S1".into()));
        assert_eq!(path.message_id(), None);
        assert_eq!(path.section, Section::Data);
        assert_eq!(path.keys, keys(&["a", "0"]));
        assert_eq!(path.to_string(), "[S1][][data][a][0]");
        assert_eq!(path.leaf_name(), "0");

        let outbox = MessagePath::parse("[outbox][m1]").unwrap();
        assert_eq!(outbox.store, StoreRef::Outbox);
        assert_eq!(outbox.section, Section::Message);
        assert_eq!(outbox.leaf_name(), "m1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MessagePath::parse("S1.data").is_none());
        assert!(MessagePath::parse("[S1][id][payload]").is_none());
        assert!(MessagePath::parse("[][id]").is_none());
        assert!(MessagePath::parse("").is_none());
    }

    #[test]
    fn test_loop_keys() {
        assert_eq!(loop_keys("[data][Positionen]"), Some(keys(&["Positionen"])));
        assert_eq!(loop_keys("[items]"), Some(keys(&["items"])));
        assert_eq!(loop_keys("items"), None);
    }

    #[test]
    fn test_value_set_remove() {
        let mut root = json!({"a": [10, {"b": 1}]});
        assert_eq!(value_at(&root, &keys(&["a", "1", "b"])), Some(&json!(1)));
        assert_eq!(value_at(&root, &keys(&["a", "5"])), None);

        set_at(&mut root, &keys(&["a", "1", "c"]), json!("x"));
        set_at(&mut root, &keys(&["new", "deep"]), json!(true));
        assert_eq!(root["a"][1]["c"], json!("x"));
        assert_eq!(root["new"]["deep"], json!(true));

        assert!(remove_at(&mut root, &keys(&["a", "0"])));
        assert_eq!(root["a"], json!([{"b": 1, "c": "x"}]));
        assert!(!remove_at(&mut root, &keys(&["missing", "x"])));
    }
}
