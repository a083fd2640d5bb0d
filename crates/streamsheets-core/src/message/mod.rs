//! Messages, message stores and the paths formulas use to address them.

mod path;
mod store;

pub use path::{MessagePath, Section, StoreRef, loop_keys, remove_at, set_at, value_at};
pub use store::{Inbox, MessageStore};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type SharedInbox = Arc<Mutex<Inbox>>;
pub type SharedStore = Arc<Mutex<MessageStore>>;

/// A discrete unit of data flowing between sheets and endpoints.
///
/// `metadata.id` always mirrors `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub data: Value,
    pub metadata: Map<String, Value>,
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(data: Value) -> Self {
        Message::with_id(new_message_id(), data)
    }

    pub fn with_id(id: impl Into<String>, data: Value) -> Self {
        let id = id.into();
        let mut metadata = Map::new();
        metadata.insert("id".to_string(), Value::String(id.clone()));
        Message { id, data, metadata }
    }

    /// Build a message from its wire shape `{ data, metadata: { id, .. } }`.
    /// Anything else becomes the data of a fresh message.
    pub fn from_json(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Message::new(value.clone());
        };
        if !map.contains_key("data") || map.keys().any(|k| k != "data" && k != "metadata") {
            return Message::new(value.clone());
        }
        let metadata = map
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let id = metadata
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_message_id);
        let mut message = Message::with_id(id, map.get("data").cloned().unwrap_or(Value::Null));
        for (key, value) in metadata {
            if key != "id" {
                message.metadata.insert(key, value);
            }
        }
        message
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("data".to_string(), self.data.clone());
        map.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        Value::Object(map)
    }
}

/// Every message store of a machine: one inbox per sheet plus the outbox.
#[derive(Clone, Default)]
pub struct MessageHub {
    inboxes: Arc<RwLock<HashMap<String, SharedInbox>>>,
    outbox: SharedStore,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inbox(&self, sheet: &str, inbox: SharedInbox) {
        self.inboxes.write().insert(sheet.to_string(), inbox);
    }

    pub fn inbox(&self, sheet: &str) -> Option<SharedInbox> {
        self.inboxes.read().get(sheet).cloned()
    }

    pub fn outbox(&self) -> &SharedStore {
        &self.outbox
    }

    /// Put a message into an inbox or the outbox. Returns false if the sheet is unknown.
    pub fn deliver(&self, store: &StoreRef, message: Message) -> bool {
        match store {
            StoreRef::Outbox => {
                self.outbox.lock().put(message);
                true
            }
            StoreRef::Inbox(sheet) => match self.inbox(sheet) {
                Some(inbox) => {
                    inbox.lock().put(message);
                    true
                }
                None => false,
            },
        }
    }

    pub fn clear_all(&self) {
        for inbox in self.inboxes.read().values() {
            inbox.lock().clear();
        }
        self.outbox.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_carries_id() {
        let message = Message::with_id("m1", json!({"a": 1}));
        assert_eq!(message.metadata["id"], json!("m1"));
        assert_eq!(Message::new(Value::Null).id.len(), 36);
    }

    #[test]
    fn test_wire_shape_roundtrip() {
        let wire = json!({"data": {"a": 1}, "metadata": {"id": "x", "source": "mqtt"}});
        let message = Message::from_json(&wire);
        assert_eq!(message.id, "x");
        assert_eq!(message.metadata["source"], json!("mqtt"));
        assert_eq!(message.to_json(), wire);
    }

    #[test]
    fn test_plain_json_becomes_data() {
        let message = Message::from_json(&json!({"temperature": 21}));
        assert_eq!(message.data, json!({"temperature": 21}));
        assert_eq!(message.metadata["id"], json!(message.id));
    }

    #[test]
    fn test_hub_delivery() {
        let hub = MessageHub::new();
        hub.add_inbox("S1", Arc::new(Mutex::new(Inbox::new(None))));
        assert!(hub.deliver(&StoreRef::Inbox("S1".into()), Message::new(json!(1))));
        assert!(!hub.deliver(&StoreRef::Inbox("S9".into()), Message::new(json!(1))));
        assert!(hub.deliver(&StoreRef::Outbox, Message::new(json!(2))));
        assert_eq!(hub.inbox("S1").unwrap().lock().len(), 1);
        hub.clear_all();
        assert!(hub.outbox().lock().is_empty());
    }
}
