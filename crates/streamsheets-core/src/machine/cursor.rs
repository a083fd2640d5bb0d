//! Iteration over the current inbox message.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StreamsheetsError};
use crate::message::{Inbox, Message, loop_keys, value_at};

/// Position within the collection a sheet loops over.
///
/// Without a loop path, or when the path resolves to a scalar or an empty
/// collection, the whole message is the single loop element.
#[derive(Clone, Debug, Default)]
pub struct LoopCursor {
    keys: Option<Vec<String>>,
    message_id: Option<String>,
    index: usize,
    element: Option<String>,
}

/// Element keys of the collection at `keys` in the message data.
fn elements(message: &Message, keys: &[String]) -> Vec<String> {
    match value_at(&message.data, keys) {
        Some(Value::Array(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

impl LoopCursor {
    pub fn new(loop_path: Option<&str>) -> Result<Self> {
        let keys = match loop_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => Some(
                loop_keys(path).ok_or_else(|| StreamsheetsError::InvalidLoopPath(path.to_string()))?,
            ),
            None => None,
        };
        Ok(LoopCursor {
            keys,
            ..LoopCursor::default()
        })
    }

    /// Zero-based position of the current element.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Data keys of the current element (loop path plus element key), if looping.
    pub fn element_keys(&self) -> Option<Vec<String>> {
        let mut keys = self.keys.clone()?;
        keys.push(self.element.clone()?);
        Some(keys)
    }

    fn element_keys_of(&self, message: &Message) -> Vec<String> {
        self.keys
            .as_deref()
            .map(|keys| elements(message, keys))
            .unwrap_or_default()
    }

    /// Whether advancing would produce something to process.
    pub fn has_work(&self, inbox: &Inbox, endless: bool) -> bool {
        let current = inbox.current_id();
        if current.is_some() && current == self.message_id.as_deref() {
            if endless {
                return true;
            }
            let remaining = inbox
                .current()
                .map(|m| self.element_keys_of(m).len())
                .unwrap_or(0);
            if self.index + 1 < remaining {
                return true;
            }
        }
        inbox.store().iter().any(|m| Some(m.id.as_str()) != current)
    }

    /// Move to the next element, finishing the current message when its
    /// collection is exhausted. Returns the id of the message being processed.
    pub fn advance(&mut self, inbox: &mut Inbox, endless: bool) -> Option<String> {
        let current = inbox.current_id().map(str::to_string);
        if current.is_some() && current == self.message_id {
            let keys = inbox
                .current()
                .map(|m| self.element_keys_of(m))
                .unwrap_or_default();
            if self.index + 1 < keys.len() {
                self.index += 1;
                self.element = keys.get(self.index).cloned();
                return current;
            }
            if endless {
                self.index = 0;
                self.element = keys.first().cloned();
                return current;
            }
            if let Some(done) = inbox.detach_current() {
                debug!(id = %done.id, "message processed");
            }
        }

        let next = inbox.advance().map(str::to_string);
        self.message_id = next.clone();
        self.index = 0;
        self.element = inbox
            .current()
            .and_then(|m| self.element_keys_of(m).into_iter().next());
        next
    }

    pub fn reset(&mut self) {
        self.message_id = None;
        self.index = 0;
        self.element = None;
    }
}
