use std::collections::VecDeque;

use serde_json::Value;
use streamsheets_engine::engine::ErrorCode;

use super::path::{Section, remove_at};
use super::Message;

/// Ordered, id-keyed message queue.
///
/// Ids are unique: putting a message whose id is already stored replaces it in
/// place. The most recently put message is the "top" one.
#[derive(Clone, Debug, Default)]
pub struct MessageStore {
    messages: VecDeque<Message>,
    max_size: Option<usize>,
    top: Option<String>,
}

impl MessageStore {
    pub fn new(max_size: Option<usize>) -> Self {
        MessageStore {
            messages: VecDeque::new(),
            max_size: max_size.filter(|n| *n > 0),
            top: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Append (or replace by id). Returns the message evicted to stay within `max_size`.
    pub fn put(&mut self, message: Message) -> Option<Message> {
        self.top = Some(message.id.clone());
        if let Some(slot) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message;
            return None;
        }
        self.messages.push_back(message);
        match self.max_size {
            Some(max) if self.messages.len() > max => self.messages.pop_front(),
            _ => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn first(&self) -> Option<&Message> {
        self.messages.front()
    }

    fn top_id(&self) -> Option<String> {
        self.top
            .as_ref()
            .filter(|id| self.get(id).is_some())
            .cloned()
            .or_else(|| self.messages.back().map(|m| m.id.clone()))
    }

    /// Look up by id; the no-id form returns the top message.
    pub fn peek(&self, id: Option<&str>) -> Option<&Message> {
        match id {
            Some(id) => self.get(id),
            None => self.get(&self.top_id()?),
        }
    }

    pub fn peek_mut(&mut self, id: Option<&str>) -> Option<&mut Message> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.top_id()?,
        };
        self.get_mut(&id)
    }

    /// Remove and return by id; the no-id form takes the oldest message.
    pub fn pop(&mut self, id: Option<&str>) -> Option<Message> {
        match id {
            Some(id) => {
                let index = self.messages.iter().position(|m| m.id == id)?;
                self.messages.remove(index)
            }
            None => self.messages.pop_front(),
        }
    }

    /// Delete one message, or every message with `"*"`. Absent ids are a no-op.
    pub fn delete(&mut self, id: &str) {
        if id == "*" {
            self.clear();
        } else {
            self.pop(Some(id));
        }
    }

    /// Delete a data or metadata subtree of a stored message.
    ///
    /// An empty key path clears the whole section. The metadata `id` key is
    /// never removed.
    pub fn delete_subtree(
        &mut self,
        id: Option<&str>,
        section: Section,
        keys: &[String],
    ) -> Result<(), ErrorCode> {
        let message = self.peek_mut(id).ok_or(ErrorCode::NoMsg)?;
        delete_in_message(message, section, keys)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.top = None;
    }
}

pub(crate) fn delete_in_message(
    message: &mut Message,
    section: Section,
    keys: &[String],
) -> Result<(), ErrorCode> {
    match section {
        Section::Message => Err(ErrorCode::Value),
        Section::Data if keys.is_empty() => {
            message.data = Value::Object(Default::default());
            Ok(())
        }
        Section::Data => {
            if remove_at(&mut message.data, keys) {
                Ok(())
            } else {
                Err(ErrorCode::NoMsgData)
            }
        }
        Section::Metadata if keys.is_empty() => {
            message.metadata.retain(|k, _| k == "id");
            Ok(())
        }
        Section::Metadata if keys.len() == 1 && keys[0] == "id" => Err(ErrorCode::NoMsgData),
        Section::Metadata => {
            let mut metadata = Value::Object(std::mem::take(&mut message.metadata));
            let removed = remove_at(&mut metadata, keys);
            if let Value::Object(map) = metadata {
                message.metadata = map;
            }
            if removed { Ok(()) } else { Err(ErrorCode::NoMsgData) }
        }
    }
}

/// A sheet's inbox: a message store plus the message currently being processed.
#[derive(Clone, Debug, Default)]
pub struct Inbox {
    store: MessageStore,
    current: Option<String>,
}

impl Inbox {
    pub fn new(max_size: Option<usize>) -> Self {
        Inbox {
            store: MessageStore::new(max_size),
            current: None,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn put(&mut self, message: Message) -> Option<Message> {
        self.store.put(message)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The message being processed, if it is still stored.
    pub fn current(&self) -> Option<&Message> {
        self.store.get(self.current.as_deref()?)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref().filter(|id| self.store.get(id).is_some())
    }

    /// Look up by id; the no-id form returns the current message.
    pub fn peek(&self, id: Option<&str>) -> Option<&Message> {
        match id {
            Some(id) => self.store.get(id),
            None => self.current(),
        }
    }

    pub fn peek_mut(&mut self, id: Option<&str>) -> Option<&mut Message> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.current.clone()?,
        };
        self.store.get_mut(&id)
    }

    /// Drop the current message (it has been fully processed).
    pub fn detach_current(&mut self) -> Option<Message> {
        let id = self.current.take()?;
        self.store.pop(Some(&id))
    }

    /// Make the oldest message current. Returns its id.
    pub fn advance(&mut self) -> Option<&str> {
        self.current = self.store.first().map(|m| m.id.clone());
        self.current.as_deref()
    }

    pub fn delete(&mut self, id: Option<&str>) {
        match id {
            Some("*") => self.clear(),
            Some(id) => self.store.delete(id),
            None => {
                self.detach_current();
            }
        }
    }

    pub fn delete_subtree(
        &mut self,
        id: Option<&str>,
        section: Section,
        keys: &[String],
    ) -> Result<(), ErrorCode> {
        let message = self.peek_mut(id).ok_or(ErrorCode::NoMsg)?;
        delete_in_message(message, section, keys)
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.current = None;
    }
}
