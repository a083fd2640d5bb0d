//! Stream endpoints: where PUBLISH and REQUEST send their messages.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::Message;

pub type Response = Result<Message, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint {0} is not connected")]
    Disconnected(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// A stream provider reachable by name.
///
/// `request` must not block: the response arrives later through the returned
/// channel, which the issuing sheet polls at the start of each step.
pub trait StreamEndpoint: Send + Sync {
    fn publish(&self, message: &Message, topic: Option<&str>) -> Result<(), EndpointError>;

    fn request(&self, message: Message) -> oneshot::Receiver<Response>;
}

#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<String, Arc<dyn StreamEndpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, endpoint: Arc<dyn StreamEndpoint>) {
        self.endpoints.insert(name.into(), endpoint);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StreamEndpoint>> {
        self.endpoints.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }
}

/// In-process endpoint: records publishes and answers every request with
/// the request's own data.
#[derive(Debug, Default)]
pub struct LoopbackEndpoint {
    published: Mutex<Vec<(Option<String>, Message)>>,
}

impl LoopbackEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(Option<String>, Message)> {
        self.published.lock().clone()
    }
}

impl StreamEndpoint for LoopbackEndpoint {
    fn publish(&self, message: &Message, topic: Option<&str>) -> Result<(), EndpointError> {
        debug!(id = %message.id, topic, "loopback publish");
        self.published
            .lock()
            .push((topic.map(str::to_string), message.clone()));
        Ok(())
    }

    fn request(&self, message: Message) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        let mut response = Message::new(message.data.clone());
        response
            .metadata
            .insert("requestId".to_string(), json!(message.id));
        // the receiver is alive, so this cannot fail
        let _ = tx.send(Ok(response));
        rx
    }
}
