//! Interfaces of the external collaborators the engine consumes.
//!
//! Subscriber storage and the outbound message transport live elsewhere in
//! the platform; the engine depends only on these traits. In-memory
//! implementations ship for tests and single-node development.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::Subscriber;

/// Result of one outbound send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

pub trait SubscriberStore: Send + Sync {
    fn get(&self, id: &str) -> EngineResult<Subscriber>;
    /// Active subscribers, used to back-fill executions on activation.
    fn list_active(&self) -> Vec<Subscriber>;
}

pub trait MessageSender: Send + Sync {
    fn send(
        &self,
        subscriber_id: &str,
        template_id: &str,
        variables: &serde_json::Value,
    ) -> EngineResult<SendOutcome>;
}

/// In-memory subscriber store.
#[derive(Default)]
pub struct InMemorySubscriberStore {
    subscribers: DashMap<String, Subscriber>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.id.clone(), subscriber);
    }
}

impl SubscriberStore for InMemorySubscriberStore {
    fn get(&self, id: &str) -> EngineResult<Subscriber> {
        self.subscribers
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::NotFound(format!("Subscriber {id}")))
    }

    fn list_active(&self) -> Vec<Subscriber> {
        self.subscribers.iter().map(|s| s.clone()).collect()
    }
}

/// Sender that accepts everything without side effects (dry runs).
pub struct NoOpSender;

impl MessageSender for NoOpSender {
    fn send(
        &self,
        _subscriber_id: &str,
        _template_id: &str,
        _variables: &serde_json::Value,
    ) -> EngineResult<SendOutcome> {
        Ok(SendOutcome {
            success: true,
            provider_message_id: None,
            error: None,
        })
    }
}

pub fn noop_sender() -> Arc<dyn MessageSender> {
    Arc::new(NoOpSender)
}

/// A message recorded by [`CaptureSender`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub subscriber_id: String,
    pub template_id: String,
    pub variables: serde_json::Value,
}

/// In-memory sender that records every send for assertions.
#[derive(Default)]
pub struct CaptureSender {
    sent: Mutex<Vec<SentMessage>>,
}

impl CaptureSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl MessageSender for CaptureSender {
    fn send(
        &self,
        subscriber_id: &str,
        template_id: &str,
        variables: &serde_json::Value,
    ) -> EngineResult<SendOutcome> {
        self.sent.lock().push(SentMessage {
            subscriber_id: subscriber_id.to_string(),
            template_id: template_id.to_string(),
            variables: variables.clone(),
        });
        Ok(SendOutcome {
            success: true,
            provider_message_id: Some(format!("msg-{}", self.sent.lock().len())),
            error: None,
        })
    }
}

/// Sender that fails every call with a transient error, for retry tests.
pub struct FailingSender;

impl MessageSender for FailingSender {
    fn send(
        &self,
        _subscriber_id: &str,
        _template_id: &str,
        _variables: &serde_json::Value,
    ) -> EngineResult<SendOutcome> {
        Err(EngineError::Transient("transport unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capture_sender_records_sends() {
        let sender = CaptureSender::new();
        sender
            .send("sub-1", "welcome_email", &json!({"plan": "pro"}))
            .unwrap();
        assert_eq!(sender.count(), 1);
        assert_eq!(sender.sent()[0].template_id, "welcome_email");
    }

    #[test]
    fn store_miss_is_not_found() {
        let store = InMemorySubscriberStore::new();
        assert!(matches!(
            store.get("missing"),
            Err(EngineError::NotFound(_))
        ));
    }
}
