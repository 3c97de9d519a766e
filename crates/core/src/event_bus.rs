//! In-process event bus — source of trigger events for the engine.
//!
//! Domain events (subscriber created/updated, message opened/clicked,
//! purchase made, cart abandoned, attribute changed) are published here and
//! fan out to subscribed handlers. Delivery is at-least-once from the
//! caller's point of view; consumers de-duplicate on `event_id`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// A domain event observed by the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub name: String,
    pub subscriber_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Convenience builder for events with minimal boilerplate.
pub fn make_event(
    name: impl Into<String>,
    subscriber_id: impl Into<String>,
    payload: serde_json::Value,
) -> DomainEvent {
    DomainEvent {
        event_id: Uuid::new_v4(),
        name: name.into(),
        subscriber_id: subscriber_id.into(),
        payload,
        occurred_at: Utc::now(),
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent);
}

pub trait EventBus: Send + Sync {
    /// Registers a handler for `event_name`; `"*"` receives every event.
    fn subscribe(&self, event_name: &str, handler: Arc<dyn EventHandler>);
    fn publish(&self, event: DomainEvent);
}

/// Single-process bus that dispatches synchronously to subscribers.
#[derive(Default)]
pub struct InProcessEventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InProcessEventBus {
    fn subscribe(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    fn publish(&self, event: DomainEvent) {
        debug!(event_id = %event.event_id, event = %event.name, "Event published");
        let handlers = self.handlers.read();
        for key in [event.name.as_str(), "*"] {
            if let Some(subscribed) = handlers.get(key) {
                for handler in subscribed {
                    handler.handle(&event);
                }
            }
        }
    }
}

/// Captures published events for tests.
#[derive(Default)]
pub struct CaptureHandler {
    events: Mutex<Vec<DomainEvent>>,
}

impl CaptureHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

impl EventHandler for CaptureHandler {
    fn handle(&self, event: &DomainEvent) {
        self.events.lock().push(event.clone());
    }
}
