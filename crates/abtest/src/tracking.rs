//! Engagement tracking: bridges message and purchase events from the bus
//! into variant counters. The event payload carries `campaign_id`; the
//! variant is resolved from the assignment recorded at send time, so
//! engagement for subscribers outside the test is ignored.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use dripflow_core::event_bus::{DomainEvent, EventBus, EventHandler};

use crate::engine::AbTestEngine;

pub const MESSAGE_OPENED_EVENT: &str = "message.opened";
pub const MESSAGE_CLICKED_EVENT: &str = "message.clicked";
pub const PURCHASE_MADE_EVENT: &str = "purchase.made";

pub struct EngagementTracker {
    engine: Arc<AbTestEngine>,
}

impl EngagementTracker {
    pub fn new(engine: Arc<AbTestEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    /// Subscribes to the open, click and purchase events.
    pub fn attach(self: &Arc<Self>, bus: &dyn EventBus) {
        for event in [
            MESSAGE_OPENED_EVENT,
            MESSAGE_CLICKED_EVENT,
            PURCHASE_MADE_EVENT,
        ] {
            bus.subscribe(event, self.clone());
        }
    }
}

fn campaign_id(event: &DomainEvent) -> Option<Uuid> {
    event
        .payload
        .get("campaign_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

impl EventHandler for EngagementTracker {
    fn handle(&self, event: &DomainEvent) {
        let Some(campaign_id) = campaign_id(event) else {
            return;
        };
        let Some(variant_id) = self
            .engine
            .recorded_assignment(&campaign_id, &event.subscriber_id)
        else {
            debug!(
                %campaign_id,
                subscriber_id = %event.subscriber_id,
                "Engagement event without a recorded assignment"
            );
            return;
        };
        match event.name.as_str() {
            MESSAGE_OPENED_EVENT => self.engine.record_opened(&campaign_id, &variant_id),
            MESSAGE_CLICKED_EVENT => self.engine.record_clicked(&campaign_id, &variant_id),
            PURCHASE_MADE_EVENT => {
                let revenue = event
                    .payload
                    .get("total")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                self.engine
                    .record_conversion(&campaign_id, &variant_id, revenue);
            }
            _ => {}
        }
    }
}
