//! Trigger listener. Receives domain events from the event bus, hands
//! them to the queue as trigger-evaluation jobs, and turns matching
//! events into new executions. Event delivery is at-least-once, so every
//! (event, automation, subscriber) combination is de-duplicated before an
//! execution is created.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use dripflow_core::collaborators::SubscriberStore;
use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::event_bus::{DomainEvent, EventBus, EventHandler};
use dripflow_core::types::{AttributeChange, AutomationStatus, Trigger, TriggerKind};
use dripflow_queue::{JobHandler, JobKind, JobQueue, NewJob, QueueJob};

use crate::engine::ExecutionEngine;

/// Event name attribute triggers listen on; the payload names the changed
/// attribute and carries `old_value`/`new_value`.
pub const ATTRIBUTE_CHANGED_EVENT: &str = "subscriber.attribute_changed";

pub struct TriggerListener {
    engine: Arc<ExecutionEngine>,
    subscribers: Arc<dyn SubscriberStore>,
    queue: Arc<dyn JobQueue>,
    /// Idempotency keys of events already turned into executions, with
    /// their insertion time for the retention sweep.
    seen: DashMap<String, DateTime<Utc>>,
}

impl TriggerListener {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        subscribers: Arc<dyn SubscriberStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            subscribers,
            queue,
            seen: DashMap::new(),
        })
    }

    /// Subscribes to every event on the bus.
    pub fn attach(self: &Arc<Self>, bus: &dyn EventBus) {
        bus.subscribe("*", self.clone());
    }

    /// Evaluates one event against all active automations, creating
    /// executions where the trigger and entry condition match. A
    /// transient failure starting any execution is propagated so the
    /// dispatching job retries; its dedup key is released first, so the
    /// retry is not absorbed as a duplicate.
    pub fn evaluate_event(&self, event: &DomainEvent) -> EngineResult<usize> {
        let mut created = 0;
        let mut transient: Option<EngineError> = None;
        for automation in self.engine.automations_snapshot() {
            if automation.status != AutomationStatus::Active {
                continue;
            }
            if !trigger_matches(&automation.trigger, event) {
                continue;
            }

            let key = format!(
                "{}:{}:{}",
                event.event_id, automation.id, event.subscriber_id
            );
            if self.seen.insert(key.clone(), Utc::now()).is_some() {
                // Replayed delivery; absorbed, not an error.
                debug!(event_id = %event.event_id, automation_id = %automation.id, "Duplicate trigger delivery");
                continue;
            }

            let context = self.merged_event_context(event);
            if let Some(filter) = &automation.trigger.filter {
                if !filter.evaluate(&context) {
                    continue;
                }
            }
            if let Some(entry) = &automation.entry_condition {
                if !entry.evaluate(&context) {
                    continue;
                }
            }
            if !automation.allow_re_entry
                && self
                    .engine
                    .has_open_execution(&automation.id, &event.subscriber_id)
            {
                debug!(
                    automation_id = %automation.id,
                    subscriber_id = %event.subscriber_id,
                    "Open execution exists, skipping re-entry"
                );
                continue;
            }

            match self.engine.start_execution(
                &automation,
                &event.subscriber_id,
                event.payload.clone(),
            ) {
                Ok(execution_id) => {
                    info!(
                        event = %event.name,
                        automation_id = %automation.id,
                        execution_id = %execution_id,
                        "Trigger matched"
                    );
                    metrics::counter!("triggers.fired").increment(1);
                    created += 1;
                }
                Err(e) if e.is_transient() => {
                    // The execution was not created; release the key so a
                    // redelivery gets another try instead of being eaten.
                    self.seen.remove(&key);
                    warn!(automation_id = %automation.id, error = %e, "Failed to start execution, will retry");
                    transient = Some(e);
                }
                Err(e) => {
                    warn!(automation_id = %automation.id, error = %e, "Failed to start execution")
                }
            }
        }
        match transient {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Drops dedup keys older than the retention window. Returns how many
    /// were removed.
    pub fn sweep_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let expired: Vec<String> = self
            .seen
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.seen.remove(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired trigger dedup keys");
        }
        expired.len()
    }

    /// Event payload overlaid on subscriber attributes; payload wins.
    fn merged_event_context(&self, event: &DomainEvent) -> serde_json::Value {
        let mut merged = self
            .subscribers
            .get(&event.subscriber_id)
            .map(|s| s.attributes)
            .unwrap_or_else(|_| json!({}));
        if let (Some(base), Some(overlay)) = (merged.as_object_mut(), event.payload.as_object()) {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

fn trigger_matches(trigger: &Trigger, event: &DomainEvent) -> bool {
    match trigger.kind {
        TriggerKind::Event | TriggerKind::Behavior | TriggerKind::TimeBased => {
            trigger.event == event.name
        }
        TriggerKind::Attribute => {
            if event.name != ATTRIBUTE_CHANGED_EVENT {
                return false;
            }
            if event.payload.get("attribute").and_then(|v| v.as_str())
                != Some(trigger.event.as_str())
            {
                return false;
            }
            match &trigger.change {
                None | Some(AttributeChange::Any) => true,
                Some(AttributeChange::Specific {
                    old_value,
                    new_value,
                }) => {
                    event.payload.get("old_value") == Some(old_value)
                        && event.payload.get("new_value") == Some(new_value)
                }
            }
        }
    }
}

/// Bus callbacks only enqueue; the actual evaluation runs on the worker
/// pool as a trigger-evaluation job.
impl EventHandler for TriggerListener {
    fn handle(&self, event: &DomainEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = %event.name, error = %e, "Unserializable event dropped");
                return;
            }
        };
        if let Err(e) = self
            .queue
            .enqueue(NewJob::new(JobKind::TriggerEvaluation, payload))
        {
            warn!(event = %event.name, error = %e, "Failed to enqueue trigger evaluation");
        }
    }
}

impl JobHandler for TriggerListener {
    fn kind(&self) -> JobKind {
        JobKind::TriggerEvaluation
    }

    fn handle(&self, job: &QueueJob) -> EngineResult<()> {
        let event: DomainEvent = serde_json::from_value(job.payload.clone())
            .map_err(EngineError::Serialization)?;
        self.evaluate_event(&event).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::StepEvaluator;
    use chrono::Utc;
    use dripflow_abtest::AbTestEngine;
    use dripflow_core::collaborators::{CaptureSender, InMemorySubscriberStore};
    use dripflow_core::config::EngineConfig;
    use dripflow_core::event_bus::make_event;
    use dripflow_core::predicates::{ComparisonOperator, PredicateGroup};
    use dripflow_core::types::{Automation, Step, StepKind};
    use dripflow_queue::MemoryJobQueue;
    use uuid::Uuid;

    fn automation(trigger: Trigger) -> Automation {
        let exit = Uuid::new_v4();
        Automation {
            id: Uuid::new_v4(),
            name: "welcome".into(),
            description: String::new(),
            status: AutomationStatus::Active,
            trigger,
            entry_condition: None,
            entry_step_id: exit,
            steps: [(
                exit,
                Step {
                    id: exit,
                    kind: StepKind::Exit,
                },
            )]
            .into(),
            allow_re_entry: false,
            max_iterations: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event_trigger(event: &str) -> Trigger {
        Trigger {
            kind: TriggerKind::Event,
            event: event.into(),
            filter: None,
            change: None,
        }
    }

    fn harness() -> (Arc<MemoryJobQueue>, Arc<ExecutionEngine>, Arc<TriggerListener>) {
        let queue = Arc::new(MemoryJobQueue::default());
        let subscribers = Arc::new(InMemorySubscriberStore::new());
        let evaluator = StepEvaluator::new(
            CaptureSender::new(),
            subscribers.clone(),
            Arc::new(AbTestEngine::new()),
        );
        let engine = Arc::new(ExecutionEngine::new(
            evaluator,
            queue.clone(),
            EngineConfig::default(),
        ));
        let listener = TriggerListener::new(engine.clone(), subscribers, queue.clone());
        (queue, engine, listener)
    }

    #[test]
    fn matching_event_creates_execution_and_job() {
        let (queue, engine, listener) = harness();
        engine.insert_automation(automation(event_trigger("subscriber.created")));

        let created = listener
            .evaluate_event(&make_event(
                "subscriber.created",
                "sub-1",
                json!({"source": "signup"}),
            ))
            .unwrap();

        assert_eq!(created, 1);
        let executions = engine.executions_snapshot();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].subscriber_id, "sub-1");
        assert_eq!(executions[0].context["source"], json!("signup"));
        assert_eq!(queue.stats().kind(JobKind::StepExecution).waiting, 1);
    }

    #[test]
    fn replayed_event_is_absorbed() {
        let (_, engine, listener) = harness();
        engine.insert_automation(automation(event_trigger("subscriber.created")));

        let event = make_event("subscriber.created", "sub-1", json!({}));
        assert_eq!(listener.evaluate_event(&event).unwrap(), 1);
        assert_eq!(listener.evaluate_event(&event).unwrap(), 0);
        assert_eq!(engine.executions_snapshot().len(), 1);
    }

    #[test]
    fn open_execution_blocks_re_entry() {
        let (_, engine, listener) = harness();
        engine.insert_automation(automation(event_trigger("cart.abandoned")));

        listener
            .evaluate_event(&make_event("cart.abandoned", "sub-1", json!({})))
            .unwrap();
        // Fresh event id, same subscriber, execution still open.
        let created = listener
            .evaluate_event(&make_event("cart.abandoned", "sub-1", json!({})))
            .unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn trigger_filter_gates_on_payload_and_attributes() {
        let (_, engine, listener) = harness();
        let mut trigger = event_trigger("purchase.made");
        trigger.filter = Some(PredicateGroup::single(
            "total",
            ComparisonOperator::GreaterThan,
            json!(100),
        ));
        engine.insert_automation(automation(trigger));

        assert_eq!(
            listener
                .evaluate_event(&make_event("purchase.made", "sub-1", json!({"total": 50})))
                .unwrap(),
            0
        );
        assert_eq!(
            listener
                .evaluate_event(&make_event("purchase.made", "sub-1", json!({"total": 150})))
                .unwrap(),
            1
        );
    }

    #[test]
    fn attribute_trigger_matches_specific_change() {
        let (_, engine, listener) = harness();
        let trigger = Trigger {
            kind: TriggerKind::Attribute,
            event: "plan".into(),
            filter: None,
            change: Some(AttributeChange::Specific {
                old_value: json!("free"),
                new_value: json!("pro"),
            }),
        };
        engine.insert_automation(automation(trigger));

        let miss = make_event(
            ATTRIBUTE_CHANGED_EVENT,
            "sub-1",
            json!({"attribute": "plan", "old_value": "free", "new_value": "team"}),
        );
        assert_eq!(listener.evaluate_event(&miss).unwrap(), 0);

        let hit = make_event(
            ATTRIBUTE_CHANGED_EVENT,
            "sub-1",
            json!({"attribute": "plan", "old_value": "free", "new_value": "pro"}),
        );
        assert_eq!(listener.evaluate_event(&hit).unwrap(), 1);
    }

    /// Fails the next enqueue with a transient error, then delegates.
    struct FlakyQueue {
        inner: MemoryJobQueue,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl FlakyQueue {
        fn new() -> Self {
            Self {
                inner: MemoryJobQueue::default(),
                fail_next: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    impl JobQueue for FlakyQueue {
        fn enqueue(&self, job: dripflow_queue::NewJob) -> EngineResult<Uuid> {
            if self
                .fail_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(EngineError::Transient("queue unavailable".into()));
            }
            self.inner.enqueue(job)
        }

        fn dequeue_ready(&self, max: usize) -> EngineResult<Vec<QueueJob>> {
            self.inner.dequeue_ready(max)
        }

        fn ack(&self, job_id: Uuid) -> EngineResult<()> {
            self.inner.ack(job_id)
        }

        fn fail(&self, job_id: Uuid, error: &str) -> EngineResult<()> {
            self.inner.fail(job_id, error)
        }

        fn cancel_where(&self, predicate: &dyn Fn(&QueueJob) -> bool) -> EngineResult<usize> {
            self.inner.cancel_where(predicate)
        }

        fn get(&self, job_id: Uuid) -> Option<QueueJob> {
            self.inner.get(job_id)
        }

        fn stats(&self) -> dripflow_queue::QueueStats {
            self.inner.stats()
        }
    }

    #[test]
    fn transient_start_failure_surfaces_and_redelivery_succeeds() {
        let queue = Arc::new(FlakyQueue::new());
        let subscribers = Arc::new(InMemorySubscriberStore::new());
        let evaluator = StepEvaluator::new(
            CaptureSender::new(),
            subscribers.clone(),
            Arc::new(AbTestEngine::new()),
        );
        let engine = Arc::new(ExecutionEngine::new(
            evaluator,
            queue.clone(),
            EngineConfig::default(),
        ));
        let listener = TriggerListener::new(engine.clone(), subscribers, queue.clone());
        engine.insert_automation(automation(event_trigger("subscriber.created")));

        let event = make_event("subscriber.created", "sub-1", json!({}));

        // First delivery hits the transient enqueue failure. The error must
        // surface so the dispatching job retries instead of acking.
        let err = listener.evaluate_event(&event).unwrap_err();
        assert!(err.is_transient());
        assert!(engine.executions_snapshot().is_empty());

        // Redelivery of the same event is not absorbed as a duplicate.
        assert_eq!(listener.evaluate_event(&event).unwrap(), 1);
        assert_eq!(engine.executions_snapshot().len(), 1);
    }

    #[test]
    fn sweep_drops_aged_dedup_keys_but_keeps_fresh_ones() {
        let (_, engine, listener) = harness();
        engine.insert_automation(automation(event_trigger("subscriber.created")));

        let replayed = make_event("subscriber.created", "sub-1", json!({}));
        listener.evaluate_event(&replayed).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        listener.evaluate_event(&make_event("subscriber.created", "sub-2", json!({}))).unwrap();

        // Only the key older than the window goes.
        assert_eq!(listener.sweep_expired(Duration::from_millis(10)), 1);
        assert_eq!(listener.sweep_expired(Duration::from_millis(10)), 0);

        // The replayed event re-enters evaluation; re-entry still blocks it
        // because its execution is open, so no duplicate is created.
        assert_eq!(listener.evaluate_event(&replayed).unwrap(), 0);
        assert_eq!(engine.executions_snapshot().len(), 2);
    }

    #[test]
    fn bus_events_flow_through_the_queue() {
        let (queue, engine, listener) = harness();
        engine.insert_automation(automation(event_trigger("subscriber.created")));

        EventHandler::handle(
            listener.as_ref(),
            &make_event("subscriber.created", "sub-1", json!({})),
        );
        assert_eq!(queue.stats().kind(JobKind::TriggerEvaluation).waiting, 1);

        let job = queue.dequeue_ready(1).unwrap().remove(0);
        JobHandler::handle(listener.as_ref(), &job).unwrap();
        assert_eq!(engine.executions_snapshot().len(), 1);
    }
}
