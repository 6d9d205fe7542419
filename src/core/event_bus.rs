//! Synchronous publish/subscribe dispatch.
//!
//! Subscriptions are collected on an [`EventBusBuilder`] during setup and
//! frozen into an immutable [`EventBus`] before a run starts, so publishing
//! needs no locking. Delivery is synchronous, in registration order, and a
//! failing handler never stops delivery to the handlers after it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, EventType};

/// Something that reacts to published events
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<()> {
        self(event)
    }
}

#[derive(Clone)]
struct Subscription {
    name: String,
    handler: Arc<dyn EventHandler>,
}

/// A handler failure reported back to the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Name the handler was subscribed under
    pub handler: String,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub error: String,
}

/// Collects subscriptions before a run
#[derive(Default)]
pub struct EventBusBuilder {
    by_type: HashMap<EventType, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one event type
    pub fn subscribe(
        &mut self,
        event_type: EventType,
        name: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> &mut Self {
        self.subscribe_arc(event_type, name, Arc::new(handler))
    }

    pub fn subscribe_arc(
        &mut self,
        event_type: EventType,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.by_type.entry(event_type).or_default().push(Subscription {
            name: name.into(),
            handler,
        });
        self
    }

    /// Register `handler` for every event type. Wildcard handlers run after
    /// the type-specific ones.
    pub fn subscribe_all(
        &mut self,
        name: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> &mut Self {
        self.wildcard.push(Subscription {
            name: name.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Snapshot the subscriber table
    pub fn freeze(self) -> EventBus {
        EventBus {
            by_type: Arc::new(self.by_type),
            wildcard: Arc::new(self.wildcard),
        }
    }
}

/// Immutable subscriber table; cheap to clone
#[derive(Clone, Default)]
pub struct EventBus {
    by_type: Arc<HashMap<EventType, Vec<Subscription>>>,
    wildcard: Arc<Vec<Subscription>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.by_type.len())
            .field("wildcard", &self.wildcard.len())
            .finish()
    }
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Number of handlers an event of this type reaches
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.by_type.get(&event_type).map_or(0, Vec::len) + self.wildcard.len()
    }

    /// Deliver `event` to its handlers and return every failure
    pub fn publish(&self, event: &Event) -> Vec<HandlerFailure> {
        let specific = self
            .by_type
            .get(&event.event_type)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut failures = Vec::new();
        for sub in specific.iter().chain(self.wildcard.iter()) {
            let outcome = catch_unwind(AssertUnwindSafe(|| sub.handler.handle(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(handler = %sub.name, event_type = %event.event_type, %error, "Event handler failed");
            failures.push(HandlerFailure {
                handler: sub.name.clone(),
                event_id: event.id,
                event_type: event.event_type,
                error,
            });
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
