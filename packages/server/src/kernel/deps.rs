//! Shared dependency bundle for the transport and admin layers.
//!
//! One [`ServerDeps`] is built at startup and handed around behind an `Arc`.
//! It also owns the event-processing pipeline: the single queue consumer
//! that turns matched events into sagas.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::kernel::event_queue::{EventQueue, QueuedEvent};
use crate::kernel::log_store::LogStore;
use crate::kernel::registry::{OutboundSender, SimulationRegistry};
use crate::kernel::saga::SagaEngine;
use crate::kernel::scenario::{Event, ScenarioManager};
use crate::store::ScenarioStore;

/// Everything the WebSocket and HTTP layers need.
pub struct ServerDeps {
    pub registry: SimulationRegistry,
    pub scenarios: ScenarioManager,
    pub sagas: SagaEngine,
    pub queue: EventQueue,
    pub logs: LogStore,
    pub store: Arc<dyn ScenarioStore>,
}

impl ServerDeps {
    pub fn new(
        queue_capacity: usize,
        log_capacity: usize,
        store: Arc<dyn ScenarioStore>,
    ) -> Arc<Self> {
        let registry = SimulationRegistry::new();
        Arc::new(Self {
            scenarios: ScenarioManager::new(),
            sagas: SagaEngine::new(registry.clone()),
            queue: EventQueue::new(queue_capacity),
            logs: LogStore::with_capacity(log_capacity),
            store,
            registry,
        })
    }

    /// Spawn the single event-queue consumer.
    ///
    /// All rule matching and saga creation happens on this task, one event
    /// at a time, in arrival order. Returns `None` if already started.
    pub fn start_event_processor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let deps = Arc::clone(self);
        self.queue.run(move |item| deps.process_event(item))
    }

    /// Register a connection, replacing any previous peer with the same id.
    ///
    /// A replaced peer is gone as far as its sagas are concerned, so the
    /// connection-loss hook runs against the old registration.
    pub fn handle_register(
        &self,
        id: &str,
        name: &str,
        conn_id: Uuid,
        sender: OutboundSender,
    ) {
        let previous = self.registry.register(id, name, conn_id, sender);
        if previous.is_some() {
            self.logs.warn(format!(
                "simulation {id} re-registered, replacing previous connection"
            ));
            self.sagas.handle_simulation_disconnected(id);
        }
        self.logs
            .info(format!("simulation registered: {id} ({name})"));
    }

    /// Connection cleanup. Scoped to `conn_id` so a stale handler whose
    /// registration was replaced does not touch the replacement.
    pub fn handle_disconnect(&self, sim_id: &str, conn_id: Uuid) {
        if self.registry.unregister_connection(sim_id, conn_id) {
            self.logs
                .info(format!("simulation disconnected: {sim_id}"));
            self.sagas.handle_simulation_disconnected(sim_id);
        }
    }

    /// The queue consumer's processor: match the event, create a saga when
    /// any rule fired.
    fn process_event(&self, item: QueuedEvent) {
        let event = Event {
            source: item.source_id,
            event_type: item.envelope.event_type.unwrap_or_default(),
            payload: item.envelope.payload,
        };
        self.logs.info(format!(
            "event received from {}: {}",
            event.source, event.event_type
        ));

        let actions = self.scenarios.match_event(&event);
        if actions.is_empty() {
            debug!(event_type = %event.event_type, "no matching rules for event");
            return;
        }

        match self.sagas.create_saga(&actions) {
            Ok(saga) => {
                self.logs.info(format!(
                    "saga {} created from event {} with {} steps",
                    saga.saga_id,
                    event.event_type,
                    actions.len()
                ));
            }
            Err(err) => {
                // Conflicts and dispatch failures drop the event from this
                // rule's perspective; nothing is retried.
                self.logs.error(format!(
                    "failed to create saga for event {}: {err}",
                    event.event_type
                ));
            }
        }
    }
}
