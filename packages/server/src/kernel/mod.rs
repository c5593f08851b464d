//! The coordination engine: registry, rules, event queue, sagas.

pub mod deps;
pub mod event_queue;
pub mod log_store;
pub mod registry;
pub mod saga;
pub mod scenario;

pub use deps::ServerDeps;
pub use event_queue::EventQueue;
pub use log_store::{LogEntry, LogLevel, LogStore};
pub use registry::{OutboundSender, Simulation, SimulationRegistry};
pub use saga::{Saga, SagaEngine, SagaError, SagaStatus, StepStatus};
pub use scenario::{Action, Event, Rule, Scenario, ScenarioError, ScenarioManager};
