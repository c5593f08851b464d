//! Saga lifecycle engine.
//!
//! A saga is the unit of cross-simulation work: one matched rule becomes one
//! saga, each action one step. Steps are dispatched strictly one at a time;
//! step *i+1* goes out only after the target acknowledged step *i*, and a
//! failure anywhere rolls back every completed step in reverse order by
//! sending its compensation command.
//!
//! # Synchronization
//!
//! The engine is an explicit state machine, not a task per saga. Sagas are
//! advanced by whichever task delivers the next acknowledgment, which makes
//! late and duplicate acknowledgments naturally idempotent: an ack for a step
//! that is not `InFlight` is ignored.
//!
//! Per-simulation exclusion is an owner table: a target id maps to the saga
//! currently holding it. Acquisition happens once at creation, for every
//! target the saga will touch, all-or-nothing and without blocking; a
//! conflicting creation fails immediately naming the busy targets. Locks are
//! held until the saga terminates.
//!
//! No lock of any kind is held across a send: outbound frames go through the
//! per-connection channel, which never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kernel::registry::SimulationRegistry;
use crate::kernel::scenario::Action;
use crate::protocol::Envelope;

/// Overall status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SagaStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Compensating,
}

impl SagaStatus {
    /// Completed and Failed are terminal; everything else can still move.
    pub fn is_terminal(self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }
}

/// Status of one step inside a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// One action materialized into a saga.
#[derive(Debug, Clone)]
pub struct SagaStep {
    pub index: usize,
    pub target_id: String,
    pub command: String,
    pub params: Option<Value>,
    pub compensate_command: Option<String>,
    pub compensate_params: Option<Value>,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Mutable portion of a saga, guarded by the saga's own lock.
#[derive(Debug)]
struct SagaState {
    status: SagaStatus,
    current_step: usize,
    steps: Vec<SagaStep>,
}

/// A distributed transaction across one or more simulations.
///
/// The record is retained after termination so the admin API can show
/// finished sagas; only the engine mutates it.
#[derive(Debug)]
pub struct Saga {
    pub saga_id: String,
    pub created_at: DateTime<Utc>,
    /// Distinct target ids this saga acquired, in first-appearance order.
    locked_targets: Vec<String>,
    state: RwLock<SagaState>,
}

impl Saga {
    pub fn status(&self) -> SagaStatus {
        read_lock(&self.state).status
    }

    pub fn locked_targets(&self) -> &[String] {
        &self.locked_targets
    }

    /// Serializable point-in-time copy for the observability API.
    pub fn view(&self) -> SagaView {
        let state = read_lock(&self.state);
        SagaView {
            saga_id: self.saga_id.clone(),
            status: state.status,
            current_step: state.current_step,
            created_at: self.created_at,
            targets: self.locked_targets.clone(),
            steps: state
                .steps
                .iter()
                .map(|step| StepView {
                    index: step.index,
                    target_id: step.target_id.clone(),
                    command: step.command.clone(),
                    status: step.status,
                    created_at: step.created_at,
                    completed_at: step.completed_at,
                })
                .collect(),
        }
    }
}

/// Serializable view of a step.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub index: usize,
    pub target_id: String,
    pub command: String,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Serializable view of a saga.
#[derive(Debug, Clone, Serialize)]
pub struct SagaView {
    pub saga_id: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub steps: Vec<StepView>,
}

/// Why a step could not be handed to its target.
#[derive(Debug, Error)]
pub enum DispatchFailure {
    #[error("target simulation not registered: {0}")]
    TargetNotFound(String),
    #[error("connection to {0} is closed")]
    SendFailed(String),
    #[error("step index {0} is out of range")]
    InvalidStep(usize),
}

impl DispatchFailure {
    fn target(&self) -> &str {
        match self {
            DispatchFailure::TargetNotFound(target) | DispatchFailure::SendFailed(target) => {
                target
            }
            DispatchFailure::InvalidStep(_) => "",
        }
    }
}

/// Failure reported by [`SagaEngine::create_saga`].
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("cannot create a saga with no actions")]
    NoActions,

    /// One or more targets are held by another non-terminal saga.
    #[error("target simulations are busy in other sagas: {}", .busy.join(", "))]
    Conflict { busy: Vec<String> },

    /// The first step could not be dispatched; the saga was recorded as
    /// Failed and its locks released. Nothing completed, so nothing was
    /// compensated.
    #[error("saga {saga_id}: dispatch of step 0 to {target} failed: {reason}")]
    Dispatch {
        saga_id: String,
        target: String,
        #[source]
        reason: DispatchFailure,
    },
}

/// Creates, advances, fails and compensates sagas.
pub struct SagaEngine {
    registry: SimulationRegistry,
    sagas: RwLock<HashMap<String, Arc<Saga>>>,
    /// target id → saga id currently holding the exclusion lock.
    owners: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
}

impl SagaEngine {
    pub fn new(registry: SimulationRegistry) -> Self {
        Self {
            registry,
            sagas: RwLock::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Unique over the process lifetime; the timestamp prefix keeps ids
    /// roughly sorted by creation.
    fn next_saga_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("saga_{}_{}", Utc::now().timestamp_micros(), seq)
    }

    /// Create a saga from a matched rule's actions and dispatch its first
    /// step.
    ///
    /// Every distinct target is acquired up front, all-or-nothing; if any is
    /// busy the whole creation fails with [`SagaError::Conflict`] and no
    /// frame is sent.
    pub fn create_saga(&self, actions: &[Action]) -> Result<Arc<Saga>, SagaError> {
        if actions.is_empty() {
            return Err(SagaError::NoActions);
        }

        let mut targets: Vec<String> = Vec::new();
        for action in actions {
            if !targets.contains(&action.send_to) {
                targets.push(action.send_to.clone());
            }
        }

        let saga_id = self.next_saga_id();

        {
            let mut owners = lock(&self.owners);
            let busy: Vec<String> = targets
                .iter()
                .filter(|target| owners.contains_key(target.as_str()))
                .cloned()
                .collect();
            if !busy.is_empty() {
                debug!(?busy, "saga creation rejected, targets busy");
                return Err(SagaError::Conflict { busy });
            }
            for target in &targets {
                owners.insert(target.clone(), saga_id.clone());
            }
        }

        let now = Utc::now();
        let steps = actions
            .iter()
            .enumerate()
            .map(|(index, action)| SagaStep {
                index,
                target_id: action.send_to.clone(),
                command: action.command.clone(),
                params: action.params.clone(),
                compensate_command: action.compensate_command.clone(),
                compensate_params: action.compensate_params.clone(),
                status: StepStatus::Pending,
                created_at: now,
                completed_at: None,
            })
            .collect();

        let saga = Arc::new(Saga {
            saga_id: saga_id.clone(),
            created_at: now,
            locked_targets: targets,
            state: RwLock::new(SagaState {
                status: SagaStatus::Pending,
                current_step: 0,
                steps,
            }),
        });

        write_lock(&self.sagas).insert(saga_id.clone(), saga.clone());
        info!(
            saga_id = %saga_id,
            steps = actions.len(),
            targets = saga.locked_targets.len(),
            "saga created"
        );

        if let Err(reason) = self.dispatch_step(&saga, 0) {
            // The first step never went out, so nothing completed and there
            // is nothing to compensate.
            write_lock(&saga.state).status = SagaStatus::Failed;
            self.release_targets(&saga);
            warn!(saga_id = %saga_id, error = %reason, "failed to dispatch first step");
            return Err(SagaError::Dispatch {
                target: reason.target().to_string(),
                saga_id,
                reason,
            });
        }

        Ok(saga)
    }

    /// Send the command frame for one step and mark it in flight.
    fn dispatch_step(&self, saga: &Arc<Saga>, index: usize) -> Result<(), DispatchFailure> {
        let (target_id, command, params) = {
            let state = read_lock(&saga.state);
            let step = state
                .steps
                .get(index)
                .ok_or(DispatchFailure::InvalidStep(index))?;
            (step.target_id.clone(), step.command.clone(), step.params.clone())
        };

        let sim = self
            .registry
            .lookup(&target_id)
            .ok_or_else(|| DispatchFailure::TargetNotFound(target_id.clone()))?;

        let frame = Envelope::command(command.clone(), params, saga.saga_id.clone(), index);
        sim.send(frame)
            .map_err(|_| DispatchFailure::SendFailed(target_id.clone()))?;

        let mut state = write_lock(&saga.state);
        if let Some(step) = state.steps.get_mut(index) {
            step.status = StepStatus::InFlight;
        }
        state.current_step = index;
        if state.status == SagaStatus::Pending {
            state.status = SagaStatus::InProgress;
        }
        debug!(
            saga_id = %saga.saga_id,
            step = index,
            target = %target_id,
            command = %command,
            "step dispatched"
        );
        Ok(())
    }

    /// A target acknowledged a step. Advances to the next step, or completes
    /// the saga when this was the last one.
    ///
    /// Unknown sagas, out-of-range indices and acknowledgments for steps
    /// that are not in flight are logged and ignored.
    pub fn on_step_completed(&self, saga_id: &str, step_id: usize) {
        let Some(saga) = self.get(saga_id) else {
            warn!(saga_id, step_id, "step.completed for unknown saga, ignoring");
            return;
        };

        let finished = {
            let mut state = write_lock(&saga.state);
            if state.status.is_terminal() {
                debug!(saga_id, step_id, "ack for terminal saga, ignoring");
                return;
            }
            let Some(step) = state.steps.get_mut(step_id) else {
                warn!(saga_id, step_id, "step.completed with invalid step id, ignoring");
                return;
            };
            if step.status != StepStatus::InFlight {
                debug!(
                    saga_id,
                    step_id,
                    status = ?step.status,
                    "step is not in flight, ignoring late or duplicate ack"
                );
                return;
            }
            step.status = StepStatus::Completed;
            step.completed_at = Some(Utc::now());

            let last = step_id + 1 == state.steps.len();
            if last {
                state.status = SagaStatus::Completed;
            } else {
                state.current_step = step_id + 1;
            }
            last
        };
        debug!(saga_id, step = step_id, "step completed");

        if finished {
            info!(saga_id, "saga completed");
            self.release_targets(&saga);
            return;
        }

        let next = step_id + 1;
        if let Err(reason) = self.dispatch_step(&saga, next) {
            warn!(
                saga_id,
                step = next,
                error = %reason,
                "failed to dispatch next step, compensating"
            );
            self.compensate(&saga, step_id);
            self.release_targets(&saga);
        }
    }

    /// A target reported a failed step. The saga fails and every previously
    /// completed step is compensated in reverse order.
    pub fn on_step_failed(&self, saga_id: &str, step_id: usize) {
        let Some(saga) = self.get(saga_id) else {
            warn!(saga_id, step_id, "step.failed for unknown saga, ignoring");
            return;
        };

        {
            let mut state = write_lock(&saga.state);
            if state.status.is_terminal() {
                debug!(saga_id, step_id, "failure report for terminal saga, ignoring");
                return;
            }
            let Some(step) = state.steps.get_mut(step_id) else {
                warn!(saga_id, step_id, "step.failed with invalid step id, ignoring");
                return;
            };
            step.status = StepStatus::Failed;
            state.status = SagaStatus::Failed;
        }
        warn!(saga_id, step = step_id, "step failed, rolling back completed steps");

        if let Some(last_completed) = step_id.checked_sub(1) {
            self.compensate(&saga, last_completed);
        }
        self.release_targets(&saga);
    }

    /// Send compensation commands for completed steps, from `from` down to
    /// step 0.
    ///
    /// Best effort and fire-and-forget: a step without a compensation
    /// command, a vanished target or a failed send is logged and skipped;
    /// the loop always runs to the front and the saga ends Failed.
    fn compensate(&self, saga: &Arc<Saga>, from: usize) {
        write_lock(&saga.state).status = SagaStatus::Compensating;
        info!(saga_id = %saga.saga_id, from, "compensating in reverse order");

        for index in (0..=from).rev() {
            let (target_id, compensate_command, compensate_params, status) = {
                let state = read_lock(&saga.state);
                let Some(step) = state.steps.get(index) else {
                    continue;
                };
                (
                    step.target_id.clone(),
                    step.compensate_command.clone(),
                    step.compensate_params.clone(),
                    step.status,
                )
            };

            if status != StepStatus::Completed {
                debug!(
                    saga_id = %saga.saga_id,
                    step = index,
                    ?status,
                    "step never completed, no compensation"
                );
                continue;
            }

            let command = match compensate_command.as_deref() {
                Some(cmd) if !cmd.is_empty() => cmd.to_string(),
                _ => {
                    debug!(
                        saga_id = %saga.saga_id,
                        step = index,
                        "step has no compensation command, skipping"
                    );
                    continue;
                }
            };

            let Some(sim) = self.registry.lookup(&target_id) else {
                warn!(
                    saga_id = %saga.saga_id,
                    step = index,
                    target = %target_id,
                    "compensation target no longer registered, skipping"
                );
                continue;
            };

            let frame = Envelope::command(command, compensate_params, saga.saga_id.clone(), index);
            if sim.send(frame).is_err() {
                warn!(
                    saga_id = %saga.saga_id,
                    step = index,
                    target = %target_id,
                    "failed to send compensation command, skipping"
                );
                continue;
            }
            debug!(
                saga_id = %saga.saga_id,
                step = index,
                target = %target_id,
                "compensation command sent"
            );

            let mut state = write_lock(&saga.state);
            if let Some(step) = state.steps.get_mut(index) {
                step.status = StepStatus::Failed;
            }
        }

        write_lock(&saga.state).status = SagaStatus::Failed;
        info!(saga_id = %saga.saga_id, "compensation finished, saga failed");
    }

    /// Release every exclusion lock the saga holds. Safe to call more than
    /// once; a lock taken over by a later saga is left alone.
    fn release_targets(&self, saga: &Saga) {
        let mut owners = lock(&self.owners);
        for target in &saga.locked_targets {
            if owners
                .get(target)
                .is_some_and(|owner| owner == &saga.saga_id)
            {
                owners.remove(target);
                debug!(saga_id = %saga.saga_id, target = %target, "released exclusion lock");
            }
        }
    }

    /// A simulation's connection went away (or its registration was
    /// replaced).
    ///
    /// If the saga holding that simulation has a step in flight against it,
    /// that acknowledgment will never arrive, so synthesize the failure now.
    /// When the in-flight step targets a different, still-connected peer,
    /// the saga is left running: its next dispatch to the departed target
    /// fails through the normal dispatch-error path.
    pub fn handle_simulation_disconnected(&self, sim_id: &str) {
        let owner = lock(&self.owners).get(sim_id).cloned();
        let Some(saga_id) = owner else {
            return;
        };
        let Some(saga) = self.get(&saga_id) else {
            return;
        };

        let inflight = {
            let state = read_lock(&saga.state);
            if state.status.is_terminal() {
                None
            } else {
                state
                    .steps
                    .iter()
                    .find(|step| step.status == StepStatus::InFlight && step.target_id == sim_id)
                    .map(|step| step.index)
            }
        };

        match inflight {
            Some(step_id) => {
                warn!(
                    saga_id = %saga_id,
                    sim = sim_id,
                    step = step_id,
                    "simulation disconnected with a step in flight, failing saga"
                );
                self.on_step_failed(&saga_id, step_id);
            }
            None => {
                debug!(
                    saga_id = %saga_id,
                    sim = sim_id,
                    "simulation disconnected, saga has no step in flight against it"
                );
            }
        }
    }

    pub fn get(&self, saga_id: &str) -> Option<Arc<Saga>> {
        read_lock(&self.sagas).get(saga_id).cloned()
    }

    /// Whether a target is currently held by a non-terminal saga.
    pub fn is_target_locked(&self, target: &str) -> bool {
        lock(&self.owners).contains_key(target)
    }

    /// Number of sagas that have not yet terminated.
    pub fn active_count(&self) -> usize {
        read_lock(&self.sagas)
            .values()
            .filter(|saga| !saga.status().is_terminal())
            .count()
    }

    /// Views of every saga the engine knows about, oldest first.
    pub fn snapshot(&self) -> Vec<SagaView> {
        let mut views: Vec<SagaView> = read_lock(&self.sagas)
            .values()
            .map(|saga| saga.view())
            .collect();
        views.sort_by(|a, b| a.saga_id.cmp(&b.saga_id));
        views
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
