//! Wire protocol for simulation connections.
//!
//! Every frame is one JSON object: a flat [`Envelope`] whose meaning is
//! selected by `type`. Fields not relevant to a given frame are omitted on
//! the wire and `None` in memory.
//!
//! Inbound (client → server): `register`, `event`, `step.completed`,
//! `step.failed`. Outbound (server → client): `registered`, `command`,
//! `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type sent by a client to join the registry.
pub const TYPE_REGISTER: &str = "register";
/// Frame type carrying a simulation-emitted event.
pub const TYPE_EVENT: &str = "event";
/// Frame type acknowledging a dispatched step.
pub const TYPE_STEP_COMPLETED: &str = "step.completed";
/// Frame type reporting a failed step.
pub const TYPE_STEP_FAILED: &str = "step.failed";
/// Frame type confirming registration.
pub const TYPE_REGISTERED: &str = "registered";
/// Frame type carrying a command to a simulation.
pub const TYPE_COMMAND: &str = "command";
/// Frame type reporting a server-side error to the producer.
pub const TYPE_ERROR: &str = "error";

/// Status value on `error` frames when the event queue rejected an event.
pub const STATUS_QUEUE_FULL: &str = "queue_full";

/// A single framed message, in either direction.
///
/// The envelope is deliberately flat: clients in several runtimes parse it,
/// and a flat object with optional fields is the least surprising shape.
/// Unknown fields on inbound frames are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Ignored on inbound frames; the server is authoritative for the
    /// source of an event and stamps it from the registered connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Envelope {
    /// Registration confirmation sent right after a successful `register`.
    pub fn registered_ok() -> Self {
        Self {
            kind: TYPE_REGISTERED.to_string(),
            status: Some("ok".to_string()),
            ..Self::default()
        }
    }

    /// Error frame with the given status (e.g. [`STATUS_QUEUE_FULL`]).
    pub fn error(status: &str) -> Self {
        Self {
            kind: TYPE_ERROR.to_string(),
            status: Some(status.to_string()),
            ..Self::default()
        }
    }

    /// Command frame dispatched to a simulation on behalf of a saga step.
    pub fn command(
        command: impl Into<String>,
        params: Option<Value>,
        saga_id: impl Into<String>,
        step_id: usize,
    ) -> Self {
        Self {
            kind: TYPE_COMMAND.to_string(),
            command: Some(command.into()),
            params,
            saga_id: Some(saga_id.into()),
            step_id: Some(step_id),
            ..Self::default()
        }
    }
}
