//! Per-connection WebSocket handling.
//!
//! Each connection gets two halves: a reader loop (this module) and a writer
//! task draining the connection's outbound channel. The writer task is the
//! only code that touches the socket's sink, so every component that wants
//! to reach this peer (registration replies, saga commands, queue-full
//! errors) goes through the same serialized path.
//!
//! Lifecycle: the first frame must be a `register` with a non-empty id;
//! anything else closes the connection. After that, frames are classified
//! and routed: events to the intake queue, step acknowledgments straight to
//! the saga engine, everything else logged and ignored. Read errors and
//! close frames end the loop; cleanup unregisters the peer and runs the
//! saga engine's connection-loss hook.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error};
use uuid::Uuid;

use crate::kernel::registry::OutboundSender;
use crate::kernel::ServerDeps;
use crate::protocol::{
    Envelope, STATUS_QUEUE_FULL, TYPE_EVENT, TYPE_REGISTER, TYPE_STEP_COMPLETED, TYPE_STEP_FAILED,
};
use crate::server::app::AppState;

/// `GET /ws`: upgrade and hand the socket to the connection loop.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.deps))
}

async fn handle_socket(socket: WebSocket, deps: Arc<ServerDeps>) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (sender, mut outbound) = OutboundSender::channel();

    // Writer task: sole owner of the sink. Exits when every sender clone is
    // gone (connection cleanup) or the peer stops accepting writes.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    error!(error = %err, "failed to serialize outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    deps.logs.info("new websocket connection established");

    // Registration phase: exactly one envelope, and it must register.
    let Some(registration) = read_first_envelope(&mut stream).await else {
        deps.logs
            .error("connection closed before a valid registration frame");
        drop(sender);
        let _ = writer.await;
        return;
    };

    if registration.kind != TYPE_REGISTER {
        deps.logs.error(format!(
            "expected registration message, got: {}",
            registration.kind
        ));
        drop(sender);
        let _ = writer.await;
        return;
    }
    let sim_id = match registration.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            deps.logs.error("registration missing id");
            drop(sender);
            let _ = writer.await;
            return;
        }
    };
    let name = registration.name.unwrap_or_default();

    deps.handle_register(&sim_id, &name, conn_id, sender.clone());

    if sender.send(Envelope::registered_ok()).is_err() {
        deps.handle_disconnect(&sim_id, conn_id);
        return;
    }

    // Main read loop.
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(sim = %sim_id, error = %err, "read error, closing connection");
                break;
            }
        };
        match message {
            Message::Text(text) => handle_frame(&deps, &sim_id, &sender, text.as_str()),
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(sim = %sim_id, "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    deps.handle_disconnect(&sim_id, conn_id);
    drop(sender);
    let _ = writer.await;
}

/// Read until the first parseable text frame or end of stream. Control
/// frames before registration are skipped; a malformed first frame closes
/// the connection.
async fn read_first_envelope(stream: &mut SplitStream<WebSocket>) -> Option<Envelope> {
    while let Some(message) = stream.next().await {
        match message.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        }
    }
    None
}

/// Classify and route one inbound text frame from a registered peer.
fn handle_frame(deps: &ServerDeps, sim_id: &str, sender: &OutboundSender, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            deps.logs
                .error(format!("malformed frame from {sim_id}: {err}"));
            return;
        }
    };

    match envelope.kind.as_str() {
        TYPE_EVENT => {
            // The queue consumer stamps `source` from the registered id;
            // whatever the client put on the wire is ignored.
            if !deps.queue.enqueue(sim_id, envelope) {
                deps.logs
                    .error(format!("failed to enqueue event from {sim_id}"));
                let _ = sender.send(Envelope::error(STATUS_QUEUE_FULL));
            }
        }
        TYPE_STEP_COMPLETED => {
            let Some((saga_id, step_id)) = ack_fields(&envelope) else {
                deps.logs.error(format!(
                    "step.completed from {sim_id} missing saga_id or step_id"
                ));
                return;
            };
            deps.logs.info(format!(
                "step completion from {sim_id}: saga {saga_id}, step {step_id}"
            ));
            deps.sagas.on_step_completed(&saga_id, step_id);
        }
        TYPE_STEP_FAILED => {
            let Some((saga_id, step_id)) = ack_fields(&envelope) else {
                deps.logs.error(format!(
                    "step.failed from {sim_id} missing saga_id or step_id"
                ));
                return;
            };
            deps.logs.info(format!(
                "step failure from {sim_id}: saga {saga_id}, step {step_id}"
            ));
            deps.sagas.on_step_failed(&saga_id, step_id);
        }
        other => {
            deps.logs
                .warn(format!("unknown message type from {sim_id}: {other}"));
        }
    }
}

/// A step acknowledgment must carry a non-empty `saga_id` and a `step_id`.
fn ack_fields(envelope: &Envelope) -> Option<(String, usize)> {
    let saga_id = envelope.saga_id.as_deref().filter(|id| !id.is_empty())?;
    let step_id = envelope.step_id?;
    Some((saga_id.to_string(), step_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryScenarioStore;

    fn deps() -> Arc<ServerDeps> {
        ServerDeps::new(2, 100, Arc::new(InMemoryScenarioStore::new()))
    }

    fn sender() -> (OutboundSender, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        OutboundSender::channel()
    }

    #[test]
    fn test_ack_fields_require_saga_id_and_step_id() {
        let mut env = Envelope {
            kind: TYPE_STEP_COMPLETED.to_string(),
            ..Envelope::default()
        };
        assert!(ack_fields(&env).is_none());

        env.saga_id = Some("saga_1".to_string());
        assert!(ack_fields(&env).is_none());

        env.step_id = Some(0);
        assert_eq!(ack_fields(&env), Some(("saga_1".to_string(), 0)));

        env.saga_id = Some(String::new());
        assert!(ack_fields(&env).is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_not_fatal() {
        let deps = deps();
        let (tx, mut rx) = sender();

        handle_frame(&deps, "cyber", &tx, "{not json");
        assert!(rx.try_recv().is_err());
        // A later valid frame still works.
        handle_frame(&deps, "cyber", &tx, r#"{"type":"event","event_type":"x"}"#);
        assert_eq!(deps.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_event_frame_is_enqueued() {
        let deps = deps();
        let (tx, _rx) = sender();

        handle_frame(&deps, "cyber", &tx, r#"{"type":"event","event_type":"a"}"#);
        assert_eq!(deps.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_replies_error_to_producer() {
        let deps = deps(); // queue capacity 2, no consumer running
        let (tx, mut rx) = sender();
        let frame = r#"{"type":"event","event_type":"a"}"#;

        handle_frame(&deps, "cyber", &tx, frame);
        handle_frame(&deps, "cyber", &tx, frame);
        assert!(rx.try_recv().is_err());

        handle_frame(&deps, "cyber", &tx, frame);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.status.as_deref(), Some(STATUS_QUEUE_FULL));
    }

    #[tokio::test]
    async fn test_unknown_type_is_logged_and_ignored() {
        let deps = deps();
        let (tx, mut rx) = sender();

        handle_frame(&deps, "cyber", &tx, r#"{"type":"mystery"}"#);
        assert!(rx.try_recv().is_err());
        assert_eq!(deps.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_ack_without_step_id_is_rejected() {
        let deps = deps();
        let (tx, _rx) = sender();

        // Must not panic or reach the engine; just logged.
        handle_frame(
            &deps,
            "vr",
            &tx,
            r#"{"type":"step.completed","saga_id":"saga_1"}"#,
        );
        handle_frame(&deps, "vr", &tx, r#"{"type":"step.failed","step_id":0}"#);
    }
}
