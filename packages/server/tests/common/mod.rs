// Shared harness for integration tests.
//
// Simulations are registered through the same path a WebSocket connection
// uses, but backed by in-memory channels: each `SimClient` holds the
// receiving end of the outbound channel the server writes to, so tests can
// observe exactly the frames a real peer would see.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use simhub_server::kernel::registry::OutboundSender;
use simhub_server::kernel::saga::SagaView;
use simhub_server::kernel::ServerDeps;
use simhub_server::protocol::Envelope;
use simhub_server::store::InMemoryScenarioStore;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct TestServer {
    pub deps: Arc<ServerDeps>,
}

impl TestServer {
    /// Server with a running event processor.
    pub fn start() -> Self {
        let server = Self::with_queue_capacity(64);
        let _ = server.deps.start_event_processor();
        server
    }

    /// Server whose event processor has NOT been started; events buffer in
    /// the queue until `start_processor` is called.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        let deps = ServerDeps::new(capacity, 1000, Arc::new(InMemoryScenarioStore::new()));
        Self { deps }
    }

    pub fn start_processor(&self) {
        let _ = self.deps.start_event_processor();
    }

    pub fn load_scenario(&self, yaml: &str) {
        self.deps
            .scenarios
            .load_yaml(yaml)
            .expect("test scenario must parse");
    }

    /// Register a simulation the way the connection handler would.
    pub fn connect(&self, id: &str) -> SimClient {
        let (sender, rx) = OutboundSender::channel();
        let conn_id = Uuid::new_v4();
        self.deps.handle_register(id, id, conn_id, sender);
        SimClient {
            id: id.to_string(),
            conn_id,
            rx,
        }
    }

    /// Enqueue an event as the connection handler does: the source id comes
    /// from the registration, never from the frame.
    pub fn emit(&self, source: &str, event_type: &str) -> bool {
        self.deps.queue.enqueue(
            source,
            Envelope {
                kind: "event".to_string(),
                event_type: Some(event_type.to_string()),
                ..Envelope::default()
            },
        )
    }

    /// Wait until the intake queue is drained and the processor has had a
    /// chance to finish the last item.
    pub async fn drain_queue(&self) {
        for _ in 0..500 {
            if self.deps.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pub fn sagas(&self) -> Vec<SagaView> {
        self.deps.sagas.snapshot()
    }

    pub fn ack_completed(&self, saga_id: &str, step_id: usize) {
        self.deps.sagas.on_step_completed(saga_id, step_id);
    }

    pub fn ack_failed(&self, saga_id: &str, step_id: usize) {
        self.deps.sagas.on_step_failed(saga_id, step_id);
    }
}

pub struct SimClient {
    pub id: String,
    pub conn_id: Uuid,
    rx: UnboundedReceiver<Envelope>,
}

impl SimClient {
    /// Next frame, which must be a command.
    pub async fn expect_command(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a command frame")
            .expect("connection channel closed");
        assert_eq!(frame.kind, "command", "expected a command frame: {frame:?}");
        frame
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("expected no frame for {}, got {frame:?}", self.id);
        }
    }

    pub fn try_frame(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Simulate the connection going away, exactly as the handler's cleanup
    /// path does.
    pub fn disconnect(self, server: &TestServer) {
        server.deps.handle_disconnect(&self.id, self.conn_id);
    }
}
