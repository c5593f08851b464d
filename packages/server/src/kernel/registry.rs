//! Registry of live simulation connections.
//!
//! Each registered simulation is reachable through an [`OutboundSender`], a
//! cheap cloneable handle over an unbounded channel drained by that
//! connection's writer task. Routing a frame through the channel is what
//! serializes writes to a socket: every component that wants to talk to a
//! simulation sends here, and exactly one task performs the actual writes.
//!
//! Registering an id that is already present replaces the previous entry and
//! hands it back to the caller, which is expected to fail any saga still
//! holding that id. Unregistration is scoped to a connection nonce so a
//! handler cleaning up a stale socket cannot evict its replacement.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Envelope;

/// The connection's writer task went away; the frame was not delivered.
#[derive(Debug, Error)]
#[error("simulation connection is closed")]
pub struct ConnectionClosed;

/// Handle for queueing outbound frames to one connection.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl OutboundSender {
    /// Create a sender plus the receiver its writer task will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one frame. The channel is unbounded, so this only fails once
    /// the writer task has exited.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnectionClosed> {
        self.tx.send(envelope).map_err(|_| ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub id: String,
    pub name: String,
    /// Nonce of the connection that registered this entry.
    pub conn_id: Uuid,
    sender: OutboundSender,
}

impl Simulation {
    /// Queue one frame for this simulation.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnectionClosed> {
        self.sender.send(envelope)
    }
}

/// Entry in a [`SimulationRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct SimulationInfo {
    pub id: String,
    pub name: String,
}

/// Thread-safe table of live simulations.
#[derive(Clone, Default)]
pub struct SimulationRegistry {
    simulations: Arc<RwLock<HashMap<String, Simulation>>>,
}

impl SimulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`.
    ///
    /// Returns the previous entry when `id` was already registered; the
    /// caller owns telling the saga engine that the old peer is gone.
    pub fn register(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        conn_id: Uuid,
        sender: OutboundSender,
    ) -> Option<Simulation> {
        let id = id.into();
        let sim = Simulation {
            id: id.clone(),
            name: name.into(),
            conn_id,
            sender,
        };
        let mut simulations = write_lock(&self.simulations);
        simulations.insert(id, sim)
    }

    /// Constant-time read of one entry.
    pub fn lookup(&self, id: &str) -> Option<Simulation> {
        let simulations = read_lock(&self.simulations);
        simulations.get(id).cloned()
    }

    /// Remove the entry for `id` regardless of which connection owns it.
    pub fn unregister(&self, id: &str) {
        let mut simulations = write_lock(&self.simulations);
        simulations.remove(id);
    }

    /// Remove the entry for `id` only if it still belongs to `conn_id`.
    ///
    /// Returns whether an entry was removed. A handler whose registration
    /// was replaced sees `false` and must not run disconnect side effects
    /// against the replacement.
    pub fn unregister_connection(&self, id: &str, conn_id: Uuid) -> bool {
        let mut simulations = write_lock(&self.simulations);
        match simulations.get(id) {
            Some(sim) if sim.conn_id == conn_id => {
                simulations.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Copy of the live entries for the observability API.
    pub fn snapshot(&self) -> Vec<SimulationInfo> {
        let simulations = read_lock(&self.simulations);
        let mut entries: Vec<SimulationInfo> = simulations
            .values()
            .map(|sim| SimulationInfo {
                id: sim.id.clone(),
                name: sim.name.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        read_lock(&self.simulations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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

#[cfg(test)]
mod tests {
    use super::*;

    fn register(reg: &SimulationRegistry, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (sender, rx) = OutboundSender::channel();
        reg.register(id, format!("{id} display"), Uuid::new_v4(), sender);
        rx
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = SimulationRegistry::new();
        let _rx = register(&reg, "vr");

        let sim = reg.lookup("vr").unwrap();
        assert_eq!(sim.id, "vr");
        assert_eq!(sim.name, "vr display");
        assert!(reg.lookup("missing").is_none());
    }

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let reg = SimulationRegistry::new();
        let mut rx = register(&reg, "vr");

        let sim = reg.lookup("vr").unwrap();
        sim.send(Envelope::registered_ok()).unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, "registered");
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let reg = SimulationRegistry::new();
        let rx = register(&reg, "vr");
        drop(rx);

        let sim = reg.lookup("vr").unwrap();
        assert!(sim.send(Envelope::registered_ok()).is_err());
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let reg = SimulationRegistry::new();
        let (first_sender, _first_rx) = OutboundSender::channel();
        let first_conn = Uuid::new_v4();
        assert!(reg.register("vr", "first", first_conn, first_sender).is_none());

        let (second_sender, _second_rx) = OutboundSender::channel();
        let previous = reg
            .register("vr", "second", Uuid::new_v4(), second_sender)
            .unwrap();
        assert_eq!(previous.name, "first");
        assert_eq!(previous.conn_id, first_conn);
        assert_eq!(reg.lookup("vr").unwrap().name, "second");
    }

    #[test]
    fn test_unregister_connection_ignores_stale_nonce() {
        let reg = SimulationRegistry::new();
        let (first_sender, _first_rx) = OutboundSender::channel();
        let stale = Uuid::new_v4();
        reg.register("vr", "first", stale, first_sender);

        let (second_sender, _second_rx) = OutboundSender::channel();
        reg.register("vr", "second", Uuid::new_v4(), second_sender);

        // The stale handler's cleanup must not evict the replacement.
        assert!(!reg.unregister_connection("vr", stale));
        assert!(reg.lookup("vr").is_some());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let reg = SimulationRegistry::new();
        let _rx = register(&reg, "vr");
        reg.unregister("vr");
        reg.unregister("vr");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let reg = SimulationRegistry::new();
        let _a = register(&reg, "vr");
        let _b = register(&reg, "cyber");

        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "cyber");
        assert_eq!(snapshot[1].id, "vr");
    }
}
