// Simulation orchestration server.
//
// Coordinates heterogeneous simulation clients (cyber ranges, VR/AR
// environments, sensor rigs) over persistent WebSocket connections. Clients
// emit typed events; the server matches each event against the active
// scenario's rules and drives the resulting multi-step transaction as a
// saga: commands dispatched one at a time, acknowledged explicitly, and
// compensated in reverse order on failure.

pub mod config;
pub mod kernel;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::Config;
pub use kernel::ServerDeps;
