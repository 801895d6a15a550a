//! Device-facing TCP server.
//!
//! Accepts long-lived device connections, tracks which device sits behind
//! which connection, and answers inbound commands.

mod connection;
mod dispatcher;
mod listener;
mod session;

// Re-export public API
pub use connection::{Connection, ConnectionId, Lane};
pub use dispatcher::Dispatcher;
pub use listener::TcpServer;
pub use session::{DeviceSession, SessionInfo, SessionRegistry};
