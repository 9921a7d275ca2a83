//! kvbus — a networked in-memory key/value store with TTL expiration,
//! snapshot persistence, and an integrated publish/subscribe bus.
//!
//! Five cooperating pieces, leaves first: [`store`] (the value/expiry map),
//! [`snapshot`] (durable save/load), [`bus`] (channels and fan-out),
//! [`protocol`] (wire encoding and dispatch) and [`server`] (the listener and
//! its background tasks).

/// Default host the server binds to when not overridden by [`config::Config`].
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port the server binds to when not overridden by [`config::Config`].
pub const DEFAULT_PORT: u16 = 65432;

/// Default path for the persistence snapshot file.
pub const DEFAULT_SNAPSHOT_PATH: &str = "persistence.json";

pub mod client;
pub mod config;

mod bus;
mod conn;
mod protocol;
mod snapshot;
mod store;

pub mod server;

/// Error type for operations that cross a process boundary (bootstrap, I/O).
///
/// Request-level validation failures are represented separately by
/// `protocol::ProtocolError` since they must render as specific wire strings
/// rather than bubble up as a process error.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` for kvbus operations that can fail with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
