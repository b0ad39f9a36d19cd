//! Store connections: the `Store` abstraction, built-in backends, and the
//! connection registry with its health monitors.

pub mod connection;
pub mod memory;
pub(crate) mod monitor;
pub mod registry;
pub mod sqlite;

pub use connection::{Connection, ConnectionState, Store, StoreError};
pub use memory::{MemoryConnector, MemoryStore};
pub use registry::{ConnectionRegistry, DisconnectEvent, RegistryOptions, StoreConnector};
pub use sqlite::{SqliteConnector, SqliteStore};
