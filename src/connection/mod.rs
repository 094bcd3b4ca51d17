// Client side of the bridge connection: transport abstraction, lifecycle
// state machine and the manager that ties them together.

pub mod manager;
pub mod state;
pub mod transport;

pub use manager::{ConnectionConfig, ConnectionManager, ConnectionStats, SessionObserver, WeakConnection};
pub use state::{Backoff, ConnectionState};
pub use transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};
