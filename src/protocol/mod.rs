//! Wire protocol shared by the session client and the bridge
//!
//! - `messages`: the tagged JSON message kinds in both directions
//! - `state`: the client-side protocol state machine (turns, transcript,
//!   handshake phase)

pub mod messages;
pub mod state;

pub use messages::{ClientEvent, ServerEvent, SessionConfig, NORMAL_CLOSURE};
pub use state::{Effect, ProtocolState, Role, SessionPhase, Turn};
