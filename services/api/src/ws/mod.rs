//! WebSocket Relay
//!
//! - `protocol`: the JSON message format between the browser and the relay.
//! - `session`: the connection lifecycle, from upgrade to close frame.
//! - `relay`: translation between wire messages and agent inputs and events.
//! - `outbound`: the bounded queue in front of the client socket.
//! - `agent`: one agent run with its tool loop.

pub mod agent;
pub mod outbound;
pub mod protocol;
pub mod relay;
pub mod session;

pub use session::ws_handler;
