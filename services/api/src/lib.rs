//! Bidirectional Voice Relay Library Crate
//!
//! Configuration, session bootstrap, the HTTP routes and the WebSocket relay
//! between browser clients and realtime speech backends. The `relay` binary
//! is a thin wrapper around this library.

pub mod bootstrap;
pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
