//! Core building blocks of the bidirectional voice relay: the PCM16 audio
//! codec, transcript coalescing, agent-native events, the realtime model
//! seam, the error taxonomy and the built-in tools.

pub mod audio;
pub mod error;
pub mod event;
pub mod model;
pub mod tools;
pub mod transcript;

pub use error::RelayError;
