//! I/O utilities
//!
//! - [`relay`]: bidirectional copy that reports which side ended it
//! - [`PrefixedStream`]: replays bytes consumed during a handshake

mod copy;
mod prefixed;

pub use copy::{relay, relay_with_buffer, RelayOutcome, RelaySide, DEFAULT_BUFFER_SIZE};
pub use prefixed::PrefixedStream;
