//! Per-peer protocol engine: handshake framing, message framing, and the
//! session-level read/write driver (spec.md §4.3).

pub mod handshake;
pub mod message;
pub mod session;
