//! Piece/block scheduling, hash verification, and final assembly (spec.md §4.4).

pub mod scheduler;

pub use scheduler::{CommitOutcome, IngestOutcome, PieceScheduler};
