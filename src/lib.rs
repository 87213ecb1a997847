//! Core of a single-peer, download-only BitTorrent client (spec.md §1-§2).
//!
//! The five components are layered leaves-first: [`bencode`] and [`bitfield`]
//! are pure data; [`metainfo`] and [`tracker`] are the one-shot leaf
//! collaborators; [`peer`] and [`piece`] are the protocol engine and
//! scheduling policy; [`supervisor`] hosts the event loop that ties all of
//! them together. [`config`] and [`error`] are the ambient stack threaded
//! through every layer.

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod state;
pub mod supervisor;
pub mod tracker;
