//! Mutable per-torrent and per-peer bookkeeping (spec.md §3).
//!
//! Grounded on the teacher's `src/storage.rs` for the piece/block bookkeeping
//! shape (it keeps per-piece buffers and a completed-piece count) and on
//! `src/peer/connection.rs` for the choke/interest flag set. The spec's
//! "PeerState holds a back-reference to its TorrentState" is not reproduced
//! literally: Rust idiomatically avoids that self-reference by having
//! `ConnectionSupervisor` and `PieceScheduler` hold `&mut TorrentState` for the
//! duration of a call instead of each `PeerState` storing a pointer to its
//! parent (see DESIGN.md's note on Ownership).

use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use crate::bitfield::BitField;
use crate::metainfo::Metainfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Dialing,
    AwaitingHandshake,
    Active,
    Closed,
}

/// One connected (or connecting) peer and its protocol bookkeeping.
pub struct PeerState {
    pub token: Token,
    pub endpoint: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub stream: TcpStream,
    pub phase: SessionPhase,
    pub recv_buffer: Vec<u8>,
    pub send_buffer: Vec<u8>,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub peer_has: BitField,
    pub requested_piece: Option<usize>,
}

impl PeerState {
    pub fn new(token: Token, endpoint: SocketAddr, stream: TcpStream, piece_count: usize) -> PeerState {
        PeerState {
            token,
            endpoint,
            peer_id: None,
            stream,
            phase: SessionPhase::Dialing,
            recv_buffer: Vec::new(),
            send_buffer: Vec::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_has: BitField::empty(piece_count),
            requested_piece: None,
        }
    }
}

/// A known peer endpoint before (or instead of) an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownPeer {
    pub endpoint: SocketAddr,
}

/// Whole-torrent state: piece completion, in-flight block buffers, and the
/// peer roster. Exclusively owned by [`crate::supervisor::ConnectionSupervisor`].
pub struct TorrentState {
    pub metainfo: Metainfo,
    pub complete_pieces: Vec<Option<Vec<u8>>>,
    pub in_progress_blocks: Vec<Vec<(u32, Vec<u8>)>>,
    /// At most one peer per piece in this core (no endgame duplication).
    pub piece_requests: Vec<Option<Token>>,
    pub peers: Vec<KnownPeer>,
    pub is_complete: bool,
}

impl TorrentState {
    pub fn new(metainfo: Metainfo, peers: Vec<KnownPeer>) -> TorrentState {
        let piece_count = metainfo.piece_count();
        TorrentState {
            metainfo,
            complete_pieces: vec![None; piece_count],
            in_progress_blocks: vec![Vec::new(); piece_count],
            piece_requests: vec![None; piece_count],
            peers,
            is_complete: false,
        }
    }

    pub fn is_piece_complete(&self, index: usize) -> bool {
        self.complete_pieces[index].is_some()
    }

    /// Concatenation of all pieces in index order. Only meaningful once
    /// `is_complete` is true.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.metainfo.total_length() as usize);
        for piece in &self.complete_pieces {
            out.extend_from_slice(piece.as_ref().expect("assemble called before completion"));
        }
        out
    }
}
