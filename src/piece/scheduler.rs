//! Piece selection, block ingestion, and commitment (spec.md §4.4).
//!
//! Grounded on the teacher's `src/storage.rs`, whose `write_block`/`write_piece`
//! accumulate per-piece byte buffers and hash-check at completion — kept here,
//! but fixing `storage.rs`'s verification bug, which compares `hash[i] !=
//! piece[i]` per index (comparing mismatched bytes of two different 20-byte
//! digests instead of comparing the two digests to each other) and which also
//! hashes the *entire* assembled torrent on every piece completion instead of
//! the single newly completed piece against its own canonical digest.

use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::error::SchedulerError;
use crate::state::{PeerState, TorrentState};

pub struct PieceScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: usize,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// The piece was already complete; the block is dropped, no re-request issued.
    Discarded,
    /// A block with this `begin` was already buffered (duplicate delivery);
    /// idempotent — the caller should request the next block, same as `NeedMore`.
    DuplicateBlock(BlockRequest),
    /// The piece is not yet fully buffered; request the next block.
    NeedMore(BlockRequest),
    /// All blocks for this piece are in hand; ready for [`PieceScheduler::commit`].
    PieceReady { index: usize, data: Vec<u8> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Completed { index: usize, torrent_complete: bool },
    HashMismatch { index: usize },
}

impl PieceScheduler {
    /// Three-phase selection policy (spec.md §4.4): first an ascending-order
    /// unrequested piece the peer has, else a uniform-random pick among all
    /// incomplete pieces the peer has (regardless of pending requests), else
    /// `NoUnrequestedPieces`.
    pub fn select_piece(torrent: &TorrentState, peer: &PeerState) -> Result<usize, SchedulerError> {
        for i in 0..torrent.metainfo.piece_count() {
            if !torrent.is_piece_complete(i)
                && torrent.piece_requests[i].is_none()
                && peer.peer_has.has_piece(i)
            {
                return Ok(i);
            }
        }

        let candidates: Vec<usize> = (0..torrent.metainfo.piece_count())
            .filter(|&i| !torrent.is_piece_complete(i) && peer.peer_has.has_piece(i))
            .collect();
        if candidates.is_empty() {
            return Err(SchedulerError::NoUnrequestedPieces);
        }

        use rand::seq::SliceRandom;
        Ok(*candidates
            .choose(&mut rand::thread_rng())
            .expect("candidates is non-empty"))
    }

    /// Marks `index` as requested by `peer` and returns the first block request
    /// to send (begin=0, up to `config.block_length`, clamped to piece length).
    pub fn begin_piece(
        torrent: &mut TorrentState,
        peer: &mut PeerState,
        config: &Config,
        index: usize,
    ) -> BlockRequest {
        torrent.piece_requests[index] = Some(peer.token);
        peer.requested_piece = Some(index);
        next_block_request(torrent, config, index)
    }

    pub fn ingest_block(
        torrent: &mut TorrentState,
        config: &Config,
        index: usize,
        begin: u32,
        bytes: Vec<u8>,
    ) -> IngestOutcome {
        if torrent.is_piece_complete(index) {
            return IngestOutcome::Discarded;
        }

        if torrent.in_progress_blocks[index]
            .iter()
            .any(|(b, _)| *b == begin)
        {
            return IngestOutcome::DuplicateBlock(next_block_request(torrent, config, index));
        }

        torrent.in_progress_blocks[index].push((begin, bytes));

        let buffered: usize = torrent.in_progress_blocks[index]
            .iter()
            .map(|(_, b)| b.len())
            .sum();
        let expected = torrent.metainfo.expected_piece_length(index) as usize;

        if buffered >= expected {
            let mut blocks = std::mem::take(&mut torrent.in_progress_blocks[index]);
            blocks.sort_by_key(|(begin, _)| *begin);
            let mut data = Vec::with_capacity(expected);
            for (_, block) in blocks {
                data.extend_from_slice(&block);
            }
            IngestOutcome::PieceReady { index, data }
        } else {
            IngestOutcome::NeedMore(next_block_request(torrent, config, index))
        }
    }

    /// Verifies a fully buffered piece against its canonical digest and either
    /// stores it (clearing the block buffer and outstanding request) or fails
    /// it back to incomplete without attributing blame to any one peer.
    pub fn commit(torrent: &mut TorrentState, index: usize, data: Vec<u8>) -> CommitOutcome {
        let expected: [u8; 20] = torrent.metainfo.pieces[index];
        let actual: [u8; 20] = Sha1::digest(&data).into();

        if actual != expected {
            torrent.in_progress_blocks[index].clear();
            torrent.piece_requests[index] = None;
            return CommitOutcome::HashMismatch { index };
        }

        torrent.complete_pieces[index] = Some(data);
        torrent.in_progress_blocks[index].clear();
        torrent.piece_requests[index] = None;

        let torrent_complete = torrent.complete_pieces.iter().all(Option::is_some);
        torrent.is_complete = torrent_complete;

        CommitOutcome::Completed {
            index,
            torrent_complete,
        }
    }
}

fn next_block_request(torrent: &TorrentState, config: &Config, index: usize) -> BlockRequest {
    let buffered: u32 = torrent.in_progress_blocks[index]
        .iter()
        .map(|(_, b)| b.len() as u32)
        .sum();
    let piece_length = torrent.metainfo.expected_piece_length(index) as u32;
    let remaining = piece_length.saturating_sub(buffered);
    let length = remaining.min(config.block_length);
    BlockRequest {
        index,
        begin: buffered,
        length,
    }
}
