//! Event-loop hosted network I/O, peer-slot cap enforcement, and peer
//! replacement on failure/exhaustion (spec.md §4.5).
//!
//! Grounded on the teacher's `src/peer/manager.rs` stub for the intended role,
//! but the teacher never filled it in — the actual loop shape (one shared
//! `Poll`, one `Token` per peer, driven to completion) is new, following the
//! single-threaded cooperative model spec.md §5 mandates and generalizing
//! away from `src/peer/connection.rs`'s per-connection private `Poll`, which
//! can only ever drive one peer at a time. `run_download`'s driving logic
//! (handshake → send `interested` while choked → request a piece once
//! unchoked) is grounded directly on `original_source/peer.py`'s
//! `run_download`/`handle_unchoke`/`handle_handshake_ok`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::{Events, Poll, Token};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::metainfo::Metainfo;
use crate::peer::message::Message;
use crate::peer::session::{self, SessionError, SessionEvent};
use crate::piece::{CommitOutcome, IngestOutcome, PieceScheduler};
use crate::state::{KnownPeer, PeerState, SessionPhase, TorrentState};
use crate::tracker::TrackerClient;

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerSlot {
    NotAttempted,
    Active(Token),
    Failed,
}

/// The assembled byte image of a completed torrent, handed to the CLI
/// collaborator for writing to disk (spec.md §1's "thin wrapper" boundary).
pub struct Completion {
    pub metainfo: Metainfo,
    pub data: Vec<u8>,
}

pub struct ConnectionSupervisor {
    poll: Poll,
    events: Events,
    config: Config,
    torrent: TorrentState,
    sessions: HashMap<Token, PeerState>,
    peer_slots: Vec<PeerSlot>,
    next_token: usize,
    last_activity: HashMap<Token, Instant>,
    stopped: bool,
}

impl ConnectionSupervisor {
    /// Announces to the tracker, opens sessions for the first `max_peers`
    /// discovered peers, and returns a supervisor ready to `run`.
    pub fn start_torrent(metainfo: Metainfo, config: Config) -> Result<ConnectionSupervisor, SupervisorError> {
        let peers = TrackerClient::announce(&metainfo, config.peer_id, config.listen_port)?;
        let known_peers: Vec<KnownPeer> = peers
            .into_iter()
            .map(|p| KnownPeer { endpoint: p.addr })
            .collect();
        info!("tracker returned {} peers", known_peers.len());

        let peer_slots = vec![PeerSlot::NotAttempted; known_peers.len()];
        let torrent = TorrentState::new(metainfo, known_peers);
        let poll = Poll::new()?;

        let mut supervisor = ConnectionSupervisor {
            poll,
            events: Events::with_capacity(1024),
            config,
            torrent,
            sessions: HashMap::new(),
            peer_slots,
            next_token: 0,
            last_activity: HashMap::new(),
            stopped: false,
        };
        supervisor.open_initial_sessions();
        Ok(supervisor)
    }

    /// Test-only entry point that skips the tracker round-trip and opens
    /// sessions directly against the given endpoints (spec.md §8's end-to-end
    /// scenarios are expressed against loopback peers, not a live tracker).
    #[cfg(test)]
    fn start_with_peers(
        metainfo: Metainfo,
        config: Config,
        endpoints: Vec<std::net::SocketAddr>,
    ) -> Result<ConnectionSupervisor, SupervisorError> {
        let known_peers: Vec<KnownPeer> = endpoints.into_iter().map(|endpoint| KnownPeer { endpoint }).collect();
        let peer_slots = vec![PeerSlot::NotAttempted; known_peers.len()];
        let torrent = TorrentState::new(metainfo, known_peers);
        let poll = Poll::new()?;

        let mut supervisor = ConnectionSupervisor {
            poll,
            events: Events::with_capacity(1024),
            config,
            torrent,
            sessions: HashMap::new(),
            peer_slots,
            next_token: 0,
            last_activity: HashMap::new(),
            stopped: false,
        };
        supervisor.open_initial_sessions();
        Ok(supervisor)
    }

    fn open_initial_sessions(&mut self) {
        let count = self.torrent.peers.len().min(self.config.max_peers);
        for index in 0..count {
            self.open_session(index);
        }
    }

    fn open_session(&mut self, peer_index: usize) {
        let endpoint = self.torrent.peers[peer_index].endpoint;
        let token = Token(self.next_token);
        self.next_token += 1;

        match session::dial(
            token,
            endpoint,
            self.torrent.metainfo.info_hash,
            self.config.peer_id,
            self.torrent.metainfo.piece_count(),
        ) {
            Ok(mut peer) => {
                if let Err(e) = session::register(&mut peer, self.poll.registry()) {
                    warn!("failed to register peer {}: {}", endpoint, e);
                    self.peer_slots[peer_index] = PeerSlot::Failed;
                    return;
                }
                self.last_activity.insert(token, Instant::now());
                self.sessions.insert(token, peer);
                self.peer_slots[peer_index] = PeerSlot::Active(token);
            }
            Err(e) => {
                debug!("failed to dial {}: {}", endpoint, e);
                self.peer_slots[peer_index] = PeerSlot::Failed;
            }
        }
    }

    fn active_peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// At most one replacement per stop event (spec.md §4.5).
    fn promote_replacement(&mut self) {
        if self.torrent.is_complete {
            return;
        }
        if self.active_peer_count() >= self.config.max_peers {
            return;
        }
        if let Some(index) = self
            .peer_slots
            .iter()
            .position(|slot| matches!(slot, PeerSlot::NotAttempted))
        {
            self.open_session(index);
        }
    }

    fn slot_index_for(&self, token: Token) -> Option<usize> {
        self.peer_slots
            .iter()
            .position(|slot| matches!(slot, PeerSlot::Active(t) if *t == token))
    }

    fn close_peer(&mut self, token: Token, reason: &str) {
        if let Some(mut peer) = self.sessions.remove(&token) {
            let _ = session::deregister(&mut peer, self.poll.registry());
            peer.phase = SessionPhase::Closed;
        }
        self.last_activity.remove(&token);
        if let Some(index) = self.slot_index_for(token) {
            self.peer_slots[index] = PeerSlot::Failed;
        }
        warn!("peer {:?} stopped: {}", token, reason);
        self.promote_replacement();
    }

    /// Runs the event loop until `stop()` is called or the torrent completes.
    /// Returns the assembled image on completion, or `None` if `stop()` cut
    /// the loop short before every piece verified.
    pub fn run(&mut self) -> Result<Option<Completion>, SupervisorError> {
        while !self.stopped && !self.torrent.is_complete {
            self.poll.poll(&mut self.events, Some(POLL_TIMEOUT))?;
            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                self.handle_event(token);
                if self.torrent.is_complete {
                    break;
                }
            }
            self.reap_idle_sessions();
        }

        for (token, mut peer) in self.sessions.drain() {
            let _ = session::deregister(&mut peer, self.poll.registry());
            peer.phase = SessionPhase::Closed;
            let _ = token;
        }

        if !self.torrent.is_complete {
            return Ok(None);
        }

        Ok(Some(Completion {
            data: self.torrent.assemble(),
            metainfo: self.torrent.metainfo.clone(),
        }))
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn handle_event(&mut self, token: Token) {
        self.last_activity.insert(token, Instant::now());

        let write_result = self.sessions.get_mut(&token).map(|p| session::on_writable(p));
        if let Some(Err(e)) = write_result {
            self.close_peer(token, &format!("write failed: {}", e));
            return;
        }

        let readable = self
            .sessions
            .get_mut(&token)
            .map(|peer| session::on_readable(peer, self.torrent.metainfo.piece_count()));

        match readable {
            Some(Ok(events)) => {
                for event in events {
                    self.handle_session_event(token, event);
                    if self.torrent.is_complete {
                        return;
                    }
                }
                // Reacting to an incoming message (e.g. queuing `interested` on
                // handshake, or the next block `request` on a piece event) may
                // have queued new outbound bytes. `mio`'s poller is edge-triggered,
                // so nothing will tell us this socket is writable again until its
                // kernel send buffer toggles state — flush here instead of waiting
                // for that edge, since the write itself needs no readiness event.
                if let Some(Err(e)) = self.sessions.get_mut(&token).map(|p| session::on_writable(p)) {
                    self.close_peer(token, &format!("write failed: {}", e));
                }
            }
            Some(Err(SessionError::Io(e))) => {
                self.close_peer(token, &format!("transport failure: {}", e));
            }
            Some(Err(SessionError::Protocol(e))) => {
                self.close_peer(token, &format!("protocol error: {}", e));
            }
            None => {}
        }
    }

    fn handle_session_event(&mut self, token: Token, event: SessionEvent) {
        match event {
            SessionEvent::HandshakeCompleted { peer_id } => {
                debug!("peer {:?} handshake ok (peer_id {:?})", token, peer_id);
                self.drive_peer(token);
            }
            SessionEvent::Unchoked => self.drive_peer(token),
            SessionEvent::Choked | SessionEvent::Interested | SessionEvent::NotInterested => {}
            SessionEvent::Have(_) | SessionEvent::Bitfield => self.drive_peer(token),
            SessionEvent::PieceBlock { index, begin, data } => {
                self.handle_piece_block(token, index as usize, begin, data);
            }
        }
    }

    /// Mirrors `original_source/peer.py`'s `run_download`: handshake already
    /// happened by the time this is called; if the peer is choking us, ask to
    /// be unchoked; if we're already filling a piece, wait; otherwise pick one.
    fn drive_peer(&mut self, token: Token) {
        if self.torrent.is_complete {
            return;
        }
        let (choking, working) = match self.sessions.get(&token) {
            Some(peer) => (peer.peer_choking, peer.requested_piece.is_some()),
            None => return,
        };

        if choking {
            let peer = self.sessions.get_mut(&token).unwrap();
            if !peer.am_interested {
                peer.am_interested = true;
                session::queue_message(peer, &Message::Interested);
            }
            return;
        }

        if working {
            return;
        }

        let selection = {
            let peer = self.sessions.get(&token).unwrap();
            PieceScheduler::select_piece(&self.torrent, peer)
        };

        match selection {
            Ok(index) => {
                let peer = self.sessions.get_mut(&token).unwrap();
                let request = PieceScheduler::begin_piece(&mut self.torrent, peer, &self.config, index);
                session::queue_message(
                    peer,
                    &Message::Request(request.index as u32, request.begin, request.length),
                );
            }
            Err(e) => self.close_peer(token, &e.to_string()),
        }
    }

    fn handle_piece_block(&mut self, token: Token, index: usize, begin: u32, data: Vec<u8>) {
        let outcome = PieceScheduler::ingest_block(&mut self.torrent, &self.config, index, begin, data);
        match outcome {
            IngestOutcome::Discarded => {}
            IngestOutcome::DuplicateBlock(req) | IngestOutcome::NeedMore(req) => {
                if let Some(peer) = self.sessions.get_mut(&token) {
                    session::queue_message(
                        peer,
                        &Message::Request(req.index as u32, req.begin, req.length),
                    );
                }
            }
            IngestOutcome::PieceReady { index, data } => {
                self.commit_piece(token, index, data);
            }
        }
    }

    fn commit_piece(&mut self, completing_token: Token, index: usize, data: Vec<u8>) {
        match PieceScheduler::commit(&mut self.torrent, index, data) {
            CommitOutcome::Completed { index, torrent_complete } => {
                if let Some(peer) = self.sessions.get_mut(&completing_token) {
                    peer.requested_piece = None;
                }
                // Clear any other peer's stale claim on this index (spec.md §4.4).
                for peer in self.sessions.values_mut() {
                    if peer.requested_piece == Some(index) {
                        peer.requested_piece = None;
                    }
                }
                info!("piece {} complete", index);

                if torrent_complete {
                    self.complete_torrent();
                } else {
                    self.drive_peer(completing_token);
                }
            }
            CommitOutcome::HashMismatch { index } => {
                warn!("piece {} failed hash verification, reopening", index);
                for peer in self.sessions.values_mut() {
                    if peer.requested_piece == Some(index) {
                        peer.requested_piece = None;
                    }
                }
            }
        }
    }

    fn complete_torrent(&mut self) {
        info!("torrent complete, closing all sessions");
        for (_, mut peer) in self.sessions.drain() {
            let _ = session::deregister(&mut peer, self.poll.registry());
            peer.phase = SessionPhase::Closed;
        }
    }

    fn reap_idle_sessions(&mut self) {
        let timeout = self.config.idle_timeout;
        let now = Instant::now();
        let stale: Vec<Token> = self
            .last_activity
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(token, _)| *token)
            .collect();
        for token in stale {
            self.close_peer(token, "idle watchdog timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Layout;
    use crate::peer::handshake::Handshake;
    use sha1::{Digest, Sha1};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn fixture_metainfo(piece_length: u64, total_length: u64, pieces: Vec<[u8; 20]>) -> Metainfo {
        Metainfo {
            announce: "http://tracker.example/announce".into(),
            info_hash: [3u8; 20],
            name: "fixture.bin".into(),
            piece_length,
            pieces,
            layout: Layout::SingleFile { length: total_length },
            comment: None,
            created_by: None,
            creation_date: None,
            private: false,
        }
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            stream.read_exact(&mut payload).unwrap();
        }
        payload
    }

    /// Scenario 1 (spec.md §8): 1-byte file, `piece_length=1`, one peer
    /// advertising the piece via `bitfield=0x80`. Expect request(0,0,1),
    /// a `piece` response, commitment, and a completion image of that byte.
    #[test]
    fn single_file_single_peer_single_piece_completes() {
        let data = b"A".to_vec();
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let metainfo = fixture_metainfo(1, 1, vec![hash]);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut handshake_bytes = [0u8; 68];
            stream.read_exact(&mut handshake_bytes).unwrap();
            Handshake::from_bytes(&handshake_bytes).unwrap();
            stream.write_all(&Handshake::new([3u8; 20], [9u8; 20]).to_bytes()).unwrap();
            stream
                .write_all(&crate::peer::message::Message::Bitfield(vec![0x80]).serialize())
                .unwrap();

            let interested = read_frame(&mut stream);
            assert_eq!(interested, vec![2]);
            stream.write_all(&crate::peer::message::Message::Unchoke.serialize()).unwrap();

            let request = read_frame(&mut stream);
            assert_eq!(request[0], 6);
            stream
                .write_all(&crate::peer::message::Message::Piece(0, 0, data.clone()).serialize())
                .unwrap();
        });

        let config = Config::new([1u8; 20]).with_max_peers(1);
        let mut supervisor = ConnectionSupervisor::start_with_peers(metainfo, config, vec![addr]).unwrap();
        let completion = supervisor.run().unwrap().expect("torrent should complete");
        assert_eq!(completion.data, b"A");
        server.join().unwrap();
    }

    /// Scenario 5 (spec.md §8): `max_peers=2`; peer 1 announces an empty
    /// bitfield so `NoUnrequestedPieces` fires on its first scheduling pass;
    /// the supervisor promotes peer 3 from the waiting list.
    #[test]
    fn exhausted_peer_is_replaced_by_next_waiting_peer() {
        let data = b"A".to_vec();
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let metainfo = fixture_metainfo(1, 1, vec![hash]);

        let empty_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let empty_addr = empty_listener.local_addr().unwrap();
        let unreachable_addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let working_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let working_addr = working_listener.local_addr().unwrap();

        let empty_server = std::thread::spawn(move || {
            let (mut stream, _) = empty_listener.accept().unwrap();
            let mut handshake_bytes = [0u8; 68];
            stream.read_exact(&mut handshake_bytes).unwrap();
            stream.write_all(&Handshake::new([3u8; 20], [9u8; 20]).to_bytes()).unwrap();
            stream
                .write_all(&crate::peer::message::Message::Bitfield(vec![0x00]).serialize())
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(200));
        });

        let working_server = std::thread::spawn(move || {
            let (mut stream, _) = working_listener.accept().unwrap();
            let mut handshake_bytes = [0u8; 68];
            stream.read_exact(&mut handshake_bytes).unwrap();
            stream.write_all(&Handshake::new([3u8; 20], [9u8; 20]).to_bytes()).unwrap();
            stream
                .write_all(&crate::peer::message::Message::Bitfield(vec![0x80]).serialize())
                .unwrap();

            let interested = read_frame(&mut stream);
            assert_eq!(interested, vec![2]);
            stream.write_all(&crate::peer::message::Message::Unchoke.serialize()).unwrap();

            let request = read_frame(&mut stream);
            assert_eq!(request[0], 6);
            stream
                .write_all(&crate::peer::message::Message::Piece(0, 0, data.clone()).serialize())
                .unwrap();
        });

        let config = Config::new([1u8; 20]).with_max_peers(2);
        let mut supervisor = ConnectionSupervisor::start_with_peers(
            metainfo,
            config,
            vec![empty_addr, unreachable_addr, working_addr],
        )
        .unwrap();
        let completion = supervisor.run().unwrap().expect("torrent should complete via promoted peer");
        assert_eq!(completion.data, b"A");
        empty_server.join().unwrap();
        working_server.join().unwrap();
    }
}
