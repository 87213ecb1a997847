//! Drives one [`PeerState`] through handshake and message framing (spec.md §4.3).
//!
//! Grounded on the teacher's `src/peer/connection.rs` for the overall
//! connect-handshake-read/write shape, but reworked from its private,
//! blocking-per-connection `mio::Poll` into plain functions that operate on a
//! socket already registered with the shared `Poll` the supervisor owns — the
//! architectural change spec.md §5 requires (many peers multiplexed on one
//! event loop, not one loop per peer).

use std::io::{self, ErrorKind, Read, Write};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::bitfield::BitField;
use crate::error::PeerError;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use crate::state::{PeerState, SessionPhase};

#[derive(Debug)]
pub enum SessionEvent {
    HandshakeCompleted { peer_id: [u8; 20] },
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield,
    PieceBlock { index: u32, begin: u32, data: Vec<u8> },
}

#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Protocol(PeerError),
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> SessionError {
        SessionError::Io(e)
    }
}

impl From<PeerError> for SessionError {
    fn from(e: PeerError) -> SessionError {
        SessionError::Protocol(e)
    }
}

/// Opens a non-blocking outbound connection and queues the outbound handshake
/// (spec.md §4.3: "sent immediately upon TCP connect").
pub fn dial(
    token: Token,
    addr: std::net::SocketAddr,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
    piece_count: usize,
) -> io::Result<PeerState> {
    let stream = TcpStream::connect(addr)?;
    let mut peer = PeerState::new(token, addr, stream, piece_count);
    peer.phase = SessionPhase::Dialing;
    queue_handshake(&mut peer, info_hash, my_peer_id);
    Ok(peer)
}

pub fn register(peer: &mut PeerState, registry: &Registry) -> io::Result<()> {
    registry.register(
        &mut peer.stream,
        peer.token,
        Interest::READABLE | Interest::WRITABLE,
    )
}

pub fn deregister(peer: &mut PeerState, registry: &Registry) -> io::Result<()> {
    registry.deregister(&mut peer.stream)
}

fn queue_handshake(peer: &mut PeerState, info_hash: [u8; 20], my_peer_id: [u8; 20]) {
    let handshake = Handshake::new(info_hash, my_peer_id);
    peer.send_buffer.extend_from_slice(&handshake.to_bytes());
    peer.phase = SessionPhase::AwaitingHandshake;
}

/// Queues a wire message for the next writable event. A `request` sent while
/// the peer is choking us is silently dropped (spec.md §4.3).
pub fn queue_message(peer: &mut PeerState, message: &Message) {
    if matches!(message, Message::Request(..)) && peer.peer_choking {
        return;
    }
    peer.send_buffer.extend_from_slice(&message.serialize());
}

/// Flushes as much of `send_buffer` as the socket currently accepts.
pub fn on_writable(peer: &mut PeerState) -> io::Result<()> {
    while !peer.send_buffer.is_empty() {
        match peer.stream.write(&peer.send_buffer) {
            Ok(0) => break,
            Ok(n) => {
                peer.send_buffer.drain(0..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads whatever is available and parses as many complete frames (handshake
/// and/or wire messages) as the buffer now holds, in arrival order.
pub fn on_readable(peer: &mut PeerState, piece_count: usize) -> Result<Vec<SessionEvent>, SessionError> {
    let mut scratch = [0u8; 4096];
    let mut saw_eof = false;
    loop {
        match peer.stream.read(&mut scratch) {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(n) => peer.recv_buffer.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SessionError::Io(e)),
        }
    }

    let mut events = Vec::new();

    if matches!(peer.phase, SessionPhase::Dialing | SessionPhase::AwaitingHandshake) {
        if peer.recv_buffer.len() < HANDSHAKE_LEN {
            return Ok(events);
        }
        let handshake = Handshake::from_bytes(&peer.recv_buffer[..HANDSHAKE_LEN])?;
        peer.recv_buffer.drain(0..HANDSHAKE_LEN);
        peer.peer_id = Some(handshake.peer_id);
        peer.phase = SessionPhase::Active;
        events.push(SessionEvent::HandshakeCompleted {
            peer_id: handshake.peer_id,
        });
    }

    loop {
        if peer.recv_buffer.len() < 4 {
            break;
        }
        let length = u32::from_be_bytes(peer.recv_buffer[0..4].try_into().unwrap()) as usize;
        if peer.recv_buffer.len() < 4 + length {
            break;
        }
        let frame = peer.recv_buffer[4..4 + length].to_vec();
        peer.recv_buffer.drain(0..4 + length);

        let message = Message::deserialize(&frame)?;
        if let Some(event) = apply_message(peer, message, piece_count)? {
            events.push(event);
        }
    }

    // A peer that closes its socket right after writing its last message
    // still left those bytes in `recv_buffer` above; parse them before
    // noticing the close. Only a truncated trailing handshake/frame at EOF
    // is a real error — a clean close with nothing left to parse just means
    // this peer has nothing more to say, which the idle-timeout reaper
    // handles like any other peer that goes silent.
    if saw_eof && !peer.recv_buffer.is_empty() {
        return Err(SessionError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed the connection mid-message",
        )));
    }

    Ok(events)
}

fn apply_message(
    peer: &mut PeerState,
    message: Message,
    piece_count: usize,
) -> Result<Option<SessionEvent>, PeerError> {
    let event = match message {
        Message::KeepAlive => None,
        Message::Choke => {
            peer.peer_choking = true;
            Some(SessionEvent::Choked)
        }
        Message::Unchoke => {
            peer.peer_choking = false;
            Some(SessionEvent::Unchoked)
        }
        Message::Interested => {
            peer.peer_interested = true;
            Some(SessionEvent::Interested)
        }
        Message::NotInterested => {
            peer.peer_interested = false;
            Some(SessionEvent::NotInterested)
        }
        Message::Have(index) => {
            peer.peer_has.set(index as usize);
            Some(SessionEvent::Have(index))
        }
        Message::Bitfield(bits) => {
            peer.peer_has = BitField::from_payload(&bits, piece_count)
                .map_err(|e| PeerError::MalformedMessage(e.to_string()))?;
            Some(SessionEvent::Bitfield)
        }
        // download-only core: we never serve data, so inbound requests/cancels/
        // port messages have no effect (spec.md §4.3's "ignored" column).
        Message::Request(..) | Message::Cancel(..) | Message::Port(_) => None,
        Message::Piece(index, begin, data) => Some(SessionEvent::PieceBlock { index, begin, data }),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn loopback_pair(token: Token, piece_count: usize) -> (PeerState, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (
            PeerState::new(token, addr, mio::net::TcpStream::from_std(client), piece_count),
            server,
        )
    }

    #[test]
    fn queued_handshake_is_flushed_on_writable() {
        let (mut peer, mut server) = loopback_pair(Token(1), 1);
        queue_handshake(&mut peer, [1u8; 20], [2u8; 20]);
        on_writable(&mut peer).unwrap();

        let mut buf = [0u8; HANDSHAKE_LEN];
        std::thread::sleep(std::time::Duration::from_millis(20));
        server.read_exact(&mut buf).unwrap();
        let handshake = Handshake::from_bytes(&buf).unwrap();
        assert_eq!(handshake.info_hash, [1u8; 20]);
    }

    #[test]
    fn request_suppressed_while_peer_choking() {
        let (mut peer, _server) = loopback_pair(Token(1), 1);
        assert!(peer.peer_choking);
        queue_message(&mut peer, &Message::Request(0, 0, 16384));
        assert!(peer.send_buffer.is_empty());
    }

    #[test]
    fn inbound_handshake_then_message_in_one_read() {
        let (mut peer, mut server) = loopback_pair(Token(1), 2);
        let mut payload = Handshake::new([9u8; 20], [8u8; 20]).to_bytes().to_vec();
        payload.extend_from_slice(&Message::Unchoke.serialize());
        server.write_all(&payload).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let events = on_readable(&mut peer, 2).unwrap();
        assert!(matches!(events[0], SessionEvent::HandshakeCompleted { .. }));
        assert!(matches!(events[1], SessionEvent::Unchoked));
        assert!(!peer.peer_choking);
    }
}
