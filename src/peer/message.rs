//! Peer-wire message framing (spec.md §4.3's "wire records" and §6's message table).
//!
//! Grounded on the teacher's `src/peer/message.rs` for the overall enum shape
//! and message IDs, fixing one bug: the teacher builds the 4-byte length
//! prefix as a `Vec` literal with the length spliced in as a single `u8`
//! (`vec![0, 0, 0, 1 + bitfield.len() as u8, 5]`), which truncates silently
//! for any bitfield or piece block longer than 255 bytes — the overwhelming
//! common case once `piece_length`/8 or a 16 KiB block is involved. Prefixes
//! are now written with `byteorder`'s `WriteBytesExt` as a full big-endian u32.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::PeerError;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out).expect("writing to a Vec never fails");
        out
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Message::KeepAlive => w.write_u32::<BigEndian>(0),
            Message::Choke => write_fixed(w, 0, &[]),
            Message::Unchoke => write_fixed(w, 1, &[]),
            Message::Interested => write_fixed(w, 2, &[]),
            Message::NotInterested => write_fixed(w, 3, &[]),
            Message::Have(index) => write_fixed(w, 4, &index.to_be_bytes()),
            Message::Bitfield(bits) => write_fixed(w, 5, bits),
            Message::Request(index, begin, length) => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                write_fixed(w, 6, &payload)
            }
            Message::Piece(index, begin, block) => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                write_fixed(w, 7, &payload)
            }
            Message::Cancel(index, begin, length) => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                write_fixed(w, 8, &payload)
            }
            Message::Port(port) => write_fixed(w, 9, &port.to_be_bytes()),
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Message, PeerError> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = data[0];
        let body = &data[1..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                let index = require_len(body, 4, "have")?;
                Message::Have(u32::from_be_bytes(index.try_into().unwrap()))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 => {
                let (index, begin, length) = require_three_u32(body, "request")?;
                Message::Request(index, begin, length)
            }
            7 => {
                if body.len() < 8 {
                    return Err(PeerError::MalformedMessage(
                        "piece message shorter than 8 bytes".into(),
                    ));
                }
                let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
                Message::Piece(index, begin, body[8..].to_vec())
            }
            8 => {
                let (index, begin, length) = require_three_u32(body, "cancel")?;
                Message::Cancel(index, begin, length)
            }
            9 => {
                let port = require_len(body, 2, "port")?;
                Message::Port(u16::from_be_bytes(port.try_into().unwrap()))
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_, _, _) => Some(6),
            Message::Piece(_, _, _) => Some(7),
            Message::Cancel(_, _, _) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}

fn write_fixed<W: Write>(w: &mut W, id: u8, payload: &[u8]) -> io::Result<()> {
    w.write_u32::<BigEndian>(1 + payload.len() as u32)?;
    w.write_u8(id)?;
    w.write_all(payload)
}

fn require_len<'a>(body: &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], PeerError> {
    if body.len() != len {
        return Err(PeerError::MalformedMessage(format!(
            "{} message should carry {} bytes, got {}",
            what,
            len,
            body.len()
        )));
    }
    Ok(body)
}

fn require_three_u32(body: &[u8], what: &'static str) -> Result<(u32, u32, u32), PeerError> {
    let body = require_len(body, 12, what)?;
    let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let length = u32::from_be_bytes(body[8..12].try_into().unwrap());
    Ok((index, begin, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let frame = Message::KeepAlive.serialize();
        assert_eq!(frame, vec![0, 0, 0, 0]);
    }

    #[test]
    fn choke_round_trips() {
        let frame = Message::Choke.serialize();
        assert_eq!(frame, vec![0, 0, 0, 1, 0]);
        let msg = Message::deserialize(&frame[4..]).unwrap();
        assert_eq!(msg, Message::Choke);
    }

    #[test]
    fn large_bitfield_length_prefix_is_not_truncated() {
        // 300-byte bitfield: the teacher's single-byte length math would wrap
        // this into a 44-byte declared length (1 + 300 truncated to u8).
        let bits = vec![0xFFu8; 300];
        let frame = Message::Bitfield(bits.clone()).serialize();
        let declared_len = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(declared_len, 301);
        let msg = Message::deserialize(&frame[4..]).unwrap();
        assert_eq!(msg, Message::Bitfield(bits));
    }

    #[test]
    fn large_piece_block_round_trips() {
        let block = vec![9u8; 16 * 1024];
        let frame = Message::Piece(3, 0, block.clone()).serialize();
        let declared_len = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(declared_len as usize, 9 + block.len());
        let msg = Message::deserialize(&frame[4..]).unwrap();
        assert_eq!(msg, Message::Piece(3, 0, block));
    }

    #[test]
    fn request_round_trips() {
        let frame = Message::Request(1, 16384, 16384).serialize();
        let msg = Message::deserialize(&frame[4..]).unwrap();
        assert_eq!(msg, Message::Request(1, 16384, 16384));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let err = Message::deserialize(&[200]).unwrap_err();
        assert!(matches!(err, PeerError::UnknownMessageId(200)));
    }
}
