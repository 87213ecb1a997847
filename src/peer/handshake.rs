//! The fixed 68-byte peer-wire handshake (spec.md §4.3).
//!
//! Grounded on the teacher's `src/peer/handshake.rs` for layout and field
//! order. Drops the teacher's `as_bytes_mut` (`unsafe` pointer-cast over
//! `Self`, unsound because `Handshake` is not `repr(C)`/`repr(packed)` despite
//! its doc comment claiming so, and unused by anything): handshakes are only
//! ever produced via `to_bytes`/`from_bytes`, so no caller needs a mutable raw
//! view.

use crate::error::PeerError;

pub const PSTR: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub pstr: String,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PSTR.to_string(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, PeerError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::MalformedMessage(format!(
                "handshake should be {} bytes, got {}",
                HANDSHAKE_LEN,
                bytes.len()
            )));
        }
        let pstrlen = bytes[0] as usize;
        if pstrlen != PSTR.len() {
            return Err(PeerError::UnrecognizedProtocol);
        }
        let pstr = std::str::from_utf8(&bytes[1..1 + pstrlen])
            .map_err(|_| PeerError::UnrecognizedProtocol)?;
        if pstr != PSTR {
            return Err(PeerError::UnrecognizedProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            pstr: pstr.to_string(),
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PSTR.len() as u8;
        bytes[1..20].copy_from_slice(PSTR.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = handshake.to_bytes();
        let parsed = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(handshake, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Handshake::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }

    #[test]
    fn rejects_unrecognized_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        bytes[1] = b'X';
        let err = Handshake::from_bytes(&bytes).unwrap_err();
        assert_eq!(err, PeerError::UnrecognizedProtocol);
    }
}
