//! Typed error kinds per component, matching the policy table in spec.md §7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("not a bencoded dictionary")]
    NotADictionary,
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("announce is not a well-formed URL: {0}")]
    InvalidAnnounceUrl(#[from] url::ParseError),
    #[error("pieces length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("zero-length pieces list")]
    EmptyPieces,
    #[error("info specifies neither a single-file length nor a non-empty files list")]
    AmbiguousLayout,
    #[error("unsupported encoding: {0} (only utf-8 is accepted)")]
    UnsupportedEncoding(String),
    #[error("field is not valid UTF-8: {0}")]
    InvalidUtf8(&'static str),
    #[error("rejected unsafe path component: {0}")]
    UnsafePath(String),
    #[error("malformed bencoding: {0}")]
    MalformedBencoding(String),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker reported failure: {0}")]
    AnnounceFailed(String),
    #[error("malformed announce response: {0}")]
    MalformedResponse(String),
    #[error("network error contacting tracker: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid announce URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("unrecognized protocol in handshake")]
    UnrecognizedProtocol,
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("attempted to send a message before handshake completed")]
    SendBeforeHandshake,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("piece {0} failed hash verification")]
    PieceHashMismatch(usize),
    #[error("peer has no unrequested pieces left to offer")]
    NoUnrequestedPieces,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),
    #[error("tracker announce failed: {0}")]
    Tracker(#[from] TrackerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
