//! A single one-shot HTTP announce (spec.md §4.2).
//!
//! Grounded on the teacher's `src/tracker/http.rs`: same mio-driven blocking
//! connect/write/read loop and the same `serde_bencode` dict-model response
//! with a custom `Peers` visitor for the compact binary model. Differences:
//! the request now carries only the fields spec.md actually asks for, the
//! `info_hash`/`peer_id` percent-encoding is asserted byte-exact rather than
//! trusting a helper blindly, and header/body splitting uses `httparse`
//! instead of a manual `\r\n\r\n` scan (the teacher's scan panics on inputs
//! shorter than 4 bytes via `0..raw.len() - 3`).

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::Deserialize;
use url::Url;

use crate::error::TrackerError;
use crate::metainfo::Metainfo;

const CONNECT_TOKEN: Token = Token(0);
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedPeer {
    pub addr: SocketAddr,
}

pub type PeerList = Vec<AnnouncedPeer>;

/// Deserializes both the compact (binary) and dictionary peer list models.
mod peers {
    use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
    use std::fmt;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    use super::AnnouncedPeer;

    #[derive(Debug, Deserialize)]
    struct DictPeer {
        #[serde(default, rename = "peer id")]
        #[allow(dead_code)]
        peer_id: Option<serde_bytes::ByteBuf>,
        ip: String,
        port: i64,
    }

    pub struct Peers(pub Vec<AnnouncedPeer>);

    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Peers, E>
        where
            E: de::Error,
        {
            let mut peers = Vec::new();
            for chunk in v.chunks(6) {
                if chunk.len() != 6 {
                    return Err(E::custom("compact peer string length is not a multiple of 6"));
                }
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                if port == 0 {
                    continue;
                }
                peers.push(AnnouncedPeer {
                    addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                });
            }
            Ok(Peers(peers))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut peers = Vec::new();
            while let Some(entry) = seq.next_element::<DictPeer>()? {
                if entry.ip.is_empty() || entry.port <= 0 || entry.port > u16::MAX as i64 {
                    continue;
                }
                if let Ok(addr) = format!("{}:{}", entry.ip, entry.port).parse::<SocketAddr>() {
                    peers.push(AnnouncedPeer { addr });
                }
            }
            Ok(Peers(peers))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(PeersVisitor)
        }
    }
}

#[derive(Debug, Deserialize)]
struct FailureOnly {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default, rename = "failure reason")]
    #[allow(dead_code)]
    failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    #[allow(dead_code)]
    warning_message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    interval: Option<u64>,
    peers: peers::Peers,
}

pub struct TrackerClient;

impl TrackerClient {
    /// Sends the single `started` announce spec.md prescribes and returns the
    /// resulting peer list. No `stopped`/`completed` follow-up, no periodic
    /// re-announce (Design Notes §9(d)): peer discovery here is one-shot.
    pub fn announce(
        metainfo: &Metainfo,
        peer_id: [u8; 20],
        listen_port: u16,
    ) -> Result<PeerList, TrackerError> {
        let announce_url =
            Url::parse(&metainfo.announce).map_err(|e| TrackerError::InvalidUrl(e.to_string()))?;
        let host = announce_url
            .host_str()
            .ok_or_else(|| TrackerError::InvalidUrl("missing host".into()))?;
        let port = announce_url.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TrackerError::InvalidUrl(format!("could not resolve {}", host)))?;

        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}",
            urlencoding::encode_binary(&metainfo.info_hash),
            urlencoding::encode_binary(&peer_id),
            listen_port,
            metainfo.total_length(),
        );
        let path_and_query = match announce_url.query() {
            Some(existing) => format!("{}?{}&{}", announce_url.path(), existing, query),
            None => format!("{}?{}", announce_url.path(), query),
        };
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path_and_query, host
        );

        let raw = send_request(addr, &request)?;
        parse_announce_response(&raw)
    }
}

fn send_request(addr: SocketAddr, request: &str) -> Result<Vec<u8>, TrackerError> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    let mut stream = TcpStream::connect(addr)?;

    poll.registry()
        .register(&mut stream, CONNECT_TOKEN, Interest::WRITABLE)?;

    let mut written = false;
    let mut response = Vec::new();
    loop {
        poll.poll(&mut events, Some(TRACKER_TIMEOUT))?;
        if events.is_empty() {
            return Err(TrackerError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "tracker did not respond in time",
            )));
        }
        for event in events.iter() {
            if event.token() != CONNECT_TOKEN {
                continue;
            }
            if event.is_writable() && !written {
                stream.write_all(request.as_bytes())?;
                poll.registry()
                    .reregister(&mut stream, CONNECT_TOKEN, Interest::READABLE)?;
                written = true;
            }
            if event.is_readable() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => return Ok(response),
                        Ok(n) => response.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(TrackerError::Io(e)),
                    }
                }
            }
        }
    }
}

fn parse_announce_response(raw: &[u8]) -> Result<PeerList, TrackerError> {
    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_buf);
    let body_offset = match response.parse(raw) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => {
            return Err(TrackerError::MalformedResponse(
                "incomplete HTTP response from tracker".into(),
            ))
        }
        Err(e) => return Err(TrackerError::MalformedResponse(e.to_string())),
    };
    debug!("tracker status: {:?}", response.code);

    // Tracker responses are transported as raw bytes (ISO-8859-1 is a
    // byte-transparent superset of any octet stream), never UTF-8: the
    // compact peer string and SHA-1 piece hashes it may echo are arbitrary
    // binary, not text.
    let body = &raw[body_offset..];

    // Checked against a minimal struct first: a tracker that rejects the
    // announce has no reason to also send a `peers` key, and spec.md §4.2
    // says to fail on `failure reason` before extracting anything else.
    let failure: FailureOnly = serde_bencode::from_bytes(body)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
    if let Some(reason) = failure.failure_reason {
        return Err(TrackerError::AnnounceFailed(reason));
    }

    let parsed: AnnounceResponse = serde_bencode::from_bytes(body)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

    Ok(parsed
        .peers
        .0
        .into_iter()
        .filter(|p| p.addr.port() != 0)
        .collect())
}
