//! Process-wide, read-only-after-init configuration (spec.md §6).
//!
//! Threaded into the supervisor at boot as an immutable value — no ambient global
//! state, no `lazy_static` singleton like the Python original's `config.CONFIG` dict.

use std::time::Duration;

pub const DEFAULT_MAX_PEERS: usize = 8;
pub const DEFAULT_BLOCK_LENGTH: u32 = 16 * 1024;
pub const DEFAULT_PORT: u16 = 6881;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Config {
    /// 20 bytes, process-unique, conventionally prefixed with a client tag.
    pub peer_id: [u8; 20],
    /// Cap on concurrently active peer connections per torrent.
    pub max_peers: usize,
    /// Fixed block size requested per wire `request` message.
    pub block_length: u32,
    /// Port advertised to the tracker as our listen port.
    pub listen_port: u16,
    /// Permitted refinement (spec.md §5): close a session idle beyond this long.
    pub idle_timeout: Duration,
}

impl Config {
    pub fn new(peer_id: [u8; 20]) -> Config {
        Config {
            peer_id,
            max_peers: DEFAULT_MAX_PEERS,
            block_length: DEFAULT_BLOCK_LENGTH,
            listen_port: DEFAULT_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Config {
        self.max_peers = max_peers;
        self
    }

    pub fn with_listen_port(mut self, listen_port: u16) -> Config {
        self.listen_port = listen_port;
        self
    }
}

/// Client tag prefixed onto a randomly generated peer id, Azureus-style (`-BT0001-`).
pub const CLIENT_TAG: &str = "-BC0001-";

pub fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;

    let mut peer_id = [0u8; 20];
    let tag = CLIENT_TAG.as_bytes();
    peer_id[..tag.len()].copy_from_slice(tag);
    rand::thread_rng().fill(&mut peer_id[tag.len()..]);
    peer_id
}
