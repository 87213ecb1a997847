//! HTTP tracker announce (spec.md §4.2). UDP tracker support (BEP 15) and the
//! `/scrape` convention are out of scope per spec.md §1.

pub mod http;

pub use http::{AnnouncedPeer, PeerList, TrackerClient};
