//! CLI collaborator (spec.md §1's "thin wrapper", §6's CLI contract).
//!
//! Everything here sits outside THE CORE: argument parsing, log sink
//! configuration, and output-file writing. Mirrors
//! `original_source/CLI_entry_point.py` (`--torrent2` for a second
//! concurrent torrent, `--outdir`, `--verbose`) translated into `clap`
//! derive, with the core's `anyhow::Result`-wrapped errors surfaced at this
//! one outer edge.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use bt_core::config::{self, Config};
use bt_core::metainfo::{Layout, Metainfo};
use bt_core::supervisor::{Completion, ConnectionSupervisor};

/// Single-peer, download-only BitTorrent client core.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// .torrent metainfo file
    torrent: String,

    /// other .torrent metainfo file, downloaded after the first completes
    #[arg(short = 't', long = "torrent2")]
    torrent2: Option<String>,

    /// directory to write completed downloads into (defaults to the current directory)
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// raise logging verbosity to debug
    #[arg(short, long)]
    verbose: bool,

    /// port advertised to the tracker as our listen port
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// cap on concurrently active peer connections
    #[arg(long, default_value_t = config::DEFAULT_MAX_PEERS)]
    max_peers: usize,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let peer_id = config::generate_peer_id();

    download_one(&args.torrent, &args, peer_id)?;
    if let Some(second) = &args.torrent2 {
        download_one(second, &args, peer_id)?;
    }

    Ok(())
}

fn download_one(path: &str, args: &Cli, peer_id: [u8; 20]) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading torrent file {}", path))?;
    let metainfo = Metainfo::parse(&bytes).with_context(|| format!("parsing torrent file {}", path))?;
    info!("{}: {} pieces, {} bytes total", metainfo.name, metainfo.piece_count(), metainfo.total_length());

    let config = Config::new(peer_id)
        .with_max_peers(args.max_peers)
        .with_listen_port(args.port);

    let mut supervisor = ConnectionSupervisor::start_torrent(metainfo, config)
        .with_context(|| format!("starting torrent {}", path))?;

    match supervisor.run().with_context(|| format!("running torrent {}", path))? {
        Some(completion) => {
            info!("torrent complete: {}", completion.metainfo.name);
            write_output(&completion, args.outdir.as_deref())?;
        }
        None => info!("torrent {} stopped before completion", path),
    }

    Ok(())
}

/// Writes the assembled image to disk per spec.md §6: a single-file torrent
/// writes `<name>` at the output directory root; a multi-file torrent creates
/// `<name>/` and writes each entry at its declared relative path, creating
/// intermediate directories as needed.
fn write_output(completion: &Completion, outdir: Option<&Path>) -> Result<()> {
    let root = outdir.unwrap_or_else(|| Path::new("."));
    match &completion.metainfo.layout {
        Layout::SingleFile { .. } => {
            let path = root.join(&completion.metainfo.name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &completion.data).with_context(|| format!("writing {}", path.display()))?;
            info!("wrote {}", path.display());
        }
        Layout::MultiFile { entries } => {
            let base_dir = root.join(&completion.metainfo.name);
            let mut begin = 0usize;
            for entry in entries {
                let path = base_dir.join(entry.path.iter().collect::<PathBuf>());
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let end = begin + entry.length as usize;
                fs::write(&path, &completion.data[begin..end])
                    .with_context(|| format!("writing {}", path.display()))?;
                info!("wrote {}", path.display());
                begin = end;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_core::metainfo::FileEntry;

    fn single_file_completion(name: &str, data: &[u8]) -> Completion {
        Completion {
            metainfo: Metainfo {
                announce: "http://tracker.example/announce".into(),
                info_hash: [0u8; 20],
                name: name.to_string(),
                piece_length: data.len() as u64,
                pieces: vec![[0u8; 20]],
                layout: Layout::SingleFile { length: data.len() as u64 },
                comment: None,
                created_by: None,
                creation_date: None,
                private: false,
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn writes_single_file_at_outdir_root() {
        let dir = tempfile::tempdir().unwrap();
        let completion = single_file_completion("hello.txt", b"hello world");
        write_output(&completion, Some(dir.path())).unwrap();

        let written = fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(written, b"hello world");
    }

    #[test]
    fn writes_multi_file_layout_split_across_entries() {
        let dir = tempfile::tempdir().unwrap();
        let completion = Completion {
            metainfo: Metainfo {
                announce: "http://tracker.example/announce".into(),
                info_hash: [0u8; 20],
                name: "bundle".into(),
                piece_length: 5,
                pieces: vec![[0u8; 20]],
                layout: Layout::MultiFile {
                    entries: vec![
                        FileEntry { path: vec!["a".into(), "b".into()], length: 3 },
                        FileEntry { path: vec!["c".into()], length: 2 },
                    ],
                },
                comment: None,
                created_by: None,
                creation_date: None,
                private: false,
            },
            data: b"AAABB".to_vec(),
        };

        write_output(&completion, Some(dir.path())).unwrap();

        assert_eq!(fs::read(dir.path().join("bundle/a/b")).unwrap(), b"AAA");
        assert_eq!(fs::read(dir.path().join("bundle/c")).unwrap(), b"BB");
    }
}
