//! Parses a torrent descriptor into a validated, immutable [`Metainfo`].
//!
//! Grounded on the teacher's `src/torrent.rs` (field names, single-vs-multi-file
//! layout detection) but replaces its `serde_bencode` round-trip for the info
//! hash: that path decodes `info` then re-encodes it with `serde_bencode::to_bytes`
//! before hashing, which is wrong whenever the source bytes aren't already in
//! serde_bencode's canonical form (unsorted keys, a `root hash` alternative to
//! `pieces`, non-minimal integer spellings all decode fine but re-encode
//! differently). This parser instead locates the `info` value's byte span in the
//! original buffer with [`crate::bencode::find_top_level_value_span`] and hashes
//! that slice directly.

use sha1::{Digest, Sha1};
use url::Url;

use crate::bencode::{self, Value};
use crate::error::MetainfoError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    SingleFile { length: u64 },
    MultiFile { entries: Vec<FileEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub layout: Layout,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub private: bool,
}

impl Metainfo {
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            Layout::SingleFile { length } => *length,
            Layout::MultiFile { entries } => entries.iter().map(|e| e.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`, accounting for the final piece being shorter
    /// than `piece_length` (spec.md §3 invariant).
    pub fn expected_piece_length(&self, index: usize) -> u64 {
        let last = self.piece_count() - 1;
        if index == last {
            self.total_length() - (last as u64) * self.piece_length
        } else {
            self.piece_length
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Metainfo, MetainfoError> {
        if bytes.is_empty() {
            return Err(MetainfoError::NotADictionary);
        }

        let (top, _) = bencode::decode(bytes, 0)
            .map_err(|e| MetainfoError::MalformedBencoding(e.to_string()))?;
        let top = top.as_dict().ok_or(MetainfoError::NotADictionary)?;

        if let Some(encoding) = bencode::dict_get(top, "encoding") {
            let encoding = utf8_field(encoding, "encoding")?;
            if !encoding.eq_ignore_ascii_case("utf-8") {
                return Err(MetainfoError::UnsupportedEncoding(encoding.to_string()));
            }
        }

        let announce = bencode::dict_get(top, "announce")
            .ok_or(MetainfoError::MissingKey("announce"))?;
        let announce = utf8_field(announce, "announce")?.to_string();
        Url::parse(&announce)?;

        let (info_start, info_end) = bencode::find_top_level_value_span(bytes, "info")
            .map_err(|_| MetainfoError::MissingKey("info"))?;
        let info_hash: [u8; 20] = Sha1::digest(&bytes[info_start..info_end]).into();

        let info_value = bencode::dict_get(top, "info").ok_or(MetainfoError::MissingKey("info"))?;
        let info = info_value.as_dict().ok_or(MetainfoError::NotADictionary)?;

        let name = bencode::dict_get(info, "name")
            .ok_or(MetainfoError::MissingKey("name"))
            .and_then(|v| utf8_field(v, "name"))?
            .to_string();

        let piece_length = bencode::dict_get(info, "piece length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MissingKey("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::MalformedBencoding(
                "piece length must be positive".into(),
            ));
        }
        let piece_length = piece_length as u64;

        let pieces_raw = bencode::dict_get(info, "pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingKey("pieces"))?;
        if pieces_raw.is_empty() {
            return Err(MetainfoError::EmptyPieces);
        }
        if pieces_raw.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength(pieces_raw.len()));
        }
        let pieces: Vec<[u8; 20]> = pieces_raw
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let layout = parse_layout(info)?;

        let comment = bencode::dict_get(info, "comment")
            .map(|v| utf8_field(v, "comment"))
            .transpose()?
            .map(str::to_string);
        let created_by = bencode::dict_get(info, "created by")
            .map(|v| utf8_field(v, "created by"))
            .transpose()?
            .map(str::to_string);
        let creation_date = bencode::dict_get(top, "creation date").and_then(Value::as_int);
        let private = bencode::dict_get(info, "private").and_then(Value::as_int).unwrap_or(0) != 0;

        let piece_count = pieces.len() as u64;
        let total_length = match &layout {
            Layout::SingleFile { length } => *length,
            Layout::MultiFile { entries } => entries.iter().map(|e| e.length).sum(),
        };
        if total_length > (piece_count - 1) * piece_length + piece_length
            || total_length <= (piece_count - 1) * piece_length
        {
            return Err(MetainfoError::MalformedBencoding(format!(
                "total length {} inconsistent with {} pieces of length {}",
                total_length, piece_count, piece_length
            )));
        }

        Ok(Metainfo {
            announce,
            info_hash,
            name,
            piece_length,
            pieces,
            layout,
            comment,
            created_by,
            creation_date,
            private,
        })
    }
}

fn utf8_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, MetainfoError> {
    let bytes = value.as_bytes().ok_or(MetainfoError::InvalidUtf8(field))?;
    std::str::from_utf8(bytes).map_err(|_| MetainfoError::InvalidUtf8(field))
}

fn parse_layout(info: &[(Vec<u8>, Value)]) -> Result<Layout, MetainfoError> {
    let length = bencode::dict_get(info, "length").and_then(Value::as_int);
    let files = bencode::dict_get(info, "files").and_then(Value::as_list);

    match (length, files) {
        (Some(length), None) => {
            if length < 0 {
                return Err(MetainfoError::MalformedBencoding("negative length".into()));
            }
            Ok(Layout::SingleFile { length: length as u64 })
        }
        (None, Some(files)) if !files.is_empty() => {
            let mut entries = Vec::with_capacity(files.len());
            for file in files {
                let entry = file.as_dict().ok_or(MetainfoError::NotADictionary)?;
                let length = bencode::dict_get(entry, "length")
                    .and_then(Value::as_int)
                    .ok_or(MetainfoError::MissingKey("length"))?;
                if length < 0 {
                    return Err(MetainfoError::MalformedBencoding("negative length".into()));
                }
                let path_list = bencode::dict_get(entry, "path")
                    .and_then(Value::as_list)
                    .ok_or(MetainfoError::MissingKey("path"))?;
                let mut path = Vec::with_capacity(path_list.len());
                for segment in path_list {
                    let segment = utf8_field(segment, "path")?;
                    reject_unsafe_path_segment(segment)?;
                    path.push(segment.to_string());
                }
                if path.is_empty() {
                    return Err(MetainfoError::UnsafePath("empty path".into()));
                }
                entries.push(FileEntry {
                    path,
                    length: length as u64,
                });
            }
            Ok(Layout::MultiFile { entries })
        }
        _ => Err(MetainfoError::AmbiguousLayout),
    }
}

fn reject_unsafe_path_segment(segment: &str) -> Result<(), MetainfoError> {
    if segment.is_empty() || segment == ".." || segment == "." {
        return Err(MetainfoError::UnsafePath(segment.to_string()));
    }
    if segment.starts_with('/') || segment.contains('\0') {
        return Err(MetainfoError::UnsafePath(segment.to_string()));
    }
    #[cfg(windows)]
    {
        if segment.contains(':') || segment.contains('\\') {
            return Err(MetainfoError::UnsafePath(segment.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    fn sample_bytes(encoding: Option<&str>) -> Vec<u8> {
        let mut info_entries = vec![
            (b"name".to_vec(), Value::Bytes(b"fox.txt".to_vec())),
            (b"piece length".to_vec(), Value::Int(4)),
            (b"pieces".to_vec(), Value::Bytes(vec![7u8; 20])),
            (b"length".to_vec(), Value::Int(4)),
        ];
        info_entries.sort_by(|a, b| a.0.cmp(&b.0));
        let info = Value::Dict(info_entries);

        let mut top = vec![
            (b"announce".to_vec(), Value::Bytes(b"http://tracker.example/announce".to_vec())),
            (b"info".to_vec(), info),
        ];
        if let Some(enc) = encoding {
            top.push((b"encoding".to_vec(), Value::Bytes(enc.as_bytes().to_vec())));
        }
        top.sort_by(|a, b| a.0.cmp(&b.0));
        encode(&Value::Dict(top))
    }

    #[test]
    fn parses_single_file_layout() {
        let bytes = sample_bytes(Some("UTF-8"));
        let meta = Metainfo::parse(&bytes).unwrap();
        assert_eq!(meta.name, "fox.txt");
        assert_eq!(meta.layout, Layout::SingleFile { length: 4 });
        assert_eq!(meta.piece_count(), 1);
        assert_eq!(meta.total_length(), 4);
    }

    #[test]
    fn info_hash_is_over_original_bytes_not_a_reencoding() {
        // Hand-assemble an `info` dict with keys in non-alphabetical order
        // ("pieces" before "length" before "name"). A parser that decodes and
        // re-encodes canonically before hashing would silently normalize this
        // ordering and compute a different digest than the wire bytes demand.
        let mut info_body = Vec::new();
        info_body.extend_from_slice(b"d6:pieces20:");
        info_body.extend_from_slice(&[1u8; 20]);
        info_body.extend_from_slice(b"6:lengthi4e4:name3:foxe");

        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce32:http://tracker.example/announce4:info");
        doc.extend_from_slice(info_body.len().to_string().as_bytes());
        doc.push(b':');
        doc.extend_from_slice(&info_body);
        doc.push(b'e');

        let meta = Metainfo::parse(&doc).unwrap();
        let (start, end) = bencode::find_top_level_value_span(&doc, "info").unwrap();
        let expected: [u8; 20] = Sha1::digest(&doc[start..end]).into();
        assert_eq!(meta.info_hash, expected);
        assert_eq!(&doc[start..end], info_body.as_slice());
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let mut info_entries = vec![
            (b"name".to_vec(), Value::Bytes(b"fox".to_vec())),
            (b"piece length".to_vec(), Value::Int(4)),
            (b"pieces".to_vec(), Value::Bytes(vec![7u8; 19])),
            (b"length".to_vec(), Value::Int(4)),
        ];
        info_entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut top = vec![
            (b"announce".to_vec(), Value::Bytes(b"http://tracker.example/announce".to_vec())),
            (b"info".to_vec(), Value::Dict(info_entries)),
        ];
        top.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = encode(&Value::Dict(top));

        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, MetainfoError::BadPiecesLength(19)));
    }

    #[test]
    fn rejects_path_traversal() {
        let mut file_entries = vec![
            (b"length".to_vec(), Value::Int(1)),
            (
                b"path".to_vec(),
                Value::List(vec![Value::Bytes(b"..".to_vec())]),
            ),
        ];
        file_entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut info_entries = vec![
            (b"name".to_vec(), Value::Bytes(b"bundle".to_vec())),
            (b"piece length".to_vec(), Value::Int(4)),
            (b"pieces".to_vec(), Value::Bytes(vec![7u8; 20])),
            (
                b"files".to_vec(),
                Value::List(vec![Value::Dict(file_entries)]),
            ),
        ];
        info_entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut top = vec![
            (b"announce".to_vec(), Value::Bytes(b"http://tracker.example/announce".to_vec())),
            (b"info".to_vec(), Value::Dict(info_entries)),
        ];
        top.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = encode(&Value::Dict(top));

        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, MetainfoError::UnsafePath(_)));
    }

    #[test]
    fn rejects_unsupported_encoding() {
        let bytes = sample_bytes(Some("latin-1"));
        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, MetainfoError::UnsupportedEncoding(_)));
    }

    #[test]
    fn multi_file_layout_sums_length() {
        let mut a = vec![
            (b"length".to_vec(), Value::Int(3)),
            (b"path".to_vec(), Value::List(vec![Value::Bytes(b"a".to_vec()), Value::Bytes(b"b".to_vec())])),
        ];
        a.sort_by(|x, y| x.0.cmp(&y.0));
        let mut c = vec![
            (b"length".to_vec(), Value::Int(2)),
            (b"path".to_vec(), Value::List(vec![Value::Bytes(b"c".to_vec())])),
        ];
        c.sort_by(|x, y| x.0.cmp(&y.0));
        let mut info_entries = vec![
            (b"name".to_vec(), Value::Bytes(b"bundle".to_vec())),
            (b"piece length".to_vec(), Value::Int(5)),
            (b"pieces".to_vec(), Value::Bytes(vec![7u8; 20])),
            (
                b"files".to_vec(),
                Value::List(vec![Value::Dict(a), Value::Dict(c)]),
            ),
        ];
        info_entries.sort_by(|x, y| x.0.cmp(&y.0));
        let mut top = vec![
            (b"announce".to_vec(), Value::Bytes(b"http://tracker.example/announce".to_vec())),
            (b"info".to_vec(), Value::Dict(info_entries)),
        ];
        top.sort_by(|x, y| x.0.cmp(&y.0));
        let bytes = encode(&Value::Dict(top));

        let meta = Metainfo::parse(&bytes).unwrap();
        assert_eq!(meta.total_length(), 5);
        match meta.layout {
            Layout::MultiFile { entries } => {
                assert_eq!(entries[0].path, vec!["a", "b"]);
                assert_eq!(entries[1].path, vec!["c"]);
            }
            _ => panic!("expected multi-file layout"),
        }
    }
}
