//! A minimal bencode reader.
//!
//! This is deliberately not a full codec: it decodes just enough structure
//! (integers, byte strings, lists, dictionaries) to extract typed fields, and
//! additionally can locate the exact byte span of a top-level dictionary value
//! without re-encoding anything. That span-finding is what lets
//! [`crate::metainfo`] hash the `info` dictionary over its original bytes
//! instead of a re-serialized copy — bencode is not canonicalizing under all
//! encoders, so re-encoding and hashing would silently diverge from what other
//! clients compute (spec.md §4.1).

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DecodeError {}

fn err(msg: impl Into<String>) -> DecodeError {
    DecodeError(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    // Preserves source key order; bencode dicts are conventionally sorted but
    // this reader never assumes it.
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

pub fn dict_get<'a>(entries: &'a [(Vec<u8>, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_slice() == key.as_bytes())
        .map(|(_, v)| v)
}

/// Decode a complete bencoded value starting at `pos`. Returns the value and
/// the offset just past it.
pub fn decode(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    match bytes.get(pos) {
        Some(b'i') => decode_int(bytes, pos).map(|(v, end)| (Value::Int(v), end)),
        Some(b'l') => decode_list(bytes, pos),
        Some(b'd') => decode_dict(bytes, pos),
        Some(c) if c.is_ascii_digit() => {
            decode_bytes(bytes, pos).map(|(v, end)| (Value::Bytes(v.to_vec()), end))
        }
        Some(c) => Err(err(format!("unexpected byte '{}' at offset {}", *c as char, pos))),
        None => Err(err(format!("unexpected end of input at offset {}", pos))),
    }
}

fn decode_int(bytes: &[u8], pos: usize) -> Result<(i64, usize), DecodeError> {
    if bytes.get(pos) != Some(&b'i') {
        return Err(err("expected 'i'"));
    }
    let rest = &bytes[pos + 1..];
    let e = rest
        .iter()
        .position(|&b| b == b'e')
        .ok_or_else(|| err("unterminated integer"))?;
    let digits = std::str::from_utf8(&rest[..e]).map_err(|_| err("integer is not UTF-8"))?;
    let value: i64 = digits.parse().map_err(|_| err(format!("invalid integer '{}'", digits)))?;
    Ok((value, pos + 1 + e + 1))
}

fn decode_bytes(bytes: &[u8], pos: usize) -> Result<(&[u8], usize), DecodeError> {
    let colon = bytes[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| err("unterminated byte-string length"))?;
    let len_str = std::str::from_utf8(&bytes[pos..pos + colon])
        .map_err(|_| err("byte-string length is not UTF-8"))?;
    let len: usize = len_str
        .parse()
        .map_err(|_| err(format!("invalid byte-string length '{}'", len_str)))?;
    let start = pos + colon + 1;
    let end = start
        .checked_add(len)
        .ok_or_else(|| err("byte-string length overflow"))?;
    if end > bytes.len() {
        return Err(err("byte-string runs past end of input"));
    }
    Ok((&bytes[start..end], end))
}

fn decode_list(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut items = Vec::new();
    let mut cur = pos + 1;
    loop {
        match bytes.get(cur) {
            Some(b'e') => return Ok((Value::List(items), cur + 1)),
            Some(_) => {
                let (v, next) = decode(bytes, cur)?;
                items.push(v);
                cur = next;
            }
            None => return Err(err("unterminated list")),
        }
    }
}

fn decode_dict(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut entries = Vec::new();
    let mut cur = pos + 1;
    loop {
        match bytes.get(cur) {
            Some(b'e') => return Ok((Value::Dict(entries), cur + 1)),
            Some(_) => {
                let (key, next) = decode_bytes(bytes, cur)?;
                let key = key.to_vec();
                let (value, next) = decode(bytes, next)?;
                entries.push((key, value));
                cur = next;
            }
            None => return Err(err("unterminated dict")),
        }
    }
}

/// Skip over one complete value starting at `pos`, returning the offset just
/// past it, without allocating a [`Value`] for it.
fn skip_value(bytes: &[u8], pos: usize) -> Result<usize, DecodeError> {
    match bytes.get(pos) {
        Some(b'i') => decode_int(bytes, pos).map(|(_, end)| end),
        Some(b'l') => {
            let mut cur = pos + 1;
            loop {
                match bytes.get(cur) {
                    Some(b'e') => return Ok(cur + 1),
                    Some(_) => cur = skip_value(bytes, cur)?,
                    None => return Err(err("unterminated list")),
                }
            }
        }
        Some(b'd') => {
            let mut cur = pos + 1;
            loop {
                match bytes.get(cur) {
                    Some(b'e') => return Ok(cur + 1),
                    Some(_) => {
                        let (_, next) = decode_bytes(bytes, cur)?;
                        cur = skip_value(bytes, next)?;
                    }
                    None => return Err(err("unterminated dict")),
                }
            }
        }
        Some(c) if c.is_ascii_digit() => decode_bytes(bytes, pos).map(|(_, end)| end),
        Some(c) => Err(err(format!("unexpected byte '{}' at offset {}", *c as char, pos))),
        None => Err(err("unexpected end of input")),
    }
}

/// Find the exact byte span `[start, end)` of the value associated with `key`
/// in the top-level dictionary, without decoding any value other than the
/// ones needed to walk past them.
pub fn find_top_level_value_span(bytes: &[u8], key: &str) -> Result<(usize, usize), DecodeError> {
    if bytes.first() != Some(&b'd') {
        return Err(err("top-level value is not a dictionary"));
    }
    let mut cur = 1;
    loop {
        match bytes.get(cur) {
            Some(b'e') => return Err(err(format!("key '{}' not found", key))),
            Some(_) => {
                let (k, next) = decode_bytes(bytes, cur)?;
                let matched = k == key.as_bytes();
                let value_start = next;
                let value_end = skip_value(bytes, next)?;
                if matched {
                    return Ok((value_start, value_end));
                }
                cur = value_end;
            }
            None => return Err(err("unterminated dict")),
        }
    }
}

/// Re-encode a [`Value`] canonically (sorted dict keys). Used only for
/// building synthetic bencode fixtures in tests, never for hashing real
/// torrent data (see module docs on why re-encoding must not be used there).
#[cfg(test)]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

#[cfg(test)]
fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            let mut sorted: BTreeMap<&[u8], &Value> =
                entries.iter().map(|(k, v)| (k.as_slice(), v)).collect();
            out.push(b'd');
            for (k, v) in sorted.iter_mut() {
                out.extend_from_slice(k.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(k);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_int() {
        let (v, end) = decode(b"i42e", 0).unwrap();
        assert_eq!(v, Value::Int(42));
        assert_eq!(end, 4);
    }

    #[test]
    fn decodes_negative_int() {
        let (v, _) = decode(b"i-7e", 0).unwrap();
        assert_eq!(v, Value::Int(-7));
    }

    #[test]
    fn decodes_bytes() {
        let (v, end) = decode(b"4:spam", 0).unwrap();
        assert_eq!(v, Value::Bytes(b"spam".to_vec()));
        assert_eq!(end, 6);
    }

    #[test]
    fn decodes_list() {
        let (v, _) = decode(b"l4:spam4:eggse", 0).unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec())
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let (v, _) = decode(b"d3:cow3:moo4:spam4:eggse", 0).unwrap();
        let entries = v.as_dict().unwrap();
        assert_eq!(dict_get(entries, "cow"), Some(&Value::Bytes(b"moo".to_vec())));
        assert_eq!(dict_get(entries, "spam"), Some(&Value::Bytes(b"eggs".to_vec())));
    }

    #[test]
    fn finds_value_span_regardless_of_key_order() {
        // "info" declared before "announce": not canonical order, but must still work.
        let doc = b"d4:infod4:name3:foxe8:announce3:url7:comment4:texte";
        let (start, end) = find_top_level_value_span(doc, "info").unwrap();
        assert_eq!(&doc[start..end], &b"d4:name3:foxe"[..]);
    }

    #[test]
    fn missing_key_errors() {
        let doc = b"d3:cow3:mooe";
        assert!(find_top_level_value_span(doc, "info").is_err());
    }
}
