//! Bencode value tree, parser and emitter

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{trace, warn};

use crate::error::TorrentError;

/// A parsed bencode value
///
/// Dictionary keys are raw byte strings; `BTreeMap` keeps them in sorted
/// order, which is the canonical emit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

/// Parse a bencode value from bytes
///
/// Leading ASCII whitespace before the top-level value is skipped; no
/// whitespace is permitted inside structures. Trailing bytes after the
/// top-level value are tolerated with a warning (some trackers pad their
/// responses).
pub fn parse(data: &[u8]) -> Result<BencodeValue> {
    let mut idx = 0;
    while idx < data.len() && data[idx].is_ascii_whitespace() {
        idx += 1;
    }

    let value = parse_value(data, &mut idx)?;

    if idx != data.len() {
        warn!("Parsed {}/{} bytes of bencode input", idx, data.len());
    }

    Ok(value)
}

fn parse_value(data: &[u8], idx: &mut usize) -> Result<BencodeValue> {
    if *idx >= data.len() {
        return Err(TorrentError::invalid_bencode("unexpected end of input").into());
    }

    let byte = data[*idx];
    trace!("Parsing bencode value starting with {:?} at {}", byte as char, idx);

    match byte {
        b'i' => {
            *idx += 1;
            let end = data[*idx..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| TorrentError::invalid_bencode_at("unterminated integer", *idx))?
                + *idx;
            let num_str = std::str::from_utf8(&data[*idx..end]).map_err(|_| {
                TorrentError::invalid_bencode_at("integer is not valid ASCII", *idx)
            })?;
            let value: i64 = num_str.parse().map_err(|_| {
                TorrentError::invalid_bencode_at("integer digits do not parse", *idx)
            })?;
            *idx = end + 1;
            Ok(BencodeValue::Integer(value))
        }
        b'l' => {
            *idx += 1;
            let mut list = Vec::new();
            while *idx < data.len() && data[*idx] != b'e' {
                list.push(parse_value(data, idx)?);
            }
            if *idx >= data.len() {
                return Err(TorrentError::invalid_bencode("unterminated list").into());
            }
            *idx += 1; // skip 'e'
            Ok(BencodeValue::List(list))
        }
        b'd' => {
            *idx += 1;
            let mut dict = BTreeMap::new();
            while *idx < data.len() && data[*idx] != b'e' {
                let key = match parse_value(data, idx)? {
                    BencodeValue::Bytes(b) => b,
                    _ => {
                        return Err(TorrentError::invalid_bencode_at(
                            "dictionary key must be a byte string",
                            *idx,
                        )
                        .into())
                    }
                };
                let value = parse_value(data, idx)?;
                dict.insert(key, value);
            }
            if *idx >= data.len() {
                return Err(TorrentError::invalid_bencode("unterminated dictionary").into());
            }
            *idx += 1; // skip 'e'
            Ok(BencodeValue::Dict(dict))
        }
        b'0'..=b'9' => {
            let colon = data[*idx..]
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| {
                    TorrentError::invalid_bencode_at("unterminated string length", *idx)
                })?
                + *idx;
            let len_str = std::str::from_utf8(&data[*idx..colon]).map_err(|_| {
                TorrentError::invalid_bencode_at("string length is not valid ASCII", *idx)
            })?;
            let length: usize = len_str.parse().map_err(|_| {
                TorrentError::invalid_bencode_at("string length does not parse", *idx)
            })?;
            let start = colon + 1;
            if start + length > data.len() {
                return Err(TorrentError::invalid_bencode_at("truncated string", start).into());
            }
            *idx = start + length;
            Ok(BencodeValue::Bytes(data[start..*idx].to_vec()))
        }
        _ => Err(TorrentError::invalid_bencode_at(
            format!("unexpected byte 0x{:02x}", byte),
            *idx,
        )
        .into()),
    }
}

impl BencodeValue {
    /// Emit the value back to canonical bencode bytes
    ///
    /// Dictionary keys come out sorted, so `emit` of a parsed info
    /// dictionary reproduces the bytes the info hash was computed over.
    pub fn emit(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.emit_into(&mut buf);
        buf
    }

    fn emit_into(&self, buf: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            BencodeValue::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            BencodeValue::List(list) => {
                buf.push(b'l');
                for value in list {
                    value.emit_into(buf);
                }
                buf.push(b'e');
            }
            BencodeValue::Dict(dict) => {
                buf.push(b'd');
                for (key, value) in dict {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.emit_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Pretty-print the value as JSON for diagnostics
    ///
    /// Byte strings that contain anything outside printable ASCII and
    /// whitespace (piece hashes, compact peer lists) are rendered as
    /// space-separated uppercase hex instead of garbage.
    pub fn to_json(&self) -> String {
        let mut out = String::new();
        self.json_into(&mut out);
        out
    }

    fn json_into(&self, out: &mut String) {
        match self {
            BencodeValue::Integer(i) => out.push_str(&i.to_string()),
            BencodeValue::Bytes(bytes) => json_string(bytes, out),
            BencodeValue::List(list) => {
                out.push('[');
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    value.json_into(out);
                }
                out.push(']');
            }
            BencodeValue::Dict(dict) => {
                out.push('{');
                for (i, (key, value)) in dict.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    json_string(key, out);
                    out.push_str(": ");
                    value.json_into(out);
                }
                out.push('}');
            }
        }
    }

    /// Get the integer value, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the raw bytes, if this is a byte string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get the byte string as UTF-8 text (lossy), if this is a byte string
    pub fn as_str_lossy(&self) -> Option<String> {
        match self {
            BencodeValue::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
            _ => None,
        }
    }

    /// Get the list items, if this is a list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get the dictionary, if this is a dictionary
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary entry by key
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

fn json_string(bytes: &[u8], out: &mut String) {
    let printable = bytes
        .iter()
        .all(|&b| b.is_ascii_whitespace() || (b.is_ascii_graphic() || b == b' '));

    out.push('"');
    if printable {
        for &b in bytes {
            match b {
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                b'\t' => out.push_str("\\t"),
                _ => out.push(b as char),
            }
        }
    } else {
        for (i, &b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{:02X}", b));
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        let value = parse(b"i42e").unwrap();
        assert_eq!(value.as_int(), Some(42));

        let value = parse(b"i-17e").unwrap();
        assert_eq!(value.as_int(), Some(-17));
    }

    #[test]
    fn test_parse_string() {
        let value = parse(b"4:test").unwrap();
        assert_eq!(value.as_bytes(), Some(b"test".as_ref()));

        let value = parse(b"0:").unwrap();
        assert_eq!(value.as_bytes(), Some(b"".as_ref()));
    }

    #[test]
    fn test_parse_list() {
        let value = parse(b"l4:testi42ee").unwrap();
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_bytes(), Some(b"test".as_ref()));
        assert_eq!(list[1].as_int(), Some(42));
    }

    #[test]
    fn test_parse_dict() {
        let value = parse(b"d3:bari1e3:fooi2ee").unwrap();
        assert_eq!(value.get(b"bar").and_then(|v| v.as_int()), Some(1));
        assert_eq!(value.get(b"foo").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn test_parse_skips_leading_whitespace() {
        let value = parse(b"  \n\ti42e").unwrap();
        assert_eq!(value.as_int(), Some(42));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(b"").is_err());
        assert!(parse(b"i42").is_err()); // truncated integer
        assert!(parse(b"5:abc").is_err()); // truncated string
        assert!(parse(b"l4:test").is_err()); // unterminated list
        assert!(parse(b"d3:fooi1e").is_err()); // unterminated dict
        assert!(parse(b"di1ei2ee").is_err()); // non-string dict key
        assert!(parse(b"x").is_err()); // unexpected byte
    }

    #[test]
    fn test_emit_round_trip() {
        let inputs: &[&[u8]] = &[
            b"i42e",
            b"i-17e",
            b"4:test",
            b"l4:testi42ee",
            b"d3:bari1e3:fooi2ee",
            b"d4:infod4:name4:teste5:valuei7ee",
        ];
        for input in inputs {
            let value = parse(input).unwrap();
            assert_eq!(value.emit(), input.to_vec());
        }
    }

    #[test]
    fn test_emit_sorts_dict_keys() {
        // Keys arrive unsorted; the canonical emit sorts them.
        let value = parse(b"d3:zzzi1e3:aaai2ee").unwrap();
        assert_eq!(value.emit(), b"d3:aaai2e3:zzzi1ee".to_vec());
    }

    #[test]
    fn test_parse_torrent_shape() {
        // Scenario: a minimal single-file info dictionary.
        let data = b"d4:infod4:name4:test12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAA6:lengthi16384eee";
        let value = parse(data).unwrap();
        let info = value.get(b"info").unwrap();
        assert_eq!(info.get(b"name").unwrap().as_bytes(), Some(b"test".as_ref()));
        assert_eq!(
            info.get(b"piece length").unwrap().as_int(),
            Some(16384)
        );
        assert_eq!(info.get(b"length").unwrap().as_int(), Some(16384));
        assert_eq!(info.get(b"pieces").unwrap().as_bytes().unwrap().len(), 20);
        assert_eq!(
            info.get(b"pieces").unwrap().as_bytes(),
            Some([b'A'; 20].as_ref())
        );
    }

    #[test]
    fn test_to_json_printable() {
        let value = parse(b"d4:name4:teste").unwrap();
        assert_eq!(value.to_json(), r#"{"name": "test"}"#);
    }

    #[test]
    fn test_to_json_binary_as_hex() {
        let value = BencodeValue::Bytes(vec![0x01, 0xAB, 0xFF]);
        assert_eq!(value.to_json(), r#""01 AB FF""#);
    }

    #[test]
    fn test_to_json_list_and_int() {
        let value = parse(b"li1ei2e3:abce").unwrap();
        assert_eq!(value.to_json(), r#"[1, 2, "abc"]"#);
    }

    #[test]
    fn test_get_missing_key() {
        let value = parse(b"d3:fooi1ee").unwrap();
        assert!(value.get(b"bar").is_none());
    }
}
