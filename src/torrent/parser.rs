//! Torrent file parser
//!
//! Decodes bencoded `.torrent` data into a [`BencodeValue`] tree and extracts
//! the fields needed for piece verification.

use std::ops::Range;
use tracing::{debug, trace, warn};

use crate::error::MirrorError;
use crate::torrent::info::{FileEntry, Layout, TorrentMetadata};

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 64;

/// Bencode value
///
/// Dictionaries keep their entries in the order they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary key (first occurrence wins)
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }
}

/// Decode a complete bencoded document
pub fn decode(data: &[u8]) -> Result<BencodeValue, MirrorError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.parse_value(0)?;

    if decoder.idx != data.len() {
        warn!("Parsed {}/{} bytes", decoder.idx, data.len());
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    idx: usize,
    /// Byte span of the top-level `info` value
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            idx: 0,
            info_span: None,
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue, MirrorError> {
        if depth > MAX_DEPTH {
            return Err(MirrorError::malformed_at("Nesting too deep", self.idx));
        }

        let byte = *self
            .data
            .get(self.idx)
            .ok_or_else(|| MirrorError::malformed_at("Unexpected end of data", self.idx))?;

        match byte {
            b'i' => {
                self.idx += 1;
                let end = self.find(b'e')
                    .ok_or_else(|| MirrorError::malformed_at("Unterminated integer", self.idx))?;
                let value = std::str::from_utf8(&self.data[self.idx..end])
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| MirrorError::malformed_at("Invalid integer", self.idx))?;
                self.idx = end + 1;
                Ok(BencodeValue::Int(value))
            }
            b'l' => {
                let start = self.idx;
                self.idx += 1;
                let mut list = Vec::new();
                loop {
                    match self.data.get(self.idx) {
                        None => return Err(MirrorError::malformed_at("Unterminated list", start)),
                        Some(b'e') => break,
                        Some(_) => list.push(self.parse_value(depth + 1)?),
                    }
                }
                self.idx += 1;
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                let start = self.idx;
                self.idx += 1;
                let mut dict = Vec::new();
                loop {
                    match self.data.get(self.idx) {
                        None => return Err(MirrorError::malformed_at("Unterminated dictionary", start)),
                        Some(b'e') => break,
                        Some(_) => {}
                    }
                    let key = match self.parse_value(depth + 1)? {
                        BencodeValue::Bytes(b) => b,
                        _ => return Err(MirrorError::malformed_at("Dictionary key must be bytes", self.idx)),
                    };
                    let value_start = self.idx;
                    let value = self.parse_value(depth + 1)?;
                    if depth == 0 && key == b"info" && self.info_span.is_none() {
                        self.info_span = Some(value_start..self.idx);
                    }
                    dict.push((key, value));
                }
                self.idx += 1;
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => {
                let colon = self.find(b':')
                    .ok_or_else(|| MirrorError::malformed_at("Truncated string length prefix", self.idx))?;
                let length = std::str::from_utf8(&self.data[self.idx..colon])
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| MirrorError::malformed_at("Invalid string length prefix", self.idx))?;
                let start = colon + 1;
                let end = start
                    .checked_add(length)
                    .filter(|&end| end <= self.data.len())
                    .ok_or_else(|| MirrorError::malformed_at("Byte string runs past end of data", self.idx))?;
                self.idx = end;
                Ok(BencodeValue::Bytes(self.data[start..end].to_vec()))
            }
            _ => Err(MirrorError::malformed_at(format!("Unknown bencode type: {}", byte), self.idx)),
        }
    }

    fn find(&self, needle: u8) -> Option<usize> {
        self.data[self.idx..]
            .iter()
            .position(|&b| b == needle)
            .map(|p| p + self.idx)
    }
}

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata, MirrorError> {
        debug!("Parsing torrent metadata from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let mut decoder = Decoder::new(data);
        let root = decoder.parse_value(0)?;
        if decoder.idx != data.len() {
            warn!("Parsed {}/{} bytes", decoder.idx, data.len());
        }

        let info_hash = decoder
            .info_span
            .map(|span| TorrentMetadata::generate_info_hash(&data[span]));

        Self::convert_to_metadata(&root, info_hash)
    }

    fn convert_to_metadata(root: &BencodeValue, info_hash: Option<[u8; 20]>) -> Result<TorrentMetadata, MirrorError> {
        if root.as_dict().is_none() {
            return Err(MirrorError::malformed("Root must be a dictionary"));
        }

        let info_dict = root
            .get(b"info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| MirrorError::malformed("Missing info dictionary"))?;

        let name_bytes = info_dict
            .get(b"name")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| MirrorError::malformed("Missing name field"))?;
        let name = Self::path_component(name_bytes)?;

        let piece_length = match info_dict.get(b"piece length").and_then(BencodeValue::as_int) {
            Some(value) if value > 0 && value <= u32::MAX as i64 => value as u32,
            Some(value) => return Err(MirrorError::InvalidPieceLength { value }),
            None => return Err(MirrorError::InvalidPieceLength { value: 0 }),
        };

        let pieces_bytes = info_dict
            .get(b"pieces")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| MirrorError::malformed("Missing pieces field"))?;
        let piece_hashes = TorrentMetadata::parse_piece_hashes(pieces_bytes)?;

        let layout = if let Some(file_list) = info_dict.get(b"files") {
            let file_list = file_list
                .as_list()
                .ok_or_else(|| MirrorError::malformed("files must be a list"))?;
            let mut files = Vec::with_capacity(file_list.len());
            for file_entry in file_list {
                let length = Self::length_field(file_entry)?;
                let components = file_entry
                    .get(b"path")
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| MirrorError::malformed("Missing file path"))?;
                if components.is_empty() {
                    return Err(MirrorError::malformed("Empty file path"));
                }
                let mut path = Vec::with_capacity(components.len());
                for component in components {
                    let bytes = component
                        .as_bytes()
                        .ok_or_else(|| MirrorError::malformed("File path component must be bytes"))?;
                    path.push(Self::path_component(bytes)?);
                }
                files.push(FileEntry { path, length });
            }
            Layout::MultiFile(files)
        } else if info_dict.get(b"length").is_some() {
            let length = Self::length_field(info_dict)?;
            Layout::SingleFile(FileEntry {
                path: vec![name.clone()],
                length,
            })
        } else {
            return Err(MirrorError::malformed("Neither length nor files found in info dict"));
        };

        let metadata = TorrentMetadata {
            name,
            piece_length,
            piece_hashes,
            layout,
            info_hash,
        };

        // Lengths are bencode integers, so their sum has to be one too
        match metadata.checked_total_size() {
            Some(total) if total <= i64::MAX as u64 => {}
            _ => return Err(MirrorError::malformed("Total file length overflows")),
        }
        debug!(
            "Decoded torrent '{}': {} pieces of {} bytes, {} file(s)",
            metadata.name,
            metadata.piece_count(),
            metadata.piece_length,
            metadata.files().len()
        );
        Ok(metadata)
    }

    fn length_field(dict: &BencodeValue) -> Result<u64, MirrorError> {
        match dict.get(b"length").and_then(BencodeValue::as_int) {
            Some(len) if len >= 0 => Ok(len as u64),
            Some(len) => Err(MirrorError::malformed(format!("Negative file length: {}", len))),
            None => Err(MirrorError::malformed("Missing file length")),
        }
    }

    /// A single path component that cannot escape the download directory
    fn path_component(bytes: &[u8]) -> Result<String, MirrorError> {
        let component = String::from_utf8_lossy(bytes).to_string();
        if component.is_empty() || component == "." || component == ".." || component.contains(['/', '\\']) {
            return Err(MirrorError::malformed(format!("Invalid path component: {:?}", component)));
        }
        Ok(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bencode_int() {
        assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
        assert_eq!(decode(b"i-7e").unwrap().as_int(), Some(-7));
    }

    #[test]
    fn test_parse_bencode_string() {
        let value = decode(b"4:test").unwrap();
        assert_eq!(value.as_bytes(), Some(b"test".as_ref()));
        assert_eq!(decode(b"0:").unwrap().as_bytes(), Some(b"".as_ref()));
    }

    #[test]
    fn test_parse_bencode_list() {
        let value = decode(b"l4:testi42ee").unwrap();
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].as_int(), Some(42));
    }

    #[test]
    fn test_dict_preserves_insertion_order() {
        // Keys deliberately out of sorted order
        let value = decode(b"d1:zi1e1:ai2e1:mi3ee").unwrap();
        let keys: Vec<&[u8]> = value.as_dict().unwrap().iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"z".as_ref(), b"a".as_ref(), b"m".as_ref()]);
        assert_eq!(value.get(b"a").and_then(BencodeValue::as_int), Some(2));
    }

    #[test]
    fn test_truncated_inputs_are_malformed() {
        for input in [
            b"".as_ref(),
            b"10:short",
            b"12",
            b"i42",
            b"l4:test",
            b"d3:key",
            b"d3:keyi1e",
            b"di1ei2ee",
            b"x",
        ] {
            let err = decode(input).unwrap_err();
            assert!(
                matches!(err, MirrorError::MalformedMetadata { .. }),
                "{:?} decoded to {:?}",
                String::from_utf8_lossy(input),
                err
            );
        }
    }

    #[test]
    fn test_nesting_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(matches!(decode(&data), Err(MirrorError::MalformedMetadata { .. })));
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let data = b"d8:announce3:url4:infod6:lengthi300e4:name5:a.bin12:piece lengthi256e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee";
        let meta = TorrentParser::parse_bytes(data).unwrap();
        assert_eq!(meta.name, "a.bin");
        assert_eq!(meta.piece_length, 256);
        assert_eq!(meta.piece_count(), 2);
        assert!(!meta.is_multi_file());
        assert_eq!(meta.total_size(), 300);
        assert!(meta.info_hash.is_some());
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let data = b"d4:infod5:filesld6:lengthi10e4:pathl3:sub5:x.txteed6:lengthi5e4:pathl5:y.txteee4:name3:dir12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let meta = TorrentParser::parse_bytes(data).unwrap();
        assert!(meta.is_multi_file());
        let files = meta.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, vec!["dir", "sub", "x.txt"]);
        assert_eq!(files[1].length, 5);
        assert_eq!(meta.total_size(), 15);
    }

    #[test]
    fn test_invalid_piece_length() {
        let data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi0e6:pieces0:ee";
        assert!(matches!(
            TorrentParser::parse_bytes(data),
            Err(MirrorError::InvalidPieceLength { value: 0 })
        ));

        let data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi-5e6:pieces0:ee";
        assert!(matches!(
            TorrentParser::parse_bytes(data),
            Err(MirrorError::InvalidPieceLength { value: -5 })
        ));
    }

    #[test]
    fn test_overflowing_total_length_is_malformed() {
        let data = b"d4:infod5:filesld6:lengthi9223372036854775807e4:pathl1:aeed6:lengthi9223372036854775807e4:pathl1:beee4:name3:dir12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(
            TorrentParser::parse_bytes(data),
            Err(MirrorError::MalformedMetadata { .. })
        ));

        let data = b"d4:infod6:lengthi9223372036854775807e4:name1:a12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(TorrentParser::parse_bytes(data).is_ok());
    }

    #[test]
    fn test_invalid_piece_hash_table() {
        let data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi16e6:pieces21:aaaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(
            TorrentParser::parse_bytes(data),
            Err(MirrorError::InvalidPieceHashTable { length: 21 })
        ));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let data = b"d4:infod5:filesld6:lengthi1e4:pathl2:..6:escapeeee4:name1:d12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(
            TorrentParser::parse_bytes(data),
            Err(MirrorError::MalformedMetadata { .. })
        ));
    }

    #[test]
    fn test_info_hash_covers_info_dict_only() {
        let info = b"d6:lengthi1e4:name1:a12:piece lengthi16e6:pieces0:e";
        let mut data = b"d8:announce3:url4:info".to_vec();
        data.extend_from_slice(info);
        data.push(b'e');

        let meta = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(meta.info_hash, Some(TorrentMetadata::generate_info_hash(info)));
    }
}
