//! Magnet link parser
//!
//! Extracts the info hash, display name, length and tracker URIs from a
//! `magnet:?...` URI. Everything else a magnet can carry is logged and
//! ignored; the missing info dictionary is fetched from peers later.

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;

/// Parsed magnet link
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// SHA1 info hash from the `xt` parameter
    pub info_hash: [u8; 20],
    /// Display name (`dn`)
    pub display_name: Option<String>,
    /// Total length in bytes (`xl`)
    pub total_length: Option<u64>,
    /// Tracker URIs (`tr`, may repeat)
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Check whether a string looks like a magnet link
    pub fn is_magnet(input: &str) -> bool {
        input.trim().starts_with("magnet:?")
    }

    /// Parse a magnet URI
    pub fn parse(magnet_uri: &str) -> Result<Self> {
        let url = Url::parse(magnet_uri).map_err(|e| {
            TorrentError::parse_error_with_source("Invalid magnet URI", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            return Err(TorrentError::parse_error(format!(
                "Not a magnet link (scheme: {})",
                url.scheme()
            ))
            .into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut total_length = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    info_hash = Some(extract_info_hash(&value)?);
                }
                "dn" => {
                    debug!("Magnet display name: {}", value);
                    display_name = Some(value.to_string());
                }
                "xl" => match value.parse::<u64>() {
                    Ok(length) => total_length = Some(length),
                    Err(_) => warn!("Invalid xl parameter: {}", value),
                },
                "tr" => {
                    debug!("Magnet tracker: {}", value);
                    trackers.push(value.to_string());
                }
                other => {
                    info!("Ignoring magnet parameter {}={}", other, value);
                }
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            TorrentError::parse_error("Magnet link is missing the xt=urn:btih:<hash> parameter")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(Self {
            info_hash,
            display_name,
            total_length,
            trackers,
        })
    }
}

/// Extract the 20-byte info hash from an `xt` value
///
/// Accepts `urn:btih:` followed by 40 hex characters or a 32-character
/// base32 string.
fn extract_info_hash(xt_value: &str) -> Result<[u8; 20]> {
    const URN_PREFIX: &str = "urn:btih:";

    let hash_str = xt_value.strip_prefix(URN_PREFIX).ok_or_else(|| {
        TorrentError::parse_error_with_source("xt parameter is not a BitTorrent info hash", xt_value)
    })?;

    match hash_str.len() {
        40 => {
            let bytes = hex::decode(hash_str).map_err(|e| {
                TorrentError::parse_error_with_source("Invalid hex info hash", e.to_string())
            })?;
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        32 => decode_base32(hash_str),
        other => Err(TorrentError::parse_error(format!(
            "Info hash has invalid length {} (expected 40 hex or 32 base32 characters)",
            other
        ))
        .into()),
    }
}

/// Decode an RFC 4648 base32 string into the 20-byte hash
fn decode_base32(input: &str) -> Result<[u8; 20]> {
    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(20);

    for c in input.chars() {
        let value = match c {
            'A'..='Z' => c as u64 - 'A' as u64,
            'a'..='z' => c as u64 - 'a' as u64,
            '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => {
                return Err(TorrentError::parse_error(format!(
                    "Invalid base32 character '{}' in info hash",
                    c
                ))
                .into())
            }
        };
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    if out.len() != 20 {
        return Err(TorrentError::parse_error(format!(
            "Base32 info hash decoded to {} bytes, expected 20",
            out.len()
        ))
        .into());
    }

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&out);
    Ok(hash)
}
