//! Magnet link validation.

use super::{InfoHash, TorrentError};

const BTIH_PREFIX: &str = "xt=urn:btih:";

/// A validated magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLink {
    raw: String,
    info_hash: InfoHash,
    display_name: Option<String>,
    trackers: Vec<String>,
}

impl SourceLink {
    /// Parses a magnet link and extracts its info hash.
    ///
    /// # Errors
    /// - `TorrentError::InvalidSourceLink` - Malformed magnet URI or missing/invalid btih hash
    pub fn parse(link: &str) -> Result<Self, TorrentError> {
        let link = link.trim();
        let magnet =
            magnet_url::Magnet::new(link).map_err(|e| TorrentError::InvalidSourceLink {
                reason: format!("Invalid magnet link: {e}"),
            })?;

        let info_hash = Self::extract_info_hash(link)?;

        Ok(Self {
            raw: link.to_string(),
            info_hash,
            display_name: magnet.display_name().map(|s| s.to_string()),
            trackers: magnet.trackers().to_vec(),
        })
    }

    /// The link exactly as supplied (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    fn extract_info_hash(link: &str) -> Result<InfoHash, TorrentError> {
        let query = link.split_once('?').map(|(_, query)| query).unwrap_or("");

        let hash_str = query
            .split('&')
            .find_map(|param| param.strip_prefix(BTIH_PREFIX))
            .ok_or_else(|| TorrentError::InvalidSourceLink {
                reason: format!("Missing btih info hash in magnet link: {link}"),
            })?;

        let bytes = hex::decode(hash_str).map_err(|e| TorrentError::InvalidSourceLink {
            reason: format!("Invalid hex info hash {hash_str}: {e}"),
        })?;

        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| TorrentError::InvalidSourceLink {
                reason: format!("Invalid hash length: {} (expected 20 bytes)", bytes.len()),
            })?;

        Ok(InfoHash::new(hash))
    }
}

impl std::fmt::Display for SourceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Movie&tr=http://tracker.example.com/announce";

    #[test]
    fn test_parse_extracts_info_hash() {
        let source = SourceLink::parse(LINK).unwrap();

        assert_eq!(
            source.info_hash().to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(source.as_str(), LINK);
    }

    #[test]
    fn test_parse_rejects_non_magnet() {
        let result = SourceLink::parse("https://example.com/movie.torrent");
        assert!(matches!(
            result,
            Err(TorrentError::InvalidSourceLink { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_short_hash() {
        let result = SourceLink::parse("magnet:?xt=urn:btih:abcdef&dn=Short");
        assert!(matches!(
            result,
            Err(TorrentError::InvalidSourceLink { .. })
        ));
    }
}
