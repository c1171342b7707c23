//! Chunk addressing
//!
//! A volume is stored as up to [`MAX_CHUNKS`] numbered blobs under its
//! name. On the wire and in blob names a chunk index is exactly four
//! decimal digits (`0000`..`9999`); anything else under a volume
//! namespace is not a chunk and is ignored.

/// Maximum number of chunks per volume.
///
/// When changing this also change the four-digit chunk name format,
/// which encodes indices 0000-9999.
pub const MAX_CHUNKS: u32 = 10_000;

/// Lower limit for the configurable chunk size (10 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Format a chunk index as its blob name (`7` -> `"0007"`).
#[must_use]
pub fn chunk_name(chunk: u16) -> String {
    format!("{chunk:04}")
}

/// Check whether a blob name names a chunk: exactly four ASCII digits.
#[must_use]
pub fn is_chunk_name(name: &str) -> bool {
    name.len() == 4 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Parse a blob name back into a chunk index, if it is a chunk name.
#[must_use]
pub fn parse_chunk_name(name: &str) -> Option<u16> {
    if !is_chunk_name(name) {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_name_roundtrip() {
        assert_eq!(chunk_name(0), "0000");
        assert_eq!(chunk_name(7), "0007");
        assert_eq!(chunk_name(9999), "9999");
        assert_eq!(parse_chunk_name("0007"), Some(7));
        assert_eq!(parse_chunk_name("9999"), Some(9999));
    }

    #[test]
    fn test_non_chunk_names_rejected() {
        for name in ["", "007", "00071", "00a7", "lock", "0007.tmp", "-001"] {
            assert!(!is_chunk_name(name), "{name:?} accepted");
            assert_eq!(parse_chunk_name(name), None);
        }
    }

    #[test]
    fn test_index_bounds() {
        assert!(u32::from(parse_chunk_name("9999").unwrap()) < MAX_CHUNKS);
        assert_eq!(parse_chunk_name(&chunk_name(1234)), Some(1234));
    }
}
