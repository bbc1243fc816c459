//! Shared error enum and hex helpers for adsbus-core.

use thiserror::Error;

/// All errors produced by adsbus-core.
#[derive(Debug, Error)]
pub enum AdsbusError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("buffer underflow: asked to consume {requested} bytes, {available} buffered")]
    Underflow { requested: usize, available: usize },
    #[error("buffer full ({0} bytes) with no parseable frame")]
    BufferFull(usize),
    #[error("unknown format: {0}")]
    UnknownFormat(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("peer announced our own server id {0}; refusing to loop")]
    SelfLoop(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AdsbusError>;

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

/// Decode exactly `out.len() * 2` hex digits from `hex` into `out`.
///
/// Returns false (leaving `out` partially written) on a length mismatch or a
/// non-hex character.
pub fn hex_decode_into(out: &mut [u8], hex: &[u8]) -> bool {
    if hex.len() != out.len() * 2 {
        return false;
    }
    for (byte, chunk) in out.iter_mut().zip(hex.chunks(2)) {
        let (Some(high), Some(low)) = (hex_digit(chunk[0]), hex_digit(chunk[1])) else {
            return false;
        };
        *byte = (high << 4) | low;
    }
    true
}

/// Parse a big-endian hex integer of at most 16 digits.
pub fn hex_to_int(hex: &[u8]) -> Option<u64> {
    if hex.is_empty() || hex.len() > 16 {
        return None;
    }
    hex.iter()
        .try_fold(0u64, |acc, &c| Some((acc << 4) | hex_digit(c)? as u64))
}

/// Encode bytes as uppercase hex string.
pub fn hex_encode(data: &[u8]) -> String {
    let mut out = Vec::with_capacity(data.len() * 2);
    push_hex(&mut out, data);
    // Only ASCII from HEX_CHARS was pushed.
    out.into_iter().map(char::from).collect()
}

/// Append uppercase hex for `data` to `out`.
pub fn push_hex(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        out.push(HEX_CHARS[(b >> 4) as usize]);
        out.push(HEX_CHARS[(b & 0x0F) as usize]);
    }
}

/// Append `value` as exactly `digits` uppercase hex digits, truncating high bits.
pub fn push_hex_int(out: &mut Vec<u8>, value: u64, digits: usize) {
    for i in (0..digits).rev() {
        let shift = i * 4;
        let nibble = if shift >= 64 { 0 } else { (value >> shift) & 0x0F };
        out.push(HEX_CHARS[nibble as usize]);
    }
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_decode() {
        let mut out = [0u8; 3];
        assert!(hex_decode_into(&mut out, b"4840D6"));
        assert_eq!(out, [0x48, 0x40, 0xD6]);
        assert!(hex_decode_into(&mut out, b"4840d6"));
        assert_eq!(out, [0x48, 0x40, 0xD6]);
        assert!(!hex_decode_into(&mut out[..2], b"ZZZZ")); // invalid chars
    }

    #[test]
    fn test_hex_decode_into_length_mismatch() {
        let mut out = [0u8; 2];
        assert!(!hex_decode_into(&mut out, b"ABCDEF"));
        assert!(hex_decode_into(&mut out, b"ABCD"));
        assert_eq!(out, [0xAB, 0xCD]);
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x48, 0x40, 0xD6]), "4840D6");
    }

    #[test]
    fn test_hex_to_int() {
        assert_eq!(hex_to_int(b"0000000A"), Some(10));
        assert_eq!(hex_to_int(b"00ff"), Some(255));
        assert_eq!(hex_to_int(b"0G"), None);
        assert_eq!(hex_to_int(b""), None);
    }

    #[test]
    fn test_push_hex_int_pads_and_truncates() {
        let mut out = Vec::new();
        push_hex_int(&mut out, 0x0A, 2);
        push_hex_int(&mut out, 0x1_2345_6789, 8);
        assert_eq!(out, b"0A23456789");
    }
}
