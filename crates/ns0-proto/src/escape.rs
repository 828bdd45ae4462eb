//! Argument escaping.
//!
//! Tokens travel raw whenever they can be re-tokenised unambiguously:
//! printable, no whitespace, no `=`, nothing above `z` (keeps the wire
//! 7-bit clean without a table of exceptions). Everything else is sent as
//! `=<base64>` with the standard RFC 4648 alphabet.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{ProtoError, Result};

/// Whether `arg` must be base64-wrapped before hitting the wire.
pub fn needs_escape(arg: &[u8]) -> bool {
    arg.is_empty() || arg.iter().any(|&b| b <= b' ' || b > b'z' || b == b'=')
}

/// Encode one argument as a wire token.
pub fn escape_arg(arg: &[u8]) -> String {
    if needs_escape(arg) {
        format!("={}", STANDARD.encode(arg))
    } else {
        // guarded by needs_escape: all bytes are printable ASCII
        String::from_utf8_lossy(arg).into_owned()
    }
}

/// Decode one wire token back into the argument bytes.
pub fn unescape_arg(token: &str) -> Result<Vec<u8>> {
    match token.strip_prefix('=') {
        Some(b64) => STANDARD
            .decode(b64)
            .map_err(|_| ProtoError::BadBase64(token.to_owned())),
        None => Ok(token.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_token_passes_through() {
        assert_eq!(escape_arg(b"eth0"), "eth0");
        assert_eq!(unescape_arg("eth0").unwrap(), b"eth0");
    }

    #[test]
    fn empty_is_escaped() {
        let t = escape_arg(b"");
        assert_eq!(t, "=");
        assert_eq!(unescape_arg(&t).unwrap(), b"");
    }

    #[test]
    fn whitespace_is_escaped() {
        let t = escape_arg(b"hello world");
        assert!(t.starts_with('='));
        assert_eq!(unescape_arg(&t).unwrap(), b"hello world");
    }

    #[test]
    fn equals_sign_is_escaped() {
        let t = escape_arg(b"a=b");
        assert!(t.starts_with('='));
        assert_eq!(unescape_arg(&t).unwrap(), b"a=b");
    }

    #[test]
    fn high_bytes_are_escaped() {
        let raw = [b'a', 0xff, b'b'];
        let t = escape_arg(&raw);
        assert!(t.starts_with('='));
        assert_eq!(unescape_arg(&t).unwrap(), raw);
    }

    #[test]
    fn uppercase_above_z_boundary() {
        // '{' (0x7b) is just above 'z' and must be escaped
        assert!(needs_escape(b"a{b"));
        // 'z' itself is fine
        assert!(!needs_escape(b"zzz"));
    }

    #[test]
    fn control_bytes_are_escaped() {
        assert!(needs_escape(b"a\nb"));
        assert!(needs_escape(b"a\0b"));
    }

    #[test]
    fn roundtrip_binary_blob() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let t = escape_arg(&raw);
        assert_eq!(unescape_arg(&t).unwrap(), raw);
    }

    #[test]
    fn bad_base64_is_rejected() {
        assert!(unescape_arg("=!!!").is_err());
    }
}
