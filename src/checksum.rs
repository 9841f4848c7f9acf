use sha2::{Digest, Sha256};

/// SHA-256 hex digest over `up_bytes || 0x00 || down_bytes`. The NUL separator
/// keeps `("ab", "c")` and `("a", "bc")` from hashing identically.
pub(crate) fn checksum_hex(up: &[u8], down: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up);
    hasher.update([0u8]);
    hasher.update(down);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_64_lowercase_hex_chars() {
        let hex = checksum_hex(b"up", b"down");
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn is_deterministic() {
        assert_eq!(checksum_hex(b"up", b"down"), checksum_hex(b"up", b"down"));
    }

    #[test]
    fn separator_prevents_concatenation_collision() {
        assert_ne!(checksum_hex(b"ab", b"c"), checksum_hex(b"a", b"bc"));
    }

    #[test]
    fn differs_on_either_half_changing() {
        let base = checksum_hex(b"up", b"down");
        assert_ne!(base, checksum_hex(b"Up", b"down"));
        assert_ne!(base, checksum_hex(b"up", b"Down"));
    }
}
