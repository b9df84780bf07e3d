//! Hash utilities and functions

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash multiple pieces of data together, separating them with `-`.
///
/// The separator keeps `["ab", "c"]` and `["a", "bc"]` distinct.
pub fn sha256_hex_joined(pieces: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, piece) in pieces.iter().enumerate() {
        if i > 0 {
            hasher.update(b"-");
        }
        hasher.update(piece);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_joined_matches_manual_concatenation() {
        assert_eq!(sha256_hex_joined(&[b"1", b"x", b"y"]), sha256_hex(b"1-x-y"));
        assert_ne!(sha256_hex_joined(&[b"ab", b"c"]), sha256_hex_joined(&[b"a", b"bc"]));
    }
}
