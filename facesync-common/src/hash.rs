//! Content-address helpers

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(data.as_ref());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        let url = "https://cdn.example.org/photos/42.jpg";
        assert_eq!(sha256_hex(url), sha256_hex(url));
        assert_eq!(sha256_hex(url).len(), 64);
    }
}
