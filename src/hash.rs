use hex::encode;
use sha2::{Digest, Sha256};

/// Content fingerprints for migration files.
///
/// SHA-256 over the raw bytes: any edit, including whitespace, yields a different checksum,
/// which is what makes an edited migration show up as pending again.
pub struct Hash;

impl Hash {
    pub fn checksum(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        encode(hasher.finalize())
    }

    pub fn short_checksum(checksum: &str) -> &str {
        checksum.get(..12).unwrap_or(checksum)
    }
}
