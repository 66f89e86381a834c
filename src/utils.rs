use std::hash::Hash;

use sha2::{Digest, Sha256};

pub fn crc_hash<H: Hash>(v: H) -> u32 {
    let mut hasher = crc32fast::Hasher::default();
    v.hash(&mut hasher);
    hasher.finalize()
}

/// The lowercase hex sha256 digest of the given data.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Spreads content hashes over two directory levels: `{h[0:2]}/{h[2:4]}/{h}`.
pub fn sharded_location(hash: &str) -> String {
    format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
}
