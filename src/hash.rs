//! Keccak-256 hashing of rendition bytes and the signature message built from them.

use sha3::{Digest, Keccak256};

pub type SegmentHash = [u8; 32];

pub fn keccak256(data: &[u8]) -> SegmentHash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Builds the message verified against the orchestrator's aggregate
/// signature: the concatenation of per-profile rendition hashes, in strict
/// profile-index order, then hashed once more.
pub fn signature_message(seg_hashes: &[SegmentHash]) -> SegmentHash {
    let mut buf = Vec::with_capacity(seg_hashes.len() * 32);
    for h in seg_hashes {
        buf.extend_from_slice(h);
    }
    keccak256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_empty_matches_known_vector() {
        let digest = keccak256(b"");
        assert_eq!(
            hex::encode(digest),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn signature_message_is_order_sensitive() {
        let a = keccak256(b"a");
        let b = keccak256(b"b");
        let forward = signature_message(&[a, b]);
        let backward = signature_message(&[b, a]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn signature_message_is_deterministic() {
        let a = keccak256(b"segment-a");
        let b = keccak256(b"segment-b");
        let c = keccak256(b"segment-c");
        let first = signature_message(&[a, b, c]);
        let second = signature_message(&[a, b, c]);
        assert_eq!(first, second);
    }
}
