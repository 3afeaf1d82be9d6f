//! State Hashing for Verification
//!
//! Provides deterministic hashing of game state for:
//! - Integrity verification between client/server
//! - Cheap divergence checks in logs

use serde::Serialize;
use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain separator for match state hashes.
pub const STATE_DOMAIN: &[u8] = b"TURNSYNC_STATE_V1";

/// Deterministic hasher for game state.
///
/// Wraps SHA-256 with a domain separator. Order of updates is critical for
/// determinism.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for match state.
    pub fn for_match_state() -> Self {
        Self::new(STATE_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with the canonical bincode encoding of a value.
    pub fn update_serialized<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), bincode::Error> {
        let bytes = bincode::serialize(value)?;
        // Length prefix keeps adjacent values from running together.
        self.update_u64(bytes.len() as u64);
        self.hasher.update(&bytes);
        Ok(())
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a game core together with the state version it belongs to.
pub fn compute_state_hash<T: Serialize + ?Sized>(version: u64, core: &T) -> Result<StateHash, bincode::Error> {
    let mut hasher = StateHasher::for_match_state();
    hasher.update_u64(version);
    hasher.update_serialized(core)?;
    Ok(hasher.finalize())
}

/// First bytes of a hash as hex, for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..6])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_state_hash_determinism() {
        let mut core = BTreeMap::new();
        core.insert("alice".to_string(), 12i32);
        core.insert("bob".to_string(), 7i32);

        let hash1 = compute_state_hash(3, &core).unwrap();
        let hash2 = compute_state_hash(3, &core.clone()).unwrap();
        assert_eq!(hash1, hash2);

        // Different version = different hash
        let hash3 = compute_state_hash(4, &core).unwrap();
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_u64(1);
            h.update_u64(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_u64(2);
            h.update_u64(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];

        let hash1 = hash_with_domain(b"DOMAIN_A", &data);
        let hash2 = hash_with_domain(b"DOMAIN_B", &data);

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_short_hex() {
        let hash = [0xabu8; 32];
        assert_eq!(short_hex(&hash), "abababababab");
    }
}
