// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use ahash::RandomState;
use byteview::ByteView;
use std::hash::{BuildHasher, Hash, Hasher};

// Fixed seeds so a key hashes identically on every node.
const HASH_SEED: (u64, u64, u64, u64) = (0x5143_8d5a, 0x9e37_79b9, 0x85eb_ca6b, 0xc2b2_ae35);

/// A cache key: opaque serialized bytes plus the partition it maps to.
/// Equality is by logical bytes; the hash is computed once at construction.
#[derive(Debug, Clone)]
pub struct CacheKey {
    bytes: ByteView,
    partition: u32,
    hash: u64,
}

impl CacheKey {
    pub fn new(bytes: impl Into<ByteView>, partition: u32) -> Self {
        let bytes = bytes.into();
        let state =
            RandomState::with_seeds(HASH_SEED.0, HASH_SEED.1, HASH_SEED.2, HASH_SEED.3);
        let mut hasher = state.build_hasher();
        hasher.write(bytes.as_ref());
        let hash = hasher.finish();
        Self {
            bytes,
            partition,
            hash,
        }
    }

    pub fn from_str(s: &str, partition: u32) -> Self {
        Self::new(s.as_bytes().to_vec(), partition)
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn byte_view(&self) -> ByteView {
        self.bytes.clone()
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn key_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes.as_ref() == other.bytes.as_ref()
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_partition() {
        // Partition is routing metadata, not identity.
        let a = CacheKey::from_str("k", 0);
        let b = CacheKey::from_str("k", 3);
        assert_eq!(a, b);
        assert_eq!(a.key_hash(), b.key_hash());
    }

    #[test]
    fn test_hash_stable_across_constructions() {
        let a = CacheKey::from_str("some-key", 1);
        let b = CacheKey::new("some-key".as_bytes().to_vec(), 1);
        assert_eq!(a.key_hash(), b.key_hash());
        assert_ne!(a.key_hash(), CacheKey::from_str("other-key", 1).key_hash());
    }
}
