//! Seeded XXH64 content hashes
//!
//! Function-name hashes are persisted in presets and callstack hashes key
//! maps across captures, so both must be identical across runs and builds.

use hookprof_common::HASH_SEED;
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Hash of a pretty name, used for preset replay
#[must_use]
pub fn string_hash(value: &str) -> u64 {
    xxh64(value.as_bytes(), HASH_SEED)
}

/// Hash over a sequence of 64-bit words in little-endian order
#[must_use]
pub fn words_hash(words: &[u64]) -> u64 {
    let mut hasher = Xxh64::new(HASH_SEED);
    for word in words {
        hasher.update(&word.to_le_bytes());
    }
    hasher.digest()
}

/// Hash of a sampling-report row, stable across re-captures
#[must_use]
pub fn row_hash(name: &str, file: &str, address: u64) -> u64 {
    let mut hasher = Xxh64::new(HASH_SEED);
    hasher.update(name.as_bytes());
    hasher.update(file.as_bytes());
    hasher.update(&address.to_le_bytes());
    hasher.digest()
}
