//! Seed/Randomness Engine
//!
//! A seed is `<64 hex chars of OS entropy>|<unix millis>`. The winner index is
//! the first four bytes of SHA-256(seed), read big-endian, modulo the number
//! of entries frozen on the match. Verification reruns the same function, so
//! anyone holding the seed and the entry count can audit a draw.

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const SEED_ENTROPY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerDraw {
    pub seed: String,
    pub index: usize,
}

pub fn generate_seed(now: DateTime<Utc>) -> String {
    let mut entropy = [0u8; SEED_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    format!("{}|{}", hex::encode(entropy), now.timestamp_millis())
}

/// Deterministic winner position for `seed` over `entry_count` entries.
/// `None` when there is nothing to pick from.
pub fn winner_index(seed: &str, entry_count: usize) -> Option<usize> {
    if entry_count == 0 {
        return None;
    }
    let digest = Sha256::digest(seed.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Some(prefix as usize % entry_count)
}

/// Fresh seed plus the index it selects
pub fn draw(entry_count: usize, now: DateTime<Utc>) -> Option<WinnerDraw> {
    let seed = generate_seed(now);
    let index = winner_index(&seed, entry_count)?;
    Some(WinnerDraw { seed, index })
}
