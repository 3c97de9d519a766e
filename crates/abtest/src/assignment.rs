//! Deterministic bucketing. The same (namespace, subscriber) pair always
//! lands in the same bucket, so assignments survive retries and process
//! restarts without being persisted first.

use sha2::{Digest, Sha256};

/// Buckets are in `0..10_000`, matching split percentages scaled by 100.
pub const BUCKET_SPACE: u32 = 10_000;

/// `sha256(namespace ":" subscriber_id)` folded into the bucket space.
pub fn stable_bucket(namespace: &str, subscriber_id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(subscriber_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % BUCKET_SPACE as u64) as u32
}

/// Picks the index whose cumulative percentage range contains `bucket`.
/// `percentages` must sum to 100 (validated at test creation).
pub fn pick_index(bucket: u32, percentages: &[u8]) -> usize {
    let mut cumulative = 0u32;
    for (index, pct) in percentages.iter().enumerate() {
        cumulative += *pct as u32 * (BUCKET_SPACE / 100);
        if bucket < cumulative {
            return index;
        }
    }
    percentages.len().saturating_sub(1)
}
