use xxhash_rust::xxh64::xxh64;

pub const BUCKET_COUNT: u64 = 100;

/// Bucket index in `[0, 100)` for a user of a flag.
///
/// Hashes `flag_key:user_id` with seed-independent xxHash64, so the index is the same
/// in every process and across restarts. The index only depends on the pair, never
/// on the configured percentage, which is what keeps rollouts monotonic.
pub fn bucket_index(flag_key: &str, user_id: &str) -> u8 {
    let mut data = Vec::with_capacity(flag_key.len() + user_id.len() + 1);
    data.extend_from_slice(flag_key.as_bytes());
    data.push(b':');
    data.extend_from_slice(user_id.as_bytes());

    (xxh64(&data, 0) % BUCKET_COUNT) as u8
}

/// Whether a user falls inside a percentage rollout.
///
/// Anonymous requests are never in a rollout: there is nothing to hash.
pub fn in_bucket(flag_key: &str, user_id: Option<&str>, percentage: u8) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };

    if percentage == 0 {
        return false;
    }
    if percentage >= 100 {
        return true;
    }

    bucket_index(flag_key, user_id) < percentage
}
