//! Stable string hashing for partition and bucket assignment.
//!
//! The values produced here decide which partition a record is published to,
//! so they must never change between releases. `std`'s `DefaultHasher` makes no
//! such promise; this uses the classic 31-multiplier polynomial over UTF-16
//! code units with wrapping 32-bit arithmetic.

/// Hash a string to a signed 32-bit value.
pub fn hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |acc, unit| acc.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Map a key onto `[0, bucket_count)`.
///
/// # Panics
///
/// Panics if `bucket_count` is 0.
pub fn bucket_number(key: &str, bucket_count: u32) -> u32 {
    assert!(bucket_count > 0, "bucket count must be at least 1");
    i64::from(hash(key)).rem_euclid(i64::from(bucket_count)) as u32
}
