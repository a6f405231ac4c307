//! Event-id → partition routing.
//!
//! The hash is the JVM `String.hashCode` over UTF-16 code units, reduced with
//! `abs(h % n)`. Ids submitted through any existing JVM-side API therefore
//! land on the same partition here.

use crate::error::{Result, ShardqError};
use crate::types::PartitionId;

/// 32-bit polynomial string hash (`s[0]*31^(n-1) + ... + s[n-1]`, wrapping).
pub fn string_hash(id: &str) -> i32 {
    id.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Partition for `id`. Computed once at submission and never recomputed.
pub fn partition_for(id: &str, num_partitions: u32) -> Result<PartitionId> {
    if num_partitions == 0 {
        return Err(ShardqError::Config("num_partitions must be > 0".into()));
    }
    let n = num_partitions as i64;
    Ok((string_hash(id) as i64 % n).unsigned_abs() as PartitionId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_jvm_values() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("hello"), 99_162_322);
        // Overflowing input wraps exactly like the JVM.
        assert_eq!(string_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for i in 0..1_000 {
            let id = format!("event-{i}");
            let p = partition_for(&id, 6).unwrap();
            assert!(p < 6);
            assert_eq!(p, partition_for(&id, 6).unwrap());
        }
    }

    #[test]
    fn negative_hash_maps_to_positive_partition() {
        let h = string_hash("polygenelubricants");
        assert!(h < 0);
        assert_eq!(
            partition_for("polygenelubricants", 7).unwrap(),
            (h % 7).unsigned_abs()
        );
    }

    #[test]
    fn zero_partitions_is_an_error() {
        assert!(matches!(
            partition_for("event-1", 0),
            Err(ShardqError::Config(_))
        ));
    }
}
