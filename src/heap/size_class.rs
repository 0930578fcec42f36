//! Size classification for the shared free lists.
//!
//! Buckets are power-of-two spaced: bucket `k` keeps chunks of
//! `[2 << k, 4 << k)` words. Pushes use the floor bucket of the chunk size,
//! pops start at the ceiling class of the request, so a pop never touches a
//! bucket that could hand back a chunk smaller than asked for.

/// Upper bound on the bucket array; the live count is derived from the region
/// size at heap creation.
pub const MAX_CLASSES: usize = 48;

/// A free chunk needs room for its size word and its next link.
pub const MIN_CHUNK_WORDS: u64 = 2;

/// Smallest bucket whose minimum size covers `words`.
#[inline(always)]
pub fn class_of(words: u64) -> usize {
    let w = words.max(MIN_CHUNK_WORDS).next_power_of_two();
    (w.trailing_zeros() - 1) as usize
}

/// Bucket a chunk of `words` belongs to when pushed.
#[inline(always)]
pub fn bucket_of(words: u64) -> usize {
    debug_assert!(words >= MIN_CHUNK_WORDS);
    (63 - words.leading_zeros() as u64 - 1) as usize
}

/// Lower bound of the sizes bucket `index` holds.
#[inline(always)]
pub const fn index_to_min_size(index: usize) -> u64 {
    MIN_CHUNK_WORDS << index
}

/// Number of live buckets for a heap whose largest free chunk is one region.
#[inline]
pub fn class_count_for(region_words: u64) -> usize {
    (bucket_of(region_words) + 1).min(MAX_CLASSES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_of_never_undershoots() {
        for words in 1..=8192u64 {
            let k = class_of(words);
            assert!(
                index_to_min_size(k) >= words.max(MIN_CHUNK_WORDS),
                "class {} min {} < request {}",
                k,
                index_to_min_size(k),
                words
            );
            if k > 0 {
                assert!(index_to_min_size(k - 1) < words.max(MIN_CHUNK_WORDS));
            }
        }
    }

    #[test]
    fn bucket_of_brackets_the_size() {
        for words in MIN_CHUNK_WORDS..=8192 {
            let k = bucket_of(words);
            assert!(index_to_min_size(k) <= words);
            assert!(words < index_to_min_size(k + 1));
        }
    }

    #[test]
    fn push_pop_buckets_agree() {
        // Everything a bucket at or above class_of(n) holds satisfies n.
        for n in MIN_CHUNK_WORDS..=1024 {
            for chunk in MIN_CHUNK_WORDS..=4096 {
                if bucket_of(chunk) >= class_of(n) {
                    assert!(chunk >= n, "chunk {} in bucket {} for request {}", chunk, bucket_of(chunk), n);
                }
            }
        }
    }

    #[test]
    fn class_counts() {
        assert_eq!(class_count_for(2), 1);
        assert_eq!(class_count_for(16 * 1024), 14);
        assert!(class_count_for(u64::MAX / 2) <= MAX_CLASSES);
    }
}
