//! Bloom filter over the `(field, term)` pairs of a segment.

use bit_vec::BitVec;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash functions per key.
pub const HASH_COUNT: u32 = 3;

/// Bits reserved per distinct key; about 3% false positives with k = 3.
const BITS_PER_KEY: usize = 8;

const MIN_BITS: usize = 64;

/// Probabilistic set of `(field, term)` keys.
///
/// Built once and read-only afterwards. `might_contain` never returns
/// `false` for a key that was inserted.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec,
    len: usize,
}

impl BloomFilter {
    /// An empty filter sized for `expected_keys`.
    pub fn with_capacity(expected_keys: usize) -> Self {
        let size = expected_keys
            .saturating_mul(BITS_PER_KEY)
            .max(MIN_BITS);
        Self {
            bits: BitVec::from_elem(size, false),
            len: 0,
        }
    }

    /// Build from an iterator of `(field, term)` pairs.
    pub fn from_keys<'a, I>(keys: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let keys: Vec<(&str, &str)> = keys.into_iter().collect();
        let mut filter = Self::with_capacity(keys.len());
        for (field, term) in keys {
            filter.insert(field, term);
        }
        filter
    }

    pub fn insert(&mut self, field: &str, term: &str) {
        let size = self.bits.len();
        for seed in 0..HASH_COUNT {
            self.bits.set(slot(field, term, seed, size), true);
        }
        self.len += 1;
    }

    pub fn might_contain(&self, field: &str, term: &str) -> bool {
        let size = self.bits.len();
        (0..HASH_COUNT)
            .all(|seed| self.bits.get(slot(field, term, seed, size)) == Some(true))
    }

    /// Number of keys inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }
}

fn slot(field: &str, term: &str, seed: u32, size: usize) -> usize {
    let mut key = Vec::with_capacity(field.len() + term.len() + 1);
    key.extend_from_slice(field.as_bytes());
    key.push(0);
    key.extend_from_slice(term.as_bytes());
    (xxh3_64_with_seed(&key, u64::from(seed)) % size as u64) as usize
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn inserted_keys_are_found() {
        let filter = BloomFilter::from_keys([
            ("body", "webhook"),
            ("title", "oauth"),
        ]);
        assert!(filter.might_contain("body", "webhook"));
        assert!(filter.might_contain("title", "oauth"));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn field_is_part_of_the_key() {
        // "ab" + "c" and "a" + "bc" must hash differently.
        let filter = BloomFilter::from_keys([("ab", "c")]);
        let hits = (0..HASH_COUNT)
            .filter(|&seed| {
                slot("ab", "c", seed, filter.bit_len())
                    == slot("a", "bc", seed, filter.bit_len())
            })
            .count();
        assert!(hits < HASH_COUNT as usize);
    }

    #[test]
    fn false_positive_rate_is_low() {
        let words: Vec<String> = (0..1_000).map(|i| format!("term{i}")).collect();
        let filter =
            BloomFilter::from_keys(words.iter().map(|w| ("body", w.as_str())));
        let false_positives = (0..10_000)
            .filter(|i| filter.might_contain("body", &format!("absent{i}")))
            .count();
        assert!(false_positives < 1_000, "{false_positives}");
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::with_capacity(0);
        assert!(filter.is_empty());
        assert!(!filter.might_contain("body", "anything"));
    }

    proptest! {
        #[test]
        fn no_false_negatives(
            keys in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9_]{1,12}"), 0..200)
        ) {
            let filter = BloomFilter::from_keys(
                keys.iter().map(|(f, t)| (f.as_str(), t.as_str())),
            );
            for (field, term) in &keys {
                prop_assert!(filter.might_contain(field, term));
            }
        }
    }
}
