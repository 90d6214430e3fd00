//! Bloom filters backing `BF.RESERVE` / `BF.ADD` / `BF.EXISTS`
//!
//! `BloomFilter` is a fixed-size filter sized from (capacity, error rate).
//! `ScalableBloomFilter` stacks filters: once the newest layer holds its capacity, a new
//! layer is added with double the capacity and half the error rate, so the compound
//! false-positive rate stays bounded as the set grows.

use ahash::RandomState;
use std::f64::consts::LN_2;

/// Fixed seeds so a filter built in one process answers the same in the next
const SEEDS_A: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];
const SEEDS_B: [u64; 4] = [
    0x4528_21e6_38d0_1377,
    0xbe54_66cf_34e9_0c6c,
    0xc0ac_29b7_c97c_50dd,
    0x3f84_d5b5_b547_0917,
];

/// Layer growth factor for scalable filters
const EXPANSION: u64 = 2;
/// Error-rate tightening per added layer
const TIGHTENING: f64 = 0.5;

#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: u64,
    items: u64,
    error_rate: f64,
    hash_a: RandomState,
    hash_b: RandomState,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("capacity", &self.capacity)
            .field("items", &self.items)
            .field("error_rate", &self.error_rate)
            .finish()
    }
}

impl BloomFilter {
    /// Size a filter for `capacity` items at `error_rate` false positives.
    ///
    /// m = -n ln p / (ln 2)^2, k = (m / n) ln 2
    pub fn with_rate(capacity: u64, error_rate: f64) -> Self {
        debug_assert!(error_rate > 0.0 && error_rate < 1.0);
        let n = capacity.max(1) as f64;
        let m = (-(n * error_rate.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * LN_2).round().max(1.0) as u32;
        let words = m.div_ceil(64) as usize;

        BloomFilter {
            bits: vec![0; words],
            num_bits: m,
            num_hashes: k,
            capacity: capacity.max(1),
            items: 0,
            error_rate,
            hash_a: RandomState::with_seeds(SEEDS_A[0], SEEDS_A[1], SEEDS_A[2], SEEDS_A[3]),
            hash_b: RandomState::with_seeds(SEEDS_B[0], SEEDS_B[1], SEEDS_B[2], SEEDS_B[3]),
        }
    }

    /// Double hashing: index_i = h1 + i * h2 (mod m)
    fn bit_indexes(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let h1 = self.hash_a.hash_one(item);
        let h2 = self.hash_b.hash_one(item) | 1;
        let m = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    fn test_bit(&self, index: u64) -> bool {
        self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Insert an item. Returns true if any bit flipped, i.e. the item was surely absent.
    pub fn insert(&mut self, item: &[u8]) -> bool {
        let indexes: Vec<u64> = self.bit_indexes(item).collect();
        let mut flipped = false;
        for index in indexes {
            let word = &mut self.bits[(index / 64) as usize];
            let mask = 1 << (index % 64);
            if *word & mask == 0 {
                *word |= mask;
                flipped = true;
            }
        }
        if flipped {
            self.items += 1;
        }
        flipped
    }

    /// False positives possible, false negatives never.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_indexes(item).all(|index| self.test_bit(index))
    }

    pub fn len(&self) -> u64 {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items >= self.capacity
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// Layered filter that grows instead of degrading past its capacity
#[derive(Clone, Debug)]
pub struct ScalableBloomFilter {
    layers: Vec<BloomFilter>,
}

impl ScalableBloomFilter {
    pub fn new(capacity: u64, error_rate: f64) -> Self {
        ScalableBloomFilter {
            layers: vec![BloomFilter::with_rate(capacity, error_rate)],
        }
    }

    /// Returns true when the item was added (was not possibly present).
    pub fn insert(&mut self, item: &[u8]) -> bool {
        if self.contains(item) {
            return false;
        }

        let needs_layer = self.layers.last().map_or(true, BloomFilter::is_full);
        if needs_layer {
            let next = match self.layers.last() {
                Some(last) => BloomFilter::with_rate(
                    last.capacity().saturating_mul(EXPANSION),
                    last.error_rate() * TIGHTENING,
                ),
                None => BloomFilter::with_rate(1, 0.01),
            };
            self.layers.push(next);
        }

        match self.layers.last_mut() {
            Some(layer) => {
                layer.insert(item);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.layers.iter().any(|layer| layer.contains(item))
    }

    /// Items added across all layers
    pub fn len(&self) -> u64 {
        self.layers.iter().map(BloomFilter::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layers(&self) -> usize {
        self.layers.len()
    }

    pub fn capacity(&self) -> u64 {
        self.layers.iter().map(BloomFilter::capacity).sum()
    }
}
