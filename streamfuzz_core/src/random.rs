use rand::Rng;
use rand::distr::uniform::SampleUniform;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

/// A seedable source of random values shared by the mutation strategies.
///
/// Every range query is inclusive on both bounds. The source is owned by the
/// fuzzer and handed down explicitly; per-stream sources are derived with
/// [`RandomByteSource::fork`] so that a single iteration can be replayed from
/// its seed.
#[derive(Debug, Clone)]
pub struct RandomByteSource {
    rng: ChaCha8Rng,
}

impl RandomByteSource {
    /// Creates a deterministic source from a 64-bit seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Creates a source seeded once from the thread-local generator.
    pub fn from_entropy() -> Self {
        Self::from_seed(rand::rng().random())
    }

    /// Returns a value in `[from, to]`.
    ///
    /// When both bounds are equal the generator is not consulted at all.
    /// Reversed bounds are swapped instead of being treated as an empty range.
    pub fn next<T>(&mut self, from: T, to: T) -> T
    where
        T: SampleUniform + PartialOrd + Copy,
    {
        if from == to {
            return to;
        }
        let (low, high) = if from < to { (from, to) } else { (to, from) };
        self.rng.random_range(low..=high)
    }

    /// Returns `true` with the given probability. Values outside `(0, 1)` saturate.
    pub fn next_bool(&mut self, probability: f64) -> bool {
        if !(probability > 0.0) {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.random_bool(probability)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Overwrites `count` positions of `buffer` starting at `start` with successive
    /// values produced by `value`. The range is clamped to the end of the buffer.
    pub fn fill<T, F>(&mut self, buffer: &mut [T], start: usize, count: usize, mut value: F)
    where
        F: FnMut(&mut Self) -> T,
    {
        let end = start.saturating_add(count).min(buffer.len());
        if start >= end {
            return;
        }
        for slot in &mut buffer[start..end] {
            *slot = value(self);
        }
    }

    /// Draws a fresh seed and returns it together with a child source built from it.
    pub fn fork(&mut self) -> (u64, RandomByteSource) {
        let seed = self.rng.next_u64();
        (seed, Self::from_seed(seed))
    }
}

impl Default for RandomByteSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}
