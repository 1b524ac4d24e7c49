//! Seedable pseudo-random number generation for tree sampling.
//!
//! Every sampling entry point in this crate takes an explicit `&mut
//! Xorshift64` rather than drawing from ambient state, so concurrent workers
//! can own independent streams and runs are reproducible from their seeds.

/// Simple xorshift64 pseudo-random number generator.
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        // Ensure state is never zero (xorshift requires nonzero state).
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Derive an independent generator for worker `k`.
    ///
    /// The seed is scrambled through a splitmix64 round so that consecutive
    /// worker indices do not produce correlated streams.
    pub fn split(&self, k: u64) -> Self {
        let mut z = self
            .state
            .wrapping_add(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(k.wrapping_add(1)));
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        Self::new(z ^ (z >> 31))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform draw in `[lo, hi]`.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Uniform index draw in `[0, n)`.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn index(&mut self, n: usize) -> usize {
        assert!(n > 0, "index draw from empty range");
        (self.next_u64() as usize) % n
    }

    /// Exponential waiting time with the given rate.
    pub fn exponential(&mut self, rate: f64) -> f64 {
        let u = self.next_f64();
        // Guard against u == 1 (ln(0) = -inf after the flip below).
        let u_safe = if u > 1.0 - 1e-16 { 1.0 - 1e-16 } else { u };
        -(1.0 - u_safe).ln() / rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_seed_is_usable() {
        let mut rng = Xorshift64::new(0);
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = Xorshift64::new(42);
        let mut b = Xorshift64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn next_f64_in_unit_interval() {
        let mut rng = Xorshift64::new(7);
        for _ in 0..1000 {
            let u = rng.next_f64();
            assert!((0.0..1.0).contains(&u), "u = {}", u);
        }
    }

    #[test]
    fn index_in_range() {
        let mut rng = Xorshift64::new(13);
        for _ in 0..1000 {
            assert!(rng.index(7) < 7);
        }
    }

    #[test]
    fn split_streams_differ() {
        let root = Xorshift64::new(99);
        let mut a = root.split(0);
        let mut b = root.split(1);
        let xs: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn split_is_deterministic() {
        let root = Xorshift64::new(99);
        let mut a = root.split(3);
        let mut b = root.split(3);
        for _ in 0..20 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn exponential_mean_close_to_inverse_rate() {
        let mut rng = Xorshift64::new(2024);
        let rate = 2.0;
        let n = 20000;
        let mean: f64 = (0..n).map(|_| rng.exponential(rate)).sum::<f64>() / n as f64;
        assert!(
            (mean - 0.5).abs() < 0.02,
            "mean {} too far from 1/rate = 0.5",
            mean
        );
    }
}
