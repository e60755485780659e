//! Block-level statistics on bit sequences.
//!
//! Binomial z/p scoring plus the coherence diagnostics computed on the
//! ±1-mapped sequence: cumulative range of the running sum, a rescaled-range
//! (Hurst) estimate and lag-k autocorrelation. These are shared with the
//! cross-session statistics crate.

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Normal approximation to a binomial test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinomialTest {
    pub hits: usize,
    pub trials: usize,
    pub p0: f64,
    pub z: f64,
    /// Two-sided p-value.
    pub p: f64,
}

impl BinomialTest {
    pub fn hit_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.hits as f64 / self.trials as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// `z = (k - n·p0) / sqrt(n·p0·(1 - p0))` with a two-sided normal p-value.
pub fn binomial_test(hits: usize, trials: usize, p0: f64) -> BinomialTest {
    let n = trials as f64;
    let k = hits as f64;
    let expected = n * p0;
    let variance = n * p0 * (1.0 - p0);
    let (z, p) = if trials == 0 {
        (0.0, 1.0)
    } else if variance <= 0.0 {
        // Degenerate null: any deviation is impossible under H0.
        if (k - expected).abs() < f64::EPSILON {
            (0.0, 1.0)
        } else {
            let z = if k > expected {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            };
            (z, 0.0)
        }
    } else {
        let z = (k - expected) / variance.sqrt();
        (z, two_sided_p(z))
    };
    BinomialTest {
        hits,
        trials,
        p0,
        z,
        p,
    }
}

/// Two-sided standard-normal tail probability.
pub fn two_sided_p(z: f64) -> f64 {
    if z.is_nan() {
        return 1.0;
    }
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Sequence helpers
// ---------------------------------------------------------------------------

/// Map 0/1 units to -1/+1 steps.
pub fn to_signed(bits: &[u8]) -> Vec<f64> {
    bits.iter()
        .map(|&b| if b == 1 { 1.0 } else { -1.0 })
        .collect()
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Population variance.
pub fn variance(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Unbiased sample variance (n - 1 denominator).
pub fn sample_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Autocorrelation at `lag` using the whole-series mean and variance.
///
/// Returns 0.0 for constant series or when the lag leaves no pairs.
pub fn autocorrelation(xs: &[f64], lag: usize) -> f64 {
    let n = xs.len();
    if lag == 0 || lag >= n {
        return 0.0;
    }
    let m = mean(xs);
    let var = variance(xs);
    if var < 1e-12 {
        return 0.0;
    }
    let count = n - lag;
    let sum: f64 = (0..count).map(|i| (xs[i] - m) * (xs[i + lag] - m)).sum();
    sum / (count as f64 * var)
}

/// Pearson correlation over the common prefix of two series.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let ma = mean(a);
    let mb = mean(b);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom < 1e-12 { 0.0 } else { cov / denom }
}

/// Range (max - min) of the running sum of `steps`, starting from 0.
pub fn cumulative_range(steps: &[f64]) -> f64 {
    let mut sum = 0.0f64;
    let mut lo = 0.0f64;
    let mut hi = 0.0f64;
    for &s in steps {
        sum += s;
        lo = lo.min(sum);
        hi = hi.max(sum);
    }
    hi - lo
}

/// Single-window rescaled-range Hurst estimate, `H = ln(R/S) / ln(n)`.
///
/// R is the range of cumulative deviations from the mean, S the population
/// standard deviation. Returns 0.5 (no memory) when the estimate is undefined:
/// fewer than 8 points or a constant series.
pub fn hurst_rs(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 8 {
        return 0.5;
    }
    let m = mean(xs);
    let s = variance(xs).sqrt();
    if s < 1e-12 {
        return 0.5;
    }
    let deviations: Vec<f64> = xs.iter().map(|x| x - m).collect();
    let r = cumulative_range(&deviations);
    if r <= 0.0 {
        return 0.5;
    }
    ((r / s).ln() / (n as f64).ln()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_bits(n: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) & 1) as u8
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Binomial scoring
    // -----------------------------------------------------------------------

    #[test]
    fn test_binomial_at_expectation() {
        let t = binomial_test(50, 100, 0.5);
        assert_eq!(t.z, 0.0);
        assert!((t.p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_binomial_two_sigma() {
        let t = binomial_test(60, 100, 0.5);
        assert!((t.z - 2.0).abs() < 0.01);
        assert!((t.p - 0.0455).abs() < 0.001);
    }

    #[test]
    fn test_binomial_symmetric() {
        let hi = binomial_test(60, 100, 0.5);
        let lo = binomial_test(40, 100, 0.5);
        assert!((hi.z + lo.z).abs() < 1e-12);
        assert!((hi.p - lo.p).abs() < 1e-12);
    }

    #[test]
    fn test_binomial_empty() {
        let t = binomial_test(0, 0, 0.5);
        assert_eq!(t.z, 0.0);
        assert_eq!(t.p, 1.0);
        assert_eq!(t.hit_rate(), 0.0);
    }

    #[test]
    fn test_binomial_degenerate_null() {
        assert_eq!(binomial_test(10, 10, 1.0).p, 1.0);
        let t = binomial_test(9, 10, 1.0);
        assert_eq!(t.p, 0.0);
        assert!(t.z.is_infinite() && t.z < 0.0);
    }

    // -----------------------------------------------------------------------
    // Coherence helpers
    // -----------------------------------------------------------------------

    #[test]
    fn test_to_signed() {
        assert_eq!(to_signed(&[1, 0, 1]), vec![1.0, -1.0, 1.0]);
    }

    #[test]
    fn test_cumulative_range() {
        // Running sum: 1, 2, 1, 0, -1, -2 → range from -2 to 2.
        let steps = to_signed(&[1, 1, 0, 0, 0, 0]);
        assert_eq!(cumulative_range(&steps), 4.0);
        assert_eq!(cumulative_range(&[]), 0.0);
    }

    #[test]
    fn test_autocorrelation_alternating() {
        let xs = to_signed(&[1, 0, 1, 0, 1, 0, 1, 0, 1, 0]);
        assert!(autocorrelation(&xs, 1) < -0.8);
        assert!(autocorrelation(&xs, 2) > 0.7);
    }

    #[test]
    fn test_autocorrelation_degenerate() {
        assert_eq!(autocorrelation(&[1.0; 10], 1), 0.0);
        assert_eq!(autocorrelation(&[1.0, -1.0], 5), 0.0);
        assert_eq!(autocorrelation(&[1.0, -1.0], 0), 0.0);
    }

    #[test]
    fn test_autocorrelation_random_is_small() {
        let xs = to_signed(&lcg_bits(10_000, 0xdeadbeef));
        assert!(autocorrelation(&xs, 1).abs() < 0.05);
    }

    #[test]
    fn test_pearson() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-12);
        let c = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&a, &c) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&a, &[1.0; 4]), 0.0);
    }

    #[test]
    fn test_hurst_trending_series_is_persistent() {
        let xs: Vec<f64> = (0..256).map(|i| i as f64).collect();
        assert!(hurst_rs(&xs) > 0.7);
    }

    #[test]
    fn test_hurst_random_is_moderate() {
        let xs = to_signed(&lcg_bits(4096, 0xcafe));
        let h = hurst_rs(&xs);
        assert!(h > 0.3 && h < 0.75, "H = {h}");
    }

    #[test]
    fn test_hurst_undefined_defaults() {
        assert_eq!(hurst_rs(&[1.0, -1.0]), 0.5);
        assert_eq!(hurst_rs(&[1.0; 20]), 0.5);
    }

    #[test]
    fn test_sample_variance() {
        assert_eq!(sample_variance(&[1.0]), 0.0);
        assert!((sample_variance(&[1.0, 3.0]) - 2.0).abs() < 1e-12);
        assert!((variance(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
