//! Cross-channel independence.
//!
//! Subject and control channels draw from the same stream, so any
//! correlation between them at zero or small lags points at the source or
//! the draw policy rather than at the experiment.

use serde::Serialize;
use trialstream_core::analysis::{pearson, to_signed};
use trialstream_core::{Block, Channel};

/// Lags examined on each side of zero.
pub const MAX_CROSS_LAG: usize = 3;

/// Correlation of channel `b` shifted by `lag` trials against channel `a`.
/// Positive lags pair `a[i]` with `b[i + lag]`.
#[derive(Debug, Clone, Serialize)]
pub struct LaggedCorrelation {
    pub lag: i64,
    pub r: f64,
    pub pairs: usize,
    /// `2 / sqrt(pairs)`.
    pub threshold: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossChannel {
    pub a: Channel,
    pub b: Channel,
    pub trials: usize,
    pub lags: Vec<LaggedCorrelation>,
    /// Correlation of the two channels' per-block hit rates.
    pub block_hit_rate_r: Option<f64>,
    /// No lag crossed its threshold.
    pub independent: bool,
}

/// Lagged Pearson correlation for every lag in `-max_lag..=max_lag` that
/// leaves at least three pairs.
pub fn cross_correlation(a: &[f64], b: &[f64], max_lag: usize) -> Vec<LaggedCorrelation> {
    let n = a.len().min(b.len());
    let max_lag = max_lag as i64;
    (-max_lag..=max_lag)
        .filter_map(|lag| {
            let shift = lag.unsigned_abs() as usize;
            if n < shift + 3 {
                return None;
            }
            let (xs, ys) = if lag >= 0 {
                (&a[..n - shift], &b[shift..n])
            } else {
                (&a[shift..n], &b[..n - shift])
            };
            let r = pearson(xs, ys);
            let pairs = n - shift;
            let threshold = 2.0 / (pairs as f64).sqrt();
            Some(LaggedCorrelation {
                lag,
                r,
                pairs,
                threshold,
                significant: r.abs() > threshold,
            })
        })
        .collect()
}

/// Compare two channels over every block that carries both.
///
/// Hit sequences are concatenated in block order and mapped to ±1. `None`
/// when no block carries both channels.
pub fn compare_channels(blocks: &[&Block], a: Channel, b: Channel) -> Option<CrossChannel> {
    let shared: Vec<&Block> = blocks
        .iter()
        .copied()
        .filter(|blk| blk.channel(a).is_some() && blk.channel(b).is_some())
        .collect();
    if shared.is_empty() {
        return None;
    }

    let hits = |channel: Channel| -> Vec<u8> {
        shared
            .iter()
            .flat_map(|blk| &blk.trials)
            .filter_map(|t| t.hit(channel))
            .map(u8::from)
            .collect()
    };
    let xs = to_signed(&hits(a));
    let ys = to_signed(&hits(b));
    let lags = cross_correlation(&xs, &ys, MAX_CROSS_LAG);

    let rates = |channel: Channel| -> Vec<f64> {
        shared
            .iter()
            .filter_map(|blk| blk.channel(channel))
            .map(|s| s.hit_rate)
            .collect()
    };
    let block_hit_rate_r = (shared.len() >= 3).then(|| pearson(&rates(a), &rates(b)));

    Some(CrossChannel {
        a,
        b,
        trials: xs.len().min(ys.len()),
        independent: lags.iter().all(|l| !l.significant),
        lags,
        block_hit_rate_r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_signed(n: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                if (state >> 33) & 1 == 1 { 1.0 } else { -1.0 }
            })
            .collect()
    }

    #[test]
    fn test_independent_sequences() {
        let a = lcg_signed(4000, 11);
        let b = lcg_signed(4000, 0xcafebabe12345678);
        let lags = cross_correlation(&a, &b, 3);
        assert_eq!(lags.len(), 7);
        assert_eq!(lags[3].lag, 0);
        assert!(lags.iter().all(|l| l.r.abs() < 0.1));
    }

    #[test]
    fn test_shifted_copy_peaks_at_its_lag() {
        let a = lcg_signed(500, 3);
        // b[i + 2] == a[i]
        let mut b = vec![1.0, -1.0];
        b.extend_from_slice(&a[..498]);
        let lags = cross_correlation(&a, &b, 3);
        let best = lags
            .iter()
            .max_by(|x, y| x.r.total_cmp(&y.r))
            .unwrap();
        assert_eq!(best.lag, 2);
        assert!((best.r - 1.0).abs() < 1e-9);
        assert!(best.significant);
        assert_eq!(best.pairs, 498);
    }

    #[test]
    fn test_negative_lag_direction() {
        let b = lcg_signed(300, 9);
        // a[i + 1] == b[i]
        let mut a = vec![1.0];
        a.extend_from_slice(&b[..299]);
        let lags = cross_correlation(&a, &b, 1);
        let neg = lags.iter().find(|l| l.lag == -1).unwrap();
        assert!((neg.r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_series_skips_lags() {
        let a = lcg_signed(4, 1);
        let lags = cross_correlation(&a, &a, 3);
        assert_eq!(lags.iter().map(|l| l.lag).collect::<Vec<_>>(), vec![-1, 0, 1]);
    }
}
