//! Serial-dependence tests on a block-level series.
//!
//! The series is normally the subject hit rate of each valid block in run
//! order. Every function here is a pure reduction and returns `None` when the
//! series is too short for the statistic to mean anything.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use trialstream_core::analysis::{autocorrelation, mean, sample_variance, two_sided_p};

/// |t| above this is flagged as significant (two-sided 5%).
pub const T_CRITICAL: f64 = 1.96;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Autocorrelation at one lag, tested against zero.
#[derive(Debug, Clone, Serialize)]
pub struct LagAutocorrelation {
    pub lag: usize,
    pub r: f64,
    /// Pairs the coefficient was computed over.
    pub pairs: usize,
    /// `r·sqrt((m-2)/(1-r²))` with `m` pairs.
    pub t: f64,
    pub significant: bool,
}

/// Wald–Wolfowitz runs test on a binarized series.
#[derive(Debug, Clone, Serialize)]
pub struct RunsTest {
    /// Points above the cut.
    pub above: usize,
    /// Points at or below the cut.
    pub below: usize,
    pub runs: usize,
    pub expected_runs: f64,
    pub variance: f64,
    pub z: f64,
    pub p: f64,
}

/// Local extrema count against the random-sequence expectation.
#[derive(Debug, Clone, Serialize)]
pub struct TurningPoints {
    pub peaks: usize,
    pub troughs: usize,
    pub count: usize,
    /// `(n - 2) · 0.5`.
    pub expected: f64,
    pub ratio: f64,
}

/// First half versus second half of the series, Welch's t-test.
#[derive(Debug, Clone, Serialize)]
pub struct HalvesComparison {
    pub first_mean: f64,
    pub second_mean: f64,
    pub first_len: usize,
    pub second_len: usize,
    pub t: f64,
    pub df: f64,
    pub p: f64,
}

// ---------------------------------------------------------------------------
// Autocorrelation
// ---------------------------------------------------------------------------

/// Autocorrelation at lags `1..=max_lag`, skipping lags that leave fewer
/// than three pairs.
pub fn lag_autocorrelations(xs: &[f64], max_lag: usize) -> Vec<LagAutocorrelation> {
    (1..=max_lag)
        .filter(|&lag| xs.len() >= lag + 3)
        .map(|lag| {
            let r = autocorrelation(xs, lag);
            let pairs = xs.len() - lag;
            let t = correlation_t(r, pairs);
            LagAutocorrelation {
                lag,
                r,
                pairs,
                t,
                significant: t.abs() > T_CRITICAL,
            }
        })
        .collect()
}

/// t-statistic of a correlation coefficient over `m` pairs.
pub fn correlation_t(r: f64, m: usize) -> f64 {
    if m < 3 {
        return 0.0;
    }
    let denom = 1.0 - r * r;
    if denom <= 0.0 {
        return if r > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
    }
    r * ((m as f64 - 2.0) / denom).sqrt()
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Runs test after cutting the series at `cut` (values above it map to 1).
///
/// `None` when either side of the cut is empty, since the run count then
/// has no variance.
pub fn runs_test(xs: &[f64], cut: f64) -> Option<RunsTest> {
    let signs: Vec<bool> = xs.iter().map(|&x| x > cut).collect();
    let above = signs.iter().filter(|&&s| s).count();
    let below = signs.len() - above;
    if above == 0 || below == 0 {
        return None;
    }
    let runs = 1 + signs.windows(2).filter(|w| w[0] != w[1]).count();

    let n1 = above as f64;
    let n2 = below as f64;
    let n = n1 + n2;
    let expected_runs = 2.0 * n1 * n2 / n + 1.0;
    let variance = 2.0 * n1 * n2 * (2.0 * n1 * n2 - n) / (n * n * (n - 1.0));
    let z = if variance > 0.0 {
        (runs as f64 - expected_runs) / variance.sqrt()
    } else {
        0.0
    };
    Some(RunsTest {
        above,
        below,
        runs,
        expected_runs,
        variance,
        z,
        p: two_sided_p(z),
    })
}

// ---------------------------------------------------------------------------
// Turning points
// ---------------------------------------------------------------------------

/// Count strict local maxima and minima. Ties are not turning points.
///
/// The `(n - 2) · 0.5` reference is a heuristic. The textbook expectation
/// for an i.i.d. series is `2(n - 2)/3`.
pub fn turning_points(xs: &[f64]) -> Option<TurningPoints> {
    if xs.len() < 3 {
        return None;
    }
    let mut peaks = 0;
    let mut troughs = 0;
    for w in xs.windows(3) {
        if w[1] > w[0] && w[1] > w[2] {
            peaks += 1;
        } else if w[1] < w[0] && w[1] < w[2] {
            troughs += 1;
        }
    }
    let count = peaks + troughs;
    let expected = (xs.len() - 2) as f64 * 0.5;
    Some(TurningPoints {
        peaks,
        troughs,
        count,
        expected,
        ratio: count as f64 / expected,
    })
}

// ---------------------------------------------------------------------------
// Halves
// ---------------------------------------------------------------------------

/// Compare the means of the two halves. The second half takes the extra
/// point of an odd-length series. Needs two points per half.
pub fn halves_comparison(xs: &[f64]) -> Option<HalvesComparison> {
    let mid = xs.len() / 2;
    let (first, second) = xs.split_at(mid);
    if first.len() < 2 || second.len() < 2 {
        return None;
    }
    let (m1, m2) = (mean(first), mean(second));
    let (n1, n2) = (first.len() as f64, second.len() as f64);
    let a = sample_variance(first) / n1;
    let b = sample_variance(second) / n2;
    let se2 = a + b;

    let (t, df, p) = if se2 <= 1e-20 {
        if (m1 - m2).abs() < f64::EPSILON {
            (0.0, n1 + n2 - 2.0, 1.0)
        } else {
            let t = (m1 - m2).signum() * f64::INFINITY;
            (t, n1 + n2 - 2.0, 0.0)
        }
    } else {
        let t = (m1 - m2) / se2.sqrt();
        // Welch–Satterthwaite; a zero-variance half contributes nothing.
        let mut denom = 0.0;
        if a > 0.0 {
            denom += a * a / (n1 - 1.0);
        }
        if b > 0.0 {
            denom += b * b / (n2 - 1.0);
        }
        let df = se2 * se2 / denom;
        (t, df, student_two_sided_p(t, df))
    };

    Some(HalvesComparison {
        first_mean: m1,
        second_mean: m2,
        first_len: first.len(),
        second_len: second.len(),
        t,
        df,
        p,
    })
}

/// Two-sided Student-t tail probability. Falls back to the normal tail if
/// the distribution cannot be built.
fn student_two_sided_p(t: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0),
        Err(e) => {
            log::debug!("student t with df={df} unavailable ({e}); using normal tail");
            two_sided_p(t)
        }
    }
}
