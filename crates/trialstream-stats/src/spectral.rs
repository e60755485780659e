//! Exploratory periodicity diagnostics.
//!
//! A periodogram over the mean-removed series and a damped-oscillator fit on
//! the autocorrelation peaks. Both are heuristics: the 2× mean-power peak
//! rule and the peak picking are not calibrated tests and their output is
//! for inspection only.

use rustfft::{FftPlanner, num_complex::Complex};
use serde::Serialize;
use trialstream_core::analysis::{autocorrelation, mean};

/// Shortest series a periodogram is computed for.
pub const MIN_SPECTRAL_LEN: usize = 8;

/// A bin counts as a peak above this multiple of the mean power.
pub const PEAK_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Serialize)]
pub struct SpectralPeak {
    pub bin: usize,
    /// Cycles per sample, in (0, 0.5].
    pub frequency: f64,
    /// Samples per cycle.
    pub period: f64,
    pub power: f64,
    /// Power relative to the mean over all bins.
    pub relative_power: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpectralReport {
    pub len: usize,
    pub mean_power: f64,
    /// Wiener entropy: 1.0 = white, toward 0.0 = tonal.
    pub flatness: f64,
    pub dominant: Option<SpectralPeak>,
    /// Local maxima above `PEAK_FACTOR` × mean power, strongest first.
    pub peaks: Vec<SpectralPeak>,
}

/// Exponentially decaying oscillation fitted to autocorrelation peaks:
/// `acf(lag) ≈ amplitude · exp(-decay_rate · lag)`.
#[derive(Debug, Clone, Serialize)]
pub struct DampedFit {
    pub peak_lags: Vec<usize>,
    pub amplitude: f64,
    pub decay_rate: f64,
    /// Mean spacing between peaks, in samples.
    pub period: f64,
    pub r_squared: f64,
}

/// Power at bins `1..=n/2`, `|X_k|² / n`, over the mean-removed series.
pub fn periodogram(xs: &[f64]) -> Vec<f64> {
    let n = xs.len();
    if n < 2 {
        return Vec::new();
    }
    let m = mean(xs);
    let mut buf: Vec<Complex<f64>> = xs.iter().map(|&x| Complex::new(x - m, 0.0)).collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buf);
    buf[1..=n / 2]
        .iter()
        .map(|c| c.norm_sqr() / n as f64)
        .collect()
}

pub fn spectral_peaks(xs: &[f64]) -> Option<SpectralReport> {
    let n = xs.len();
    if n < MIN_SPECTRAL_LEN {
        return None;
    }
    let power = periodogram(xs);
    let mean_power = mean(&power);

    let peak_at = |i: usize| SpectralPeak {
        bin: i + 1,
        frequency: (i + 1) as f64 / n as f64,
        period: n as f64 / (i + 1) as f64,
        power: power[i],
        relative_power: if mean_power > 0.0 {
            power[i] / mean_power
        } else {
            0.0
        },
    };

    let dominant = (mean_power > 0.0)
        .then(|| {
            power
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| peak_at(i))
        })
        .flatten();

    let mut peaks: Vec<SpectralPeak> = (0..power.len())
        .filter(|&i| {
            let left = i == 0 || power[i] > power[i - 1];
            let right = i + 1 == power.len() || power[i] >= power[i + 1];
            left && right && power[i] > PEAK_FACTOR * mean_power
        })
        .map(peak_at)
        .collect();
    peaks.sort_by(|a, b| b.power.total_cmp(&a.power));

    Some(SpectralReport {
        len: n,
        mean_power,
        flatness: flatness(&power),
        dominant,
        peaks,
    })
}

/// Geometric over arithmetic mean of the power spectrum.
fn flatness(power: &[f64]) -> f64 {
    let arith = mean(power);
    if arith <= 1e-20 {
        return 0.0;
    }
    let log_mean = power
        .iter()
        .map(|&p| if p > 1e-20 { p.ln() } else { -46.0 })
        .sum::<f64>()
        / power.len() as f64;
    (log_mean.exp() / arith).clamp(0.0, 1.0)
}

/// Fit `ln acf = a - γ·lag` over the positive local maxima of the
/// autocorrelation at lags `1..=n/2`. Needs at least two peaks.
pub fn damped_fit(xs: &[f64]) -> Option<DampedFit> {
    let max_lag = xs.len() / 2;
    if max_lag < 3 {
        return None;
    }
    let acf: Vec<f64> = (0..=max_lag).map(|lag| autocorrelation(xs, lag)).collect();
    let peak_lags: Vec<usize> = (2..max_lag)
        .filter(|&l| acf[l] > 0.0 && acf[l] > acf[l - 1] && acf[l] >= acf[l + 1])
        .collect();
    if peak_lags.len() < 2 {
        return None;
    }

    let lx: Vec<f64> = peak_lags.iter().map(|&l| l as f64).collect();
    let ly: Vec<f64> = peak_lags.iter().map(|&l| acf[l].ln()).collect();
    let (intercept, slope, r_squared) = linear_fit(&lx, &ly);
    let period = (peak_lags[peak_lags.len() - 1] - peak_lags[0]) as f64
        / (peak_lags.len() - 1) as f64;

    Some(DampedFit {
        peak_lags,
        amplitude: intercept.exp(),
        decay_rate: -slope,
        period,
        r_squared,
    })
}

/// Ordinary least squares `y = a + b·x`. Returns `(a, b, r²)`.
fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64, f64) {
    let mx = mean(x);
    let my = mean(y);
    let sxx: f64 = x.iter().map(|v| (v - mx).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let syy: f64 = y.iter().map(|v| (v - my).powi(2)).sum();
    if sxx <= 0.0 {
        return (my, 0.0, 0.0);
    }
    let slope = sxy / sxx;
    let r_squared = if syy > 0.0 {
        (sxy * sxy / (sxx * syy)).clamp(0.0, 1.0)
    } else {
        1.0
    };
    (my - slope * mx, slope, r_squared)
}
