//! Statistical primitives for accuracy metrics.
//!
//! Provides sample moments and Student-t confidence intervals used to
//! qualify MAE and bias estimates.

use crate::records::Interval;

/// Two-sided 95% Student-t critical values for df = 1..=30.
const T_TABLE_95: [f64; 30] = [
    12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160,
    2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056,
    2.052, 2.048, 2.045, 2.042,
];

/// Standard normal quantile for a two-sided 95% interval.
pub const Z_95: f64 = 1.959_964;

/// Two-sided 95% critical value of Student's t distribution.
///
/// Tabulated for `df <= 30`; above that the Cornish-Fisher expansion
/// `z + (z^3 + z)/(4 df) + (5z^5 + 16z^3 + 3z)/(96 df^2)` is used, which
/// converges to the normal 1.96.
///
/// # Examples
/// ```
/// use forecast_verify_core::statistics::t_critical_95;
///
/// assert!((t_critical_95(10) - 2.228).abs() < 1e-9);
/// assert!((t_critical_95(10_000) - 1.96).abs() < 1e-3);
/// ```
#[must_use]
pub fn t_critical_95(df: usize) -> f64 {
    if df == 0 {
        return f64::INFINITY;
    }
    if df <= T_TABLE_95.len() {
        return T_TABLE_95[df - 1];
    }

    let z = Z_95;
    let z3 = z.powi(3);
    let z5 = z.powi(5);
    let n = df as f64;
    z + (z3 + z) / (4.0 * n) + (5.0 * z5 + 16.0 * z3 + 3.0 * z) / (96.0 * n * n)
}

/// Arithmetic mean, `None` for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Unbiased sample variance, `None` for fewer than two values.
#[must_use]
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(sum_sq / (values.len() - 1) as f64)
}

/// 95% confidence interval around the mean of `values`.
///
/// Returns `None` when fewer than two values are available. Zero variance
/// yields a zero-width interval at the mean.
///
/// # Examples
/// ```
/// use forecast_verify_core::statistics::mean_interval_95;
///
/// assert!(mean_interval_95(&[3.0]).is_none());
/// let ci = mean_interval_95(&[2.0, 2.0, 2.0]).unwrap();
/// assert_eq!(ci.lower, 2.0);
/// assert_eq!(ci.upper, 2.0);
/// ```
#[must_use]
pub fn mean_interval_95(values: &[f64]) -> Option<Interval> {
    let m = mean(values)?;
    let variance = sample_variance(values)?;
    if variance <= f64::EPSILON {
        return Some(Interval { lower: m, upper: m });
    }

    let n = values.len();
    let half_width = t_critical_95(n - 1) * (variance / n as f64).sqrt();
    Some(Interval {
        lower: m - half_width,
        upper: m + half_width,
    })
}

/// Root mean square of `values`, `None` for an empty slice.
#[must_use]
pub fn root_mean_square(values: &[f64]) -> Option<f64> {
    let squares: Vec<f64> = values.iter().map(|v| v * v).collect();
    mean(&squares).map(f64::sqrt)
}
