//! Small descriptive statistics used by the detector.
//!
//! All functions are total: empty or degenerate input yields `None` (or 0)
//! instead of NaN.

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population variance.
pub fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some(sum_sq / values.len() as f64)
}

/// Median; sorts a copy of the input.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Most points [`theil_sen_slope`] pairs up. Work and memory are quadratic
/// in this (about 131k slopes, 1 MiB), independent of the window size.
pub const THEIL_SEN_MAX_POINTS: usize = 512;

/// Theil–Sen slope estimate: the median of pairwise slopes.
///
/// Longer inputs are thinned to [`THEIL_SEN_MAX_POINTS`] evenly strided
/// points (first and last always kept) before pairing. Pairs sharing an x
/// coordinate are skipped. Returns `None` when no pair has distinct x
/// values.
pub fn theil_sen_slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    let picked = strided_indices(n, THEIL_SEN_MAX_POINTS);
    let m = picked.len();
    let mut slopes = Vec::with_capacity(m * m.saturating_sub(1) / 2);
    for (a, &i) in picked.iter().enumerate() {
        for &j in &picked[a + 1..] {
            let dx = xs[j] - xs[i];
            if dx != 0.0 {
                slopes.push((ys[j] - ys[i]) / dx);
            }
        }
    }
    median(&slopes)
}

/// At most `max` indices spread evenly over `0..n`, ends included.
fn strided_indices(n: usize, max: usize) -> Vec<usize> {
    if n <= max {
        return (0..n).collect();
    }
    let max = max.max(2);
    (0..max).map(|k| k * (n - 1) / (max - 1)).collect()
}

/// Mean of `|x[i+1] - x[i]| / |x[i+1]|` over consecutive pairs.
///
/// Pairs whose denominator is zero are skipped. Returns `None` when no pair
/// contributes.
pub fn mean_abs_relative_change(values: &[f64]) -> Option<f64> {
    let changes: Vec<f64> = values
        .windows(2)
        .filter(|w| w[1] != 0.0)
        .map(|w| ((w[1] - w[0]) / w[1]).abs())
        .collect();
    mean(&changes)
}
