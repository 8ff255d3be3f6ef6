/// Descriptive statistics shared by the feature and regime code.

/// Arithmetic mean. Returns 0.0 for an empty slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (n - 1 denominator). Returns 0.0 below two points.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Mean over the values that are present, ignoring warm-up gaps.
/// Returns `None` when nothing is present.
pub fn mean_present(data: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = data.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(mean(&present))
    }
}
