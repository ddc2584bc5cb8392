//! Durbin–Watson statistic for serial correlation in ordered residuals.

/// `Σ (e_t - e_{t-1})² / Σ e_t²`.
///
/// Values near 2 indicate no first-order autocorrelation. Returns NaN for
/// fewer than two residuals or an all-zero series.
pub fn durbin_watson(residuals: &[f64]) -> f64 {
    if residuals.len() < 2 {
        return f64::NAN;
    }
    let denom: f64 = residuals.iter().map(|e| e * e).sum();
    if denom <= 0.0 {
        return f64::NAN;
    }
    let num: f64 = residuals.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    num / denom
}
