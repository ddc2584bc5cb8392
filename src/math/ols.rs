//! Weighted least squares solvers.
//!
//! Every grid point solves a small linear regression problem of the form:
//!
//! ```text
//! minimize Σ w_i (y_i - x_i^T β)^2
//! ```
//!
//! Two solvers produce the same estimate:
//! - `wls_normal_equations` forms `XᵗWX` (p×p) and factors it with Cholesky.
//!   With a handful of design columns this is by far the cheapest route and
//!   is what the fast backend uses for every voxel.
//! - `wls_svd` scales rows by `sqrt(w_i)` and solves the ordinary least squares
//!   problem through an SVD. It is slower but does not square the condition
//!   number, which makes it the reference solution.
//!
//! Both return `None` when the weighted design is rank deficient or the
//! resulting statistics are not finite.

use nalgebra::{DMatrix, DVector};

/// Smallest accepted ratio of the smallest to the largest singular value of
/// `sqrt(W)X` (or diagonal entry of the Cholesky factor of `XᵗWX`). Both
/// solvers share it so they reject the same points.
const RANK_TOLERANCE: f64 = 1e-7;

/// Weighted least squares estimate with the usual inference quantities.
#[derive(Debug, Clone)]
pub struct WlsEstimate {
    pub params: DVector<f64>,
    pub stderr: DVector<f64>,
    pub tvalues: DVector<f64>,
    /// Unweighted residuals `y - Xβ`.
    pub residuals: DVector<f64>,
    /// `rᵗWr / df`.
    pub mse: f64,
    /// `n - p`.
    pub df: f64,
}

/// Goodness-of-fit diagnostics of a weighted fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WlsSummary {
    pub r_squared: f64,
    pub log_likelihood: f64,
    /// Kish effective sample size `(Σw)² / Σw²`.
    pub effective_n: f64,
}

/// Solve via Cholesky of the normal equations.
pub fn wls_normal_equations(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    w: &DVector<f64>,
) -> Option<WlsEstimate> {
    let (n, p) = x.shape();
    if n <= p || y.len() != n || w.len() != n {
        return None;
    }

    let mut xtwx = DMatrix::<f64>::zeros(p, p);
    let mut xtwy = DVector::<f64>::zeros(p);
    for i in 0..n {
        let wi = w[i];
        for a in 0..p {
            let xa = wi * x[(i, a)];
            xtwy[a] += xa * y[i];
            for b in 0..=a {
                xtwx[(a, b)] += xa * x[(i, b)];
            }
        }
    }
    for a in 0..p {
        for b in 0..a {
            xtwx[(b, a)] = xtwx[(a, b)];
        }
    }

    let chol = xtwx.cholesky()?;
    let diag = chol.l_dirty().diagonal();
    let d_max = diag.iter().cloned().fold(0.0_f64, f64::max);
    let d_min = diag.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(d_max > 0.0) || d_min <= d_max * RANK_TOLERANCE {
        return None;
    }
    let params = chol.solve(&xtwy);
    let cov_unscaled = chol.inverse();
    finish(x, y, w, params, &cov_unscaled)
}

/// Solve via SVD of the `sqrt(w)`-scaled design.
pub fn wls_svd(x: &DMatrix<f64>, y: &DVector<f64>, w: &DVector<f64>) -> Option<WlsEstimate> {
    let (n, p) = x.shape();
    if n <= p || y.len() != n || w.len() != n {
        return None;
    }

    let sw = w.map(f64::sqrt);
    let mut a = x.clone();
    for i in 0..n {
        for j in 0..p {
            a[(i, j)] *= sw[i];
        }
    }
    let b = y.component_mul(&sw);

    let svd = a.svd(true, true);
    let s_max = svd.singular_values.iter().cloned().fold(0.0_f64, f64::max);
    if !(s_max > 0.0) || svd.singular_values.iter().any(|s| *s <= s_max * RANK_TOLERANCE) {
        return None;
    }

    let params = svd.solve(&b, 0.0).ok()?;
    let v_t = svd.v_t.as_ref()?;

    // (AᵗA)⁻¹ = V Σ⁻² Vᵗ
    let mut cov_unscaled = DMatrix::<f64>::zeros(p, p);
    for (l, s) in svd.singular_values.iter().enumerate() {
        let inv_s2 = 1.0 / (s * s);
        for j in 0..p {
            for k in 0..p {
                cov_unscaled[(j, k)] += v_t[(l, j)] * v_t[(l, k)] * inv_s2;
            }
        }
    }

    finish(x, y, w, params, &cov_unscaled)
}

fn finish(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    w: &DVector<f64>,
    params: DVector<f64>,
    cov_unscaled: &DMatrix<f64>,
) -> Option<WlsEstimate> {
    let (n, p) = x.shape();
    let residuals = y - x * &params;
    let ssr: f64 = residuals
        .iter()
        .zip(w.iter())
        .map(|(r, wi)| wi * r * r)
        .sum();
    let df = (n - p) as f64;
    let mse = ssr / df;

    let stderr = DVector::from_iterator(p, (0..p).map(|j| (mse * cov_unscaled[(j, j)]).sqrt()));
    let tvalues = params.component_div(&stderr);

    let finite = params.iter().all(|v| v.is_finite())
        && stderr.iter().all(|v| v.is_finite())
        && mse.is_finite();
    if !finite {
        return None;
    }

    Some(WlsEstimate {
        params,
        stderr,
        tvalues,
        residuals,
        mse,
        df,
    })
}

/// Weighted R², Gaussian log-likelihood and effective sample size of `est`.
pub fn wls_summary(y: &DVector<f64>, w: &DVector<f64>, est: &WlsEstimate) -> WlsSummary {
    let n = y.len() as f64;
    let sum_w: f64 = w.iter().sum();
    let sum_w2: f64 = w.iter().map(|v| v * v).sum();
    let y_bar = y.iter().zip(w.iter()).map(|(yi, wi)| wi * yi).sum::<f64>() / sum_w;

    let sst: f64 = y
        .iter()
        .zip(w.iter())
        .map(|(yi, wi)| wi * (yi - y_bar).powi(2))
        .sum();
    let ssr = est.mse * est.df;
    let r_squared = if sst > 0.0 { 1.0 - ssr / sst } else { f64::NAN };

    let log_w: f64 = w.iter().map(|v| v.ln()).sum();
    let log_likelihood = -0.5 * n * ((2.0 * std::f64::consts::PI).ln() + (ssr / n).ln() + 1.0)
        + 0.5 * log_w;

    WlsSummary {
        r_squared,
        log_likelihood,
        effective_n: if sum_w2 > 0.0 { sum_w * sum_w / sum_w2 } else { 0.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_problem() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        // y = 2 + 3x with a small deterministic wiggle.
        let n = 12;
        let mut x = DMatrix::<f64>::zeros(n, 2);
        let mut y = DVector::<f64>::zeros(n);
        let mut w = DVector::<f64>::zeros(n);
        for i in 0..n {
            let xi = i as f64 * 0.5;
            x[(i, 0)] = 1.0;
            x[(i, 1)] = xi;
            y[i] = 2.0 + 3.0 * xi + 0.01 * ((i % 3) as f64 - 1.0);
            w[i] = 1.0 / (1.0 + i as f64);
        }
        (x, y, w)
    }

    #[test]
    fn least_squares_solves_simple_system() {
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0, 11.0]);
        let w = DVector::from_element(4, 1.0);

        let est = wls_svd(&x, &y, &w).unwrap();
        assert!((est.params[0] - 2.0).abs() < 1e-10);
        assert!((est.params[1] - 3.0).abs() < 1e-10);
        assert_eq!(est.df, 2.0);
    }

    #[test]
    fn solvers_agree() {
        let (x, y, w) = line_problem();
        let a = wls_normal_equations(&x, &y, &w).unwrap();
        let b = wls_svd(&x, &y, &w).unwrap();
        for j in 0..2 {
            assert!((a.params[j] - b.params[j]).abs() < 1e-10);
            assert!((a.stderr[j] - b.stderr[j]).abs() < 1e-10 * b.stderr[j].abs().max(1.0));
        }
        assert!((a.mse - b.mse).abs() < 1e-12);
    }

    #[test]
    fn singular_design_is_rejected() {
        let n = 6;
        let mut x = DMatrix::<f64>::zeros(n, 2);
        for i in 0..n {
            x[(i, 0)] = 1.0;
            x[(i, 1)] = 2.0;
        }
        let y = DVector::from_element(n, 1.0);
        let w = DVector::from_element(n, 1.0);
        assert!(wls_svd(&x, &y, &w).is_none());
        assert!(wls_normal_equations(&x, &y, &w).is_none());
    }

    #[test]
    fn too_few_rows_is_rejected() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 1.0]);
        let y = DVector::from_row_slice(&[1.0, 2.0]);
        let w = DVector::from_element(2, 1.0);
        assert!(wls_normal_equations(&x, &y, &w).is_none());
    }

    #[test]
    fn summary_reports_good_fit() {
        let (x, y, w) = line_problem();
        let est = wls_svd(&x, &y, &w).unwrap();
        let summary = wls_summary(&y, &w, &est);
        assert!(summary.r_squared > 0.999);
        assert!(summary.log_likelihood.is_finite());
        assert!(summary.effective_n > 1.0 && summary.effective_n < 12.0);
    }
}
