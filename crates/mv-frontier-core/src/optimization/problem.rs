use nalgebra::{DMatrix, DVector};

use crate::error::FrontierError;
use crate::FrontierResult;

/// Relative tolerance for the symmetry check on the covariance matrix.
const SYMMETRY_TOLERANCE: f64 = 1e-10;
/// Relative tolerance for negative eigenvalues of the covariance matrix.
const PSD_TOLERANCE: f64 = 1e-10;
/// Absolute slack on the budget feasibility test `Σ lower ≤ 1 ≤ Σ upper`.
pub(crate) const BUDGET_TOLERANCE: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A validated box-constrained mean-variance problem.
///
/// Weights are constrained by `lower[i] ≤ w[i] ≤ upper[i]` and the single
/// budget equality `Σ w = 1`. Construction fails fast on anything the
/// Critical Line Algorithm cannot work with, so a `Problem` in hand is always
/// well-posed.
#[derive(Debug, Clone)]
pub struct Problem {
    expected_returns: DVector<f64>,
    covariance: DMatrix<f64>,
    lower_bounds: DVector<f64>,
    upper_bounds: DVector<f64>,
}

impl Problem {
    pub fn new(
        expected_returns: Vec<f64>,
        covariance: DMatrix<f64>,
        lower_bounds: Vec<f64>,
        upper_bounds: Vec<f64>,
    ) -> FrontierResult<Self> {
        let n = expected_returns.len();
        if n == 0 {
            return Err(FrontierError::InvalidInput {
                field: "expected_returns".into(),
                reason: "At least one asset required".into(),
            });
        }

        validate_vector("expected_returns", &expected_returns, n)?;
        validate_vector("lower_bounds", &lower_bounds, n)?;
        validate_vector("upper_bounds", &upper_bounds, n)?;
        validate_covariance(&covariance, n)?;
        validate_bounds(&lower_bounds, &upper_bounds)?;

        Ok(Self {
            expected_returns: DVector::from_vec(expected_returns),
            covariance,
            lower_bounds: DVector::from_vec(lower_bounds),
            upper_bounds: DVector::from_vec(upper_bounds),
        })
    }

    /// Long-only problem: every weight in `[0, 1]`.
    pub fn long_only(expected_returns: Vec<f64>, covariance: DMatrix<f64>) -> FrontierResult<Self> {
        Self::with_uniform_bounds(expected_returns, covariance, 0.0, 1.0)
    }

    /// Same `[lower, upper]` box for every asset.
    pub fn with_uniform_bounds(
        expected_returns: Vec<f64>,
        covariance: DMatrix<f64>,
        lower: f64,
        upper: f64,
    ) -> FrontierResult<Self> {
        let n = expected_returns.len();
        Self::new(expected_returns, covariance, vec![lower; n], vec![upper; n])
    }

    /// Number of assets (decision variables).
    pub fn assets(&self) -> usize {
        self.expected_returns.len()
    }

    pub fn expected_returns(&self) -> &DVector<f64> {
        &self.expected_returns
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn lower_bounds(&self) -> &DVector<f64> {
        &self.lower_bounds
    }

    pub fn upper_bounds(&self) -> &DVector<f64> {
        &self.upper_bounds
    }

    /// An asset whose bounds coincide can never become free.
    pub fn is_fixed(&self, asset: usize) -> bool {
        self.upper_bounds[asset] - self.lower_bounds[asset] <= BUDGET_TOLERANCE
    }
}

/// Build a dense covariance matrix from row vectors, checking it is square.
pub fn covariance_from_rows(rows: &[Vec<f64>]) -> FrontierResult<DMatrix<f64>> {
    let n = rows.len();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != n {
            return Err(FrontierError::InvalidInput {
                field: "covariance_matrix".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
    }
    Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_vector(field: &str, values: &[f64], n: usize) -> FrontierResult<()> {
    if values.len() != n {
        return Err(FrontierError::InvalidInput {
            field: field.into(),
            reason: format!("Expected {} values but got {}", n, values.len()),
        });
    }
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
        return Err(FrontierError::InvalidInput {
            field: format!("{}[{}]", field, i),
            reason: "Value must be finite".into(),
        });
    }
    Ok(())
}

fn validate_covariance(cov: &DMatrix<f64>, n: usize) -> FrontierResult<()> {
    if cov.nrows() != n || cov.ncols() != n {
        return Err(FrontierError::InvalidInput {
            field: "covariance_matrix".into(),
            reason: format!(
                "Expected {}x{} matrix but got {}x{}",
                n,
                n,
                cov.nrows(),
                cov.ncols()
            ),
        });
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(FrontierError::InvalidInput {
            field: "covariance_matrix".into(),
            reason: "Entries must be finite".into(),
        });
    }

    let scale = cov.amax().max(f64::MIN_POSITIVE);
    for i in 0..n {
        if cov[(i, i)] < -PSD_TOLERANCE * scale {
            return Err(FrontierError::InvalidInput {
                field: "covariance_matrix".into(),
                reason: format!("Negative variance on diagonal [{},{}]", i, i),
            });
        }
        for j in (i + 1)..n {
            if (cov[(i, j)] - cov[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                return Err(FrontierError::InvalidInput {
                    field: "covariance_matrix".into(),
                    reason: format!(
                        "Not symmetric: [{},{}]={} != [{},{}]={}",
                        i,
                        j,
                        cov[(i, j)],
                        j,
                        i,
                        cov[(j, i)]
                    ),
                });
            }
        }
    }

    // Positive definite matrices factor directly; singular-but-PSD ones
    // need the eigenvalue check.
    if cov.clone().cholesky().is_some() {
        return Ok(());
    }
    let eigenvalues = cov.symmetric_eigenvalues();
    let min_eigenvalue = eigenvalues.min();
    if min_eigenvalue < -PSD_TOLERANCE * scale {
        return Err(FrontierError::NotPositiveSemidefinite { min_eigenvalue });
    }
    Ok(())
}

fn validate_bounds(lower: &[f64], upper: &[f64]) -> FrontierResult<()> {
    for (i, (lo, hi)) in lower.iter().zip(upper.iter()).enumerate() {
        if lo > hi {
            return Err(FrontierError::InvalidInput {
                field: format!("bounds[{}]", i),
                reason: format!("lower bound {} exceeds upper bound {}", lo, hi),
            });
        }
    }

    let lower_sum: f64 = lower.iter().sum();
    let upper_sum: f64 = upper.iter().sum();
    if lower_sum > 1.0 + BUDGET_TOLERANCE {
        return Err(FrontierError::InfeasibleConstraints(format!(
            "lower bounds sum to {} > 1",
            lower_sum
        )));
    }
    if upper_sum < 1.0 - BUDGET_TOLERANCE {
        return Err(FrontierError::InfeasibleConstraints(format!(
            "upper bounds sum to {} < 1",
            upper_sum
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_row_slice(values))
    }

    #[test]
    fn test_long_only_bounds() {
        let p = Problem::long_only(vec![0.1, 0.05], diag(&[0.04, 0.01])).unwrap();
        assert_eq!(p.assets(), 2);
        assert_eq!(p.lower_bounds()[1], 0.0);
        assert_eq!(p.upper_bounds()[0], 1.0);
        assert!(!p.is_fixed(0));
    }

    #[test]
    fn test_empty_problem_rejected() {
        let err = Problem::long_only(vec![], DMatrix::zeros(0, 0)).unwrap_err();
        assert!(matches!(err, FrontierError::InvalidInput { .. }));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = Problem::long_only(vec![0.1, 0.05, 0.02], diag(&[0.04, 0.01])).unwrap_err();
        match err {
            FrontierError::InvalidInput { field, .. } => assert_eq!(field, "covariance_matrix"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_return_rejected() {
        let err = Problem::long_only(vec![0.1, f64::NAN], diag(&[0.04, 0.01])).unwrap_err();
        match err {
            FrontierError::InvalidInput { field, .. } => assert_eq!(field, "expected_returns[1]"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_asymmetric_covariance_rejected() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.02, 0.01]);
        assert!(Problem::long_only(vec![0.1, 0.05], cov).is_err());
    }

    #[test]
    fn test_indefinite_covariance_rejected() {
        // Correlation of 2 is impossible: eigenvalues 3 and -1.
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let err = Problem::long_only(vec![0.1, 0.05], cov).unwrap_err();
        match err {
            FrontierError::NotPositiveSemidefinite { min_eigenvalue } => {
                assert!((min_eigenvalue + 1.0).abs() < 1e-9)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_singular_psd_covariance_accepted() {
        // Perfectly correlated assets: rank one, still PSD.
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.02, 0.02, 0.01]);
        assert!(Problem::long_only(vec![0.1, 0.05], cov).is_ok());
    }

    #[test]
    fn test_crossed_bounds_rejected() {
        let err = Problem::new(vec![0.1, 0.05], diag(&[0.04, 0.01]), vec![0.6, 0.0], vec![0.5, 1.0])
            .unwrap_err();
        assert!(matches!(err, FrontierError::InvalidInput { .. }));
    }

    #[test]
    fn test_budget_infeasible_lower() {
        let err = Problem::new(vec![0.1, 0.05], diag(&[0.04, 0.01]), vec![0.6, 0.6], vec![1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, FrontierError::InfeasibleConstraints(_)));
    }

    #[test]
    fn test_budget_infeasible_upper() {
        let err = Problem::with_uniform_bounds(vec![0.1, 0.05], diag(&[0.04, 0.01]), 0.0, 0.4)
            .unwrap_err();
        assert!(matches!(err, FrontierError::InfeasibleConstraints(_)));
    }

    #[test]
    fn test_covariance_from_rows() {
        let cov = covariance_from_rows(&[vec![0.04, 0.01], vec![0.01, 0.09]]).unwrap();
        assert_eq!(cov[(0, 1)], 0.01);
        assert_eq!(cov[(1, 1)], 0.09);
        assert!(covariance_from_rows(&[vec![0.04, 0.01], vec![0.01]]).is_err());
    }
}
