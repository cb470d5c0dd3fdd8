use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of a fully invested portfolio.
///
/// `volatility` is the square root of the variance; every comparison in the
/// query layer is made on volatility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub weights: Vec<f64>,
    pub mean: f64,
    pub volatility: f64,
}

impl Portfolio {
    pub fn from_weights(
        weights: Vec<f64>,
        expected_returns: &DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> Self {
        let mean = weights
            .iter()
            .zip(expected_returns.iter())
            .map(|(w, r)| w * r)
            .sum();
        let volatility = portfolio_variance(&weights, covariance).sqrt();
        Self {
            weights,
            mean,
            volatility,
        }
    }

    pub fn variance(&self) -> f64 {
        self.volatility * self.volatility
    }

    /// `(mean - rf) / volatility`; a riskless portfolio scores ±infinity
    /// by the sign of its excess return.
    pub fn sharpe_ratio(&self, risk_free_rate: f64) -> f64 {
        sharpe(self.mean - risk_free_rate, self.volatility)
    }

    /// Σ wᵢ²: 1/n for an equal-weight portfolio, 1 for a single asset.
    pub fn concentration(&self) -> f64 {
        self.weights.iter().map(|w| w * w).sum()
    }
}

impl AsRef<Portfolio> for Portfolio {
    fn as_ref(&self) -> &Portfolio {
        self
    }
}

/// A frontier answer: either a turning point itself or a blend of two
/// adjacent ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolatedPortfolio {
    #[serde(flatten)]
    pub portfolio: Portfolio,
    /// Turning point carrying weight `factor`.
    pub source_index: usize,
    /// Turning point carrying weight `1 - factor`, if this is a blend.
    pub source_index2: Option<usize>,
    pub factor: f64,
}

impl InterpolatedPortfolio {
    pub fn exact(index: usize, portfolio: Portfolio) -> Self {
        Self {
            portfolio,
            source_index: index,
            source_index2: None,
            factor: 1.0,
        }
    }

    /// `factor * first + (1 - factor) * second`, with the variance taken
    /// through the cross-covariance of the two weight vectors.
    pub fn blend(
        first: (usize, &Portfolio),
        second: (usize, &Portfolio),
        factor: f64,
        covariance: &DMatrix<f64>,
    ) -> Self {
        Self {
            portfolio: blend(first.1, second.1, factor, covariance),
            source_index: first.0,
            source_index2: Some(second.0),
            factor,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.source_index2.is_none()
    }
}

impl AsRef<Portfolio> for InterpolatedPortfolio {
    fn as_ref(&self) -> &Portfolio {
        &self.portfolio
    }
}

// ---------------------------------------------------------------------------
// Portfolio math helpers
// ---------------------------------------------------------------------------

pub(crate) fn sharpe(excess: f64, volatility: f64) -> f64 {
    if volatility > 0.0 {
        excess / volatility
    } else if excess > 0.0 {
        f64::INFINITY
    } else if excess < 0.0 {
        f64::NEG_INFINITY
    } else {
        0.0
    }
}

/// w' Σ w, floored at zero against rounding.
pub fn portfolio_variance(weights: &[f64], covariance: &DMatrix<f64>) -> f64 {
    cross_covariance(weights, weights, covariance).max(0.0)
}

/// a' Σ b
pub fn cross_covariance(a: &[f64], b: &[f64], covariance: &DMatrix<f64>) -> f64 {
    let a = DVector::from_column_slice(a);
    let b = DVector::from_column_slice(b);
    a.dot(&(covariance * b))
}

/// Coefficients `(A, B, C)` of the blend variance `A f² + B f + C`.
pub(crate) fn blend_variance_coefficients(
    first: &Portfolio,
    second: &Portfolio,
    covariance: &DMatrix<f64>,
) -> (f64, f64, f64) {
    let cross = cross_covariance(&first.weights, &second.weights, covariance);
    let v1 = first.variance();
    let v2 = second.variance();
    (v1 + v2 - 2.0 * cross, 2.0 * (cross - v2), v2)
}

fn blend(first: &Portfolio, second: &Portfolio, factor: f64, covariance: &DMatrix<f64>) -> Portfolio {
    let weights = first
        .weights
        .iter()
        .zip(second.weights.iter())
        .map(|(a, b)| factor * a + (1.0 - factor) * b)
        .collect();
    let mean = factor * first.mean + (1.0 - factor) * second.mean;
    let (a, b, c) = blend_variance_coefficients(first, second, covariance);
    let variance = (a * factor * factor + b * factor + c).max(0.0);
    Portfolio {
        weights,
        mean,
        volatility: variance.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cov() -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[0.04, 0.006, 0.006, 0.01])
    }

    fn mu() -> DVector<f64> {
        DVector::from_vec(vec![0.10, 0.05])
    }

    #[test]
    fn test_from_weights() {
        let p = Portfolio::from_weights(vec![0.5, 0.5], &mu(), &cov());
        assert!((p.mean - 0.075).abs() < 1e-15);
        // 0.25*0.04 + 0.25*0.01 + 2*0.25*0.006
        assert!((p.variance() - 0.0155).abs() < 1e-15);
    }

    #[test]
    fn test_sharpe_ratio() {
        let p = Portfolio {
            weights: vec![1.0],
            mean: 0.08,
            volatility: 0.2,
        };
        assert!((p.sharpe_ratio(0.02) - 0.3).abs() < 1e-12);

        let riskless = Portfolio {
            weights: vec![1.0],
            mean: 0.03,
            volatility: 0.0,
        };
        assert_eq!(riskless.sharpe_ratio(0.02), f64::INFINITY);
        assert_eq!(riskless.sharpe_ratio(0.03), 0.0);
    }

    #[test]
    fn test_blend_uses_cross_covariance() {
        let a = Portfolio::from_weights(vec![1.0, 0.0], &mu(), &cov());
        let b = Portfolio::from_weights(vec![0.0, 1.0], &mu(), &cov());
        let mid = InterpolatedPortfolio::blend((0, &a), (1, &b), 0.5, &cov());
        let direct = Portfolio::from_weights(vec![0.5, 0.5], &mu(), &cov());

        assert_eq!(mid.source_index, 0);
        assert_eq!(mid.source_index2, Some(1));
        assert!(!mid.is_exact());
        assert!((mid.portfolio.mean - direct.mean).abs() < 1e-15);
        assert!((mid.portfolio.volatility - direct.volatility).abs() < 1e-12);
        // A naive blend of the two variances would give 0.025.
        assert!((mid.portfolio.variance() - 0.025).abs() > 1e-3);
    }

    #[test]
    fn test_concentration() {
        let p = Portfolio::from_weights(vec![0.5, 0.5], &mu(), &cov());
        assert!((p.concentration() - 0.5).abs() < 1e-15);
    }
}
