use nalgebra::DMatrix;
use tracing::trace;

use super::portfolio::{blend_variance_coefficients, InterpolatedPortfolio, Portfolio};
use crate::optimization::cla::TurningPoint;

/// Targets within this distance of a turning point return it unchanged.
pub const EXACT_MATCH_TOLERANCE: f64 = 1e-8;
/// Blend factors this far outside `[0, 1]` are still accepted and clamped.
const ROOT_SLACK: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Efficient portfolio with expected return `target`, or `None` when the
/// target lies outside `[mean[last], mean[first]]`.
///
/// Panics on an empty frontier.
pub fn target_return<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    target: f64,
) -> Option<InterpolatedPortfolio> {
    assert_not_empty(frontier);
    let idx = frontier.partition_point(|p| p.as_ref().mean >= target);
    if let Some(exact) = exact_match(frontier, idx, target, |p| p.mean) {
        return Some(exact);
    }
    if idx == 0 || idx == frontier.len() {
        return None;
    }

    let (a, b) = (frontier[idx - 1].as_ref(), frontier[idx].as_ref());
    let factor = (target - b.mean) / (a.mean - b.mean);
    trace!(upper = idx - 1, lower = idx, factor, "target return bracketed");
    Some(InterpolatedPortfolio::blend(
        (idx - 1, a),
        (idx, b),
        factor.clamp(0.0, 1.0),
        covariance,
    ))
}

/// Efficient portfolio with volatility `target`, or `None` when the target is
/// outside the frontier's volatility span or the blend equation has no
/// admissible root.
///
/// Panics on an empty frontier.
pub fn target_volatility<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    target: f64,
) -> Option<InterpolatedPortfolio> {
    assert_not_empty(frontier);
    let idx = frontier.partition_point(|p| p.as_ref().volatility >= target);
    if let Some(exact) = exact_match(frontier, idx, target, |p| p.volatility) {
        return Some(exact);
    }
    if idx == 0 || idx == frontier.len() {
        return None;
    }

    let (a, b) = (frontier[idx - 1].as_ref(), frontier[idx].as_ref());
    let (qa, qb, qc) = blend_variance_coefficients(a, b, covariance);
    let factor = solve_quadratic(qa, qb, qc - target * target)
        .into_iter()
        .filter_map(admissible)
        .max_by(|x, y| {
            let mx = x * a.mean + (1.0 - x) * b.mean;
            let my = y * a.mean + (1.0 - y) * b.mean;
            mx.total_cmp(&my)
        })?;
    trace!(upper = idx - 1, lower = idx, factor, "target volatility bracketed");
    Some(InterpolatedPortfolio::blend(
        (idx - 1, a),
        (idx, b),
        factor,
        covariance,
    ))
}

/// The global minimum-variance portfolio: the last turning point.
pub fn minimum_variance<P: AsRef<Portfolio>>(frontier: &[P]) -> InterpolatedPortfolio {
    assert_not_empty(frontier);
    let last = frontier.len() - 1;
    InterpolatedPortfolio::exact(last, frontier[last].as_ref().clone())
}

/// The maximum-return corner: the first turning point.
pub fn maximum_return<P: AsRef<Portfolio>>(frontier: &[P]) -> InterpolatedPortfolio {
    assert_not_empty(frontier);
    InterpolatedPortfolio::exact(0, frontier[0].as_ref().clone())
}

/// Tangency portfolio against `risk_free_rate`.
///
/// Returns `None` when even the maximum-return corner earns less than the
/// risk-free rate. Otherwise the search runs over the part of the frontier
/// with non-negative excess return, which is cut off with an interpolated
/// point at `mean = risk_free_rate` when it ends mid-segment.
///
/// Panics on an empty frontier.
pub fn max_sharpe_ratio<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    risk_free_rate: f64,
) -> Option<InterpolatedPortfolio> {
    assert_not_empty(frontier);
    if frontier[0].as_ref().mean - risk_free_rate < 0.0 {
        return None;
    }

    let nodes = excess_return_prefix(frontier, covariance, risk_free_rate);
    let sharpe: Vec<f64> = nodes
        .iter()
        .map(|n| n.portfolio.sharpe_ratio(risk_free_rate))
        .collect();

    // Sharpe is unimodal along the frontier: bisect on the sign of the
    // difference between neighbours.
    let (mut lo, mut hi) = (0, nodes.len() - 1);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if sharpe[mid] < sharpe[mid + 1] {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let peak = lo;
    trace!(peak, sharpe = sharpe[peak], "sharpe peak corner");

    let mut best = nodes[peak].clone();
    let mut best_sharpe = sharpe[peak];
    let segments = [peak.checked_sub(1), Some(peak)];
    for upper in segments.into_iter().flatten() {
        if upper + 1 >= nodes.len() {
            continue;
        }
        let (a, b) = (&nodes[upper], &nodes[upper + 1]);
        for factor in sharpe_stationary_points(&a.portfolio, &b.portfolio, covariance, risk_free_rate)
        {
            let candidate = compose(frontier, covariance, a, b, factor);
            let s = candidate.portfolio.sharpe_ratio(risk_free_rate);
            if s > best_sharpe {
                best_sharpe = s;
                best = candidate;
            }
        }
        for endpoint in [a, b] {
            let s = endpoint.portfolio.sharpe_ratio(risk_free_rate);
            if s > best_sharpe {
                best_sharpe = s;
                best = endpoint.clone();
            }
        }
    }
    Some(best)
}

/// Efficient portfolio at risk aversion `lambda`. Weights are piecewise
/// linear in lambda between corners; above the first corner the
/// maximum-return portfolio holds, at or below zero the minimum-variance one.
///
/// Panics on an empty frontier or a NaN lambda.
pub fn at_risk_aversion(
    frontier: &[TurningPoint],
    covariance: &DMatrix<f64>,
    lambda: f64,
) -> InterpolatedPortfolio {
    assert_not_empty(frontier);
    assert!(!lambda.is_nan(), "risk aversion must not be NaN");

    let idx = frontier.partition_point(|tp| tp.lambda > lambda);
    if idx == 0 {
        return maximum_return(frontier);
    }
    if idx == frontier.len() {
        return minimum_variance(frontier);
    }
    let (a, b) = (&frontier[idx - 1], &frontier[idx]);
    if (b.lambda - lambda).abs() <= EXACT_MATCH_TOLERANCE * b.lambda.abs().max(1.0) {
        return InterpolatedPortfolio::exact(idx, b.portfolio.clone());
    }
    let factor = (lambda - b.lambda) / (a.lambda - b.lambda);
    InterpolatedPortfolio::blend(
        (idx - 1, &a.portfolio),
        (idx, &b.portfolio),
        factor.clamp(0.0, 1.0),
        covariance,
    )
}

/// `per_segment` portfolios evenly spaced in mean along each segment,
/// starting at its upper corner, followed by the minimum-variance portfolio.
pub fn sample_frontier<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    per_segment: usize,
) -> Vec<InterpolatedPortfolio> {
    assert_not_empty(frontier);
    let steps = per_segment.max(1);
    let mut samples = Vec::with_capacity((frontier.len() - 1) * steps + 1);

    for (i, pair) in frontier.windows(2).enumerate() {
        let (a, b) = (pair[0].as_ref(), pair[1].as_ref());
        samples.push(InterpolatedPortfolio::exact(i, a.clone()));
        for k in 1..steps {
            let factor = 1.0 - k as f64 / steps as f64;
            samples.push(InterpolatedPortfolio::blend((i, a), (i + 1, b), factor, covariance));
        }
    }
    samples.push(minimum_variance(frontier));
    samples
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn assert_not_empty<P>(frontier: &[P]) {
    assert!(!frontier.is_empty(), "query on an empty frontier");
}

/// Turning point `idx - 1` or `idx` when its key is within tolerance of
/// `target`. `idx` is the first point whose key fell below the target.
fn exact_match<P: AsRef<Portfolio>>(
    frontier: &[P],
    idx: usize,
    target: f64,
    key: impl Fn(&Portfolio) -> f64,
) -> Option<InterpolatedPortfolio> {
    (idx.saturating_sub(1)..(idx + 1).min(frontier.len()))
        .find(|i| (key(frontier[*i].as_ref()) - target).abs() <= EXACT_MATCH_TOLERANCE)
        .map(|i| InterpolatedPortfolio::exact(i, frontier[i].as_ref().clone()))
}

fn admissible(root: f64) -> Option<f64> {
    (root >= -ROOT_SLACK && root <= 1.0 + ROOT_SLACK).then(|| root.clamp(0.0, 1.0))
}

/// Turning points with `mean >= rf`, followed by the interpolated point at
/// `mean = rf` when the frontier continues below it.
fn excess_return_prefix<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    risk_free_rate: f64,
) -> Vec<InterpolatedPortfolio> {
    let keep = frontier.partition_point(|p| p.as_ref().mean >= risk_free_rate);
    let mut nodes: Vec<InterpolatedPortfolio> = frontier[..keep]
        .iter()
        .enumerate()
        .map(|(i, p)| InterpolatedPortfolio::exact(i, p.as_ref().clone()))
        .collect();

    if keep < frontier.len() {
        if let Some(cutoff) = target_return(frontier, covariance, risk_free_rate) {
            let duplicate = cutoff.is_exact() && cutoff.source_index + 1 == keep;
            if !duplicate {
                nodes.push(cutoff);
            }
        }
    }
    nodes
}

/// Express `f·upper + (1 − f)·lower` against the full turning-point list.
/// `upper` is always an exact corner; `lower` may be the interpolated cutoff
/// that shares it as its own upper source.
fn compose<P: AsRef<Portfolio>>(
    frontier: &[P],
    covariance: &DMatrix<f64>,
    upper: &InterpolatedPortfolio,
    lower: &InterpolatedPortfolio,
    factor: f64,
) -> InterpolatedPortfolio {
    if factor >= 1.0 {
        return upper.clone();
    }
    if factor <= 0.0 {
        return lower.clone();
    }
    let (first, second, factor) = match lower.source_index2 {
        None => (upper.source_index, lower.source_index, factor),
        Some(below) => {
            debug_assert_eq!(upper.source_index, lower.source_index);
            (
                lower.source_index,
                below,
                factor + (1.0 - factor) * lower.factor,
            )
        }
    };
    InterpolatedPortfolio::blend(
        (first, frontier[first].as_ref()),
        (second, frontier[second].as_ref()),
        factor,
        covariance,
    )
}

/// Admissible blend factors where `d/df S(f)² = 0` on the segment between
/// `upper` (weight `f`) and `lower`.
///
/// With excess `e(f) = e_b + Δe·f` and variance `V(f) = A f² + B f + C` the
/// numerator of the derivative factors as `e·(2Δe·V − e·V')`, so the
/// candidates are the roots of `2Δe·V − e·V'`.
fn sharpe_stationary_points(
    upper: &Portfolio,
    lower: &Portfolio,
    covariance: &DMatrix<f64>,
    risk_free_rate: f64,
) -> Vec<f64> {
    let (a, b, c) = blend_variance_coefficients(upper, lower, covariance);
    let delta = upper.mean - lower.mean;
    let excess = [lower.mean - risk_free_rate, delta];
    let variance = [c, b, a];
    let slope = [b, 2.0 * a];

    let p = poly_sub(
        &poly_scale(&variance, 2.0 * delta),
        &poly_mul(&excess, &slope),
    );
    let coeff = |k: usize| p.get(k).copied().unwrap_or(0.0);
    solve_quadratic(coeff(2), coeff(1), coeff(0))
        .into_iter()
        .filter_map(admissible)
        .collect()
}

// Polynomials are coefficient vectors in ascending degree.

fn poly_mul(p: &[f64], q: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; p.len() + q.len() - 1];
    for (i, x) in p.iter().enumerate() {
        for (j, y) in q.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn poly_scale(p: &[f64], k: f64) -> Vec<f64> {
    p.iter().map(|x| x * k).collect()
}

fn poly_sub(p: &[f64], q: &[f64]) -> Vec<f64> {
    (0..p.len().max(q.len()))
        .map(|i| p.get(i).copied().unwrap_or(0.0) - q.get(i).copied().unwrap_or(0.0))
        .collect()
}

/// Real roots of `a x² + b x + c`, using `q = −½(b + sign(b)·√D)` to avoid
/// cancellation. Degenerates to the linear solve when `a` vanishes.
pub fn solve_quadratic(a: f64, b: f64, c: f64) -> Vec<f64> {
    let scale = b.abs().max(c.abs());
    if a.abs() <= 1e-14 * scale || a == 0.0 {
        if b == 0.0 {
            return Vec::new();
        }
        return vec![-c / b];
    }

    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return Vec::new();
    }
    let sign = if b < 0.0 { -1.0 } else { 1.0 };
    let q = -0.5 * (b + sign * discriminant.sqrt());
    if q == 0.0 {
        // b = 0 and D = 0 force c = 0: double root at the origin.
        return vec![0.0];
    }
    let (r1, r2) = (q / a, c / q);
    if r1 == r2 {
        vec![r1]
    } else {
        vec![r1, r2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::cla::compute_frontier;
    use crate::optimization::problem::Problem;
    use pretty_assertions::assert_eq;

    fn two_asset() -> Problem {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.01]);
        Problem::long_only(vec![0.10, 0.05], cov).unwrap()
    }

    fn four_asset() -> Problem {
        let v = [0.18, 0.12, 0.22, 0.08];
        let rho = [
            [1.0, 0.2, 0.4, 0.0],
            [0.2, 1.0, 0.3, 0.1],
            [0.4, 0.3, 1.0, -0.1],
            [0.0, 0.1, -0.1, 1.0],
        ];
        let cov = DMatrix::from_fn(4, 4, |i, j| rho[i][j] * v[i] * v[j]);
        Problem::with_uniform_bounds(vec![0.11, 0.07, 0.13, 0.03], cov, 0.0, 0.6).unwrap()
    }

    #[test]
    fn test_two_asset_midpoint() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let mid = target_return(frontier.turning_points(), p.covariance(), 0.075).unwrap();
        assert!((mid.portfolio.weights[0] - 0.5).abs() < 1e-9);
        assert!((mid.portfolio.weights[1] - 0.5).abs() < 1e-9);
        assert_eq!((mid.source_index, mid.source_index2), (0, Some(1)));
        // Diagonal covariance: 0.25*0.04 + 0.25*0.01
        assert!((mid.portfolio.variance() - 0.0125).abs() < 1e-12);
    }

    #[test]
    fn test_turning_points_are_exact_targets() {
        let p = four_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        for (i, tp) in points.iter().enumerate() {
            let hit = target_return(points, p.covariance(), tp.portfolio.mean).unwrap();
            assert!(hit.is_exact());
            assert_eq!(hit.source_index, i);
            assert_eq!(hit.portfolio, tp.portfolio);
        }
    }

    #[test]
    fn test_target_return_round_trip() {
        let p = four_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        let (hi, lo) = (points[0].portfolio.mean, points[points.len() - 1].portfolio.mean);
        for k in 1..20 {
            let target = lo + (hi - lo) * k as f64 / 20.0;
            let got = target_return(points, p.covariance(), target).unwrap();
            assert!((got.portfolio.mean - target).abs() < 1e-6);
            if let Some(j) = got.source_index2 {
                let rebuilt = got.factor * points[got.source_index].portfolio.mean
                    + (1.0 - got.factor) * points[j].portfolio.mean;
                assert!((rebuilt - target).abs() < 1e-6);
            }
            let total: f64 = got.portfolio.weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_target_return_out_of_range() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        assert!(target_return(points, p.covariance(), 0.11).is_none());
        assert!(target_return(points, p.covariance(), 0.05).is_none());
    }

    #[test]
    fn test_target_volatility_round_trip() {
        let p = four_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        let (hi, lo) = (
            points[0].portfolio.volatility,
            points[points.len() - 1].portfolio.volatility,
        );
        for k in 1..10 {
            let target = lo + (hi - lo) * k as f64 / 10.0;
            let got = target_volatility(points, p.covariance(), target).unwrap();
            assert!(
                (got.portfolio.volatility - target).abs() < 1e-9,
                "wanted {target}, got {}",
                got.portfolio.volatility
            );
        }
        assert!(target_volatility(points, p.covariance(), hi * 1.01).is_none());
        assert!(target_volatility(points, p.covariance(), lo * 0.99).is_none());
    }

    #[test]
    fn test_two_asset_target_volatility_keeps_upper_branch() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let got = target_volatility(frontier.turning_points(), p.covariance(), 0.15).unwrap();
        // 0.04 w² + 0.01 (1 - w)² = 0.0225 on the efficient side w > 0.2
        let w = (0.01 + (0.0001_f64 - 0.05 * (0.01 - 0.0225)).sqrt()) / 0.05;
        assert!((got.portfolio.weights[0] - w).abs() < 1e-9);
    }

    #[test]
    fn test_two_asset_tangency() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();

        let tangency = max_sharpe_ratio(points, p.covariance(), 0.0).unwrap();
        assert!((tangency.portfolio.weights[0] - 1.0 / 3.0).abs() < 1e-9);

        // Σ⁻¹(μ − rf) = [2, 3]
        let tangency = max_sharpe_ratio(points, p.covariance(), 0.02).unwrap();
        assert!((tangency.portfolio.weights[0] - 0.4).abs() < 1e-9);
        assert!((tangency.portfolio.weights[1] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_max_sharpe_none_above_best_return() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        assert!(max_sharpe_ratio(frontier.turning_points(), p.covariance(), 0.2).is_none());
    }

    #[test]
    fn test_max_sharpe_beats_dense_sampling() {
        let p = four_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        for rf in [0.0, 0.02, 0.05, 0.09] {
            let best = max_sharpe_ratio(points, p.covariance(), rf).unwrap();
            let s = best.portfolio.sharpe_ratio(rf);
            for sample in sample_frontier(points, p.covariance(), 200) {
                if sample.portfolio.mean < rf {
                    continue;
                }
                assert!(sample.portfolio.sharpe_ratio(rf) <= s + 1e-9, "rf {rf}");
            }
            let total: f64 = best.portfolio.weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_max_sharpe_indices_refer_to_full_frontier() {
        let p = four_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        let rf = 0.09;
        let best = max_sharpe_ratio(points, p.covariance(), rf).unwrap();
        let rebuilt: Vec<f64> = match best.source_index2 {
            None => points[best.source_index].portfolio.weights.clone(),
            Some(j) => points[best.source_index]
                .portfolio
                .weights
                .iter()
                .zip(&points[j].portfolio.weights)
                .map(|(a, b)| best.factor * a + (1.0 - best.factor) * b)
                .collect(),
        };
        for (got, want) in best.portfolio.weights.iter().zip(rebuilt) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_min_variance_and_max_return() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        let gmv = minimum_variance(points);
        assert_eq!(gmv.source_index, points.len() - 1);
        assert_eq!(gmv.portfolio, frontier.min_variance().portfolio);
        assert_eq!(maximum_return(points).portfolio, frontier.max_return().portfolio);
    }

    #[test]
    fn test_at_risk_aversion_interpolates_linearly() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let points = frontier.turning_points();
        assert_eq!(at_risk_aversion(points, p.covariance(), 5.0).source_index, 0);
        assert_eq!(at_risk_aversion(points, p.covariance(), 0.0).source_index, 1);

        // w0(λ) = 0.2 + λ on this segment.
        let mid = at_risk_aversion(points, p.covariance(), 0.4);
        assert!((mid.portfolio.weights[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_sample_frontier_spacing() {
        let p = two_asset();
        let frontier = compute_frontier(&p).unwrap();
        let samples = sample_frontier(frontier.turning_points(), p.covariance(), 4);
        assert_eq!(samples.len(), 5);
        let means: Vec<f64> = samples.iter().map(|s| s.portfolio.mean).collect();
        for pair in means.windows(2) {
            assert!((pair[0] - pair[1] - 0.01).abs() < 1e-12);
        }
    }

    #[test]
    fn test_solve_quadratic() {
        let mut roots = solve_quadratic(1.0, -3.0, 2.0);
        roots.sort_by(f64::total_cmp);
        assert_eq!(roots, vec![1.0, 2.0]);
        assert_eq!(solve_quadratic(0.0, 2.0, -1.0), vec![0.5]);
        assert!(solve_quadratic(1.0, 0.0, 1.0).is_empty());
        assert_eq!(solve_quadratic(1.0, 0.0, 0.0), vec![0.0]);
    }

    #[test]
    #[should_panic(expected = "query on an empty frontier")]
    fn test_empty_frontier_panics() {
        let empty: Vec<Portfolio> = Vec::new();
        target_return(&empty, &DMatrix::zeros(0, 0), 0.1);
    }
}
