use nalgebra::DVector;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FrontierError;
use crate::frontier::portfolio::{InterpolatedPortfolio, Portfolio};
use crate::frontier::query;
use crate::optimization::cla::{compute_frontier_with, ClaConfig, Diagnostics, Frontier};
use crate::optimization::problem::{covariance_from_rows, Problem};
use crate::types::{with_metadata, ComputationOutput, Rate};
use crate::FrontierResult;

/// Decimal places kept when reporting f64 results as decimals.
const REPORT_DP: u32 = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to an efficient frontier analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierAnalysisInput {
    /// Asset identifiers (defaults to `A1..An` when empty).
    #[serde(default)]
    pub asset_names: Vec<String>,
    /// Expected return per asset.
    pub expected_returns: Vec<Decimal>,
    /// N x N covariance matrix.
    pub covariance_matrix: Vec<Vec<Decimal>>,
    /// Per-asset minimum weight (default 0).
    #[serde(default)]
    pub lower_bounds: Option<Vec<Decimal>>,
    /// Per-asset maximum weight (default 1).
    #[serde(default)]
    pub upper_bounds: Option<Vec<Decimal>>,
    /// Risk-free rate for the tangency portfolio (default 0).
    #[serde(default)]
    pub risk_free_rate: Option<Rate>,
    #[serde(default)]
    pub target_return: Option<Decimal>,
    #[serde(default)]
    pub target_volatility: Option<Decimal>,
    #[serde(default)]
    pub risk_aversion: Option<Decimal>,
    /// Sampled portfolios per frontier segment (default 10).
    #[serde(default)]
    pub frontier_points: Option<u32>,
    #[serde(default)]
    pub config: Option<ClaConfig>,
}

/// A single asset weight with risk/return contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetWeight {
    pub name: String,
    pub weight: Decimal,
    /// Weight times expected return.
    pub contribution_to_return: Decimal,
    /// Weight times marginal volatility contribution.
    pub contribution_to_risk: Decimal,
}

/// A reported portfolio, with its position on the frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub weights: Vec<AssetWeight>,
    pub expected_return: Decimal,
    pub volatility: Decimal,
    /// `None` for a riskless portfolio.
    pub sharpe_ratio: Option<Decimal>,
    pub source_index: usize,
    pub source_index2: Option<usize>,
    pub factor: Decimal,
}

/// A corner portfolio of the frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurningPointSummary {
    pub lambda: Decimal,
    pub expected_return: Decimal,
    pub volatility: Decimal,
    pub weights: Vec<Decimal>,
    pub free_assets: Vec<String>,
}

/// A sampled point for plotting the frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub expected_return: Decimal,
    pub volatility: Decimal,
    pub sharpe_ratio: Option<Decimal>,
}

/// Output of an efficient frontier analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierAnalysisOutput {
    pub turning_points: Vec<TurningPointSummary>,
    pub max_return_portfolio: PortfolioSummary,
    pub min_variance_portfolio: PortfolioSummary,
    /// Maximum Sharpe ratio portfolio, if any portfolio earns the risk-free
    /// rate.
    pub tangency_portfolio: Option<PortfolioSummary>,
    pub target_return_portfolio: Option<PortfolioSummary>,
    pub target_volatility_portfolio: Option<PortfolioSummary>,
    pub risk_aversion_portfolio: Option<PortfolioSummary>,
    pub efficient_frontier: Vec<FrontierPoint>,
    pub diagnostics: Diagnostics,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Trace the efficient frontier and answer every query the input asks for.
pub fn analyze_frontier(
    input: &FrontierAnalysisInput,
) -> FrontierResult<ComputationOutput<FrontierAnalysisOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let problem = build_problem(input)?;
    let names = asset_names(input);
    let config = input.config.clone().unwrap_or_default();
    let frontier = compute_frontier_with(&problem, &config)?;
    let points = frontier.turning_points();
    let cov = problem.covariance();
    let rf_dec = input.risk_free_rate.unwrap_or(Decimal::ZERO);
    let rf = to_f64("risk_free_rate", rf_dec)?;

    let report = |p: &InterpolatedPortfolio| summarize(p, &problem, &names, rf);

    let max_return_portfolio = report(&query::maximum_return(points));
    let min_variance_portfolio = report(&query::minimum_variance(points));

    // --- Tangency portfolio ---
    let tangency = query::max_sharpe_ratio(points, cov, rf);
    if tangency.is_none() {
        warnings.push(format!(
            "No frontier portfolio earns the risk-free rate {}",
            rf_dec
        ));
    }
    let tangency_portfolio = tangency.as_ref().map(report);

    // --- Requested targets ---
    let target_return_portfolio = match input.target_return {
        Some(target) => {
            let found = query::target_return(points, cov, to_f64("target_return", target)?);
            if found.is_none() {
                warnings.push(out_of_span("Target return", target, &frontier, |p| p.mean));
            }
            found.as_ref().map(report)
        }
        None => None,
    };

    let target_volatility_portfolio = match input.target_volatility {
        Some(target) => {
            let found =
                query::target_volatility(points, cov, to_f64("target_volatility", target)?);
            if found.is_none() {
                warnings.push(out_of_span("Target volatility", target, &frontier, |p| {
                    p.volatility
                }));
            }
            found.as_ref().map(report)
        }
        None => None,
    };

    let risk_aversion_portfolio = match input.risk_aversion {
        Some(lambda) => {
            let lambda = to_f64("risk_aversion", lambda)?;
            if lambda < 0.0 {
                return Err(FrontierError::InvalidInput {
                    field: "risk_aversion".into(),
                    reason: "Risk aversion must be non-negative".into(),
                });
            }
            Some(report(&query::at_risk_aversion(points, cov, lambda)))
        }
        None => None,
    };

    // --- Sampled frontier ---
    let per_segment = input.frontier_points.unwrap_or(10) as usize;
    let efficient_frontier = query::sample_frontier(points, cov, per_segment)
        .iter()
        .map(|s| FrontierPoint {
            expected_return: to_decimal(s.portfolio.mean),
            volatility: to_decimal(s.portfolio.volatility),
            sharpe_ratio: finite_decimal(s.portfolio.sharpe_ratio(rf)),
        })
        .collect();

    let turning_points = points
        .iter()
        .map(|tp| TurningPointSummary {
            lambda: to_decimal(tp.lambda),
            expected_return: to_decimal(tp.portfolio.mean),
            volatility: to_decimal(tp.portfolio.volatility),
            weights: tp.portfolio.weights.iter().map(|w| to_decimal(*w)).collect(),
            free_assets: tp.free_assets.iter().map(|i| names[*i].clone()).collect(),
        })
        .collect();

    // --- Warnings ---
    let headline = tangency_portfolio.as_ref().unwrap_or(&min_variance_portfolio);
    for aw in &headline.weights {
        if aw.weight > dec!(0.40) {
            warnings.push(format!(
                "Concentrated position: {} has weight {:.4}",
                aw.name, aw.weight
            ));
        }
    }
    if frontier.diagnostics.full_rebuilds > 0 {
        warnings.push(format!(
            "KKT inverse rebuilt {} time(s) after ill-conditioned updates",
            frontier.diagnostics.full_rebuilds
        ));
    }

    let output = FrontierAnalysisOutput {
        turning_points,
        max_return_portfolio,
        min_variance_portfolio,
        tangency_portfolio,
        target_return_portfolio,
        target_volatility_portfolio,
        risk_aversion_portfolio,
        efficient_frontier,
        diagnostics: frontier.diagnostics.clone(),
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Critical Line Algorithm (box-constrained mean-variance frontier)",
        &serde_json::json!({
            "n_assets": problem.assets(),
            "risk_free_rate": rf_dec.to_string(),
            "turning_points": frontier.len(),
            "frontier_points_per_segment": per_segment,
            "budget": "weights sum to 1",
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// Convert the decimal input into a validated [`Problem`].
pub fn build_problem(input: &FrontierAnalysisInput) -> FrontierResult<Problem> {
    let n = input.expected_returns.len();
    if !input.asset_names.is_empty() && input.asset_names.len() != n {
        return Err(FrontierError::InvalidInput {
            field: "asset_names".into(),
            reason: format!("Expected {} names but got {}", n, input.asset_names.len()),
        });
    }

    let returns = to_f64_vec("expected_returns", &input.expected_returns)?;
    let rows = input
        .covariance_matrix
        .iter()
        .map(|row| to_f64_vec("covariance_matrix", row))
        .collect::<FrontierResult<Vec<_>>>()?;
    let covariance = covariance_from_rows(&rows)?;
    let lower = match &input.lower_bounds {
        Some(v) => to_f64_vec("lower_bounds", v)?,
        None => vec![0.0; n],
    };
    let upper = match &input.upper_bounds {
        Some(v) => to_f64_vec("upper_bounds", v)?,
        None => vec![1.0; n],
    };
    Problem::new(returns, covariance, lower, upper)
}

/// Input asset names, or `A1..An` when none were given.
pub fn asset_names(input: &FrontierAnalysisInput) -> Vec<String> {
    if input.asset_names.is_empty() {
        (1..=input.expected_returns.len())
            .map(|i| format!("A{}", i))
            .collect()
    } else {
        input.asset_names.clone()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn summarize(
    p: &InterpolatedPortfolio,
    problem: &Problem,
    names: &[String],
    rf: f64,
) -> PortfolioSummary {
    let portfolio = &p.portfolio;
    let sigma_w = problem.covariance() * DVector::from_column_slice(&portfolio.weights);
    let mu = problem.expected_returns();

    let weights = portfolio
        .weights
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let mcr = if portfolio.volatility > 0.0 {
                sigma_w[i] / portfolio.volatility
            } else {
                0.0
            };
            AssetWeight {
                name: names[i].clone(),
                weight: to_decimal(*w),
                contribution_to_return: to_decimal(w * mu[i]),
                contribution_to_risk: to_decimal(w * mcr),
            }
        })
        .collect();

    PortfolioSummary {
        weights,
        expected_return: to_decimal(portfolio.mean),
        volatility: to_decimal(portfolio.volatility),
        sharpe_ratio: finite_decimal(portfolio.sharpe_ratio(rf)),
        source_index: p.source_index,
        source_index2: p.source_index2,
        factor: to_decimal(p.factor),
    }
}

fn out_of_span(
    label: &str,
    target: Decimal,
    frontier: &Frontier,
    key: impl Fn(&Portfolio) -> f64,
) -> String {
    format!(
        "{} {} is outside the frontier span [{:.6}, {:.6}]",
        label,
        target,
        key(&frontier.min_variance().portfolio),
        key(&frontier.max_return().portfolio)
    )
}

fn to_f64(field: &str, value: Decimal) -> FrontierResult<f64> {
    value.to_f64().ok_or_else(|| FrontierError::InvalidInput {
        field: field.into(),
        reason: format!("{} is not representable as f64", value),
    })
}

fn to_f64_vec(field: &str, values: &[Decimal]) -> FrontierResult<Vec<f64>> {
    values.iter().map(|v| to_f64(field, *v)).collect()
}

fn to_decimal(value: f64) -> Decimal {
    finite_decimal(value).unwrap_or(Decimal::ZERO)
}

fn finite_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(REPORT_DP))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
