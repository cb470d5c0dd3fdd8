use napi::Result as NapiResult;
use napi_derive::napi;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use mv_frontier_core::analysis::{self, FrontierAnalysisInput};
use mv_frontier_core::frontier::query;
use mv_frontier_core::{compute_frontier_with, Frontier, Problem};

/// Convert any Display error into a napi::Error.
fn to_napi_error(e: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> NapiResult<String> {
    serde_json::to_string(value).map_err(to_napi_error)
}

/// Parse the problem JSON and trace its frontier.
fn trace(input_json: &str) -> NapiResult<(FrontierAnalysisInput, Problem, Frontier)> {
    let input: FrontierAnalysisInput = serde_json::from_str(input_json).map_err(to_napi_error)?;
    let problem = analysis::build_problem(&input).map_err(to_napi_error)?;
    let config = input.config.clone().unwrap_or_default();
    let frontier = compute_frontier_with(&problem, &config).map_err(to_napi_error)?;
    Ok((input, problem, frontier))
}

// ---------------------------------------------------------------------------
// Frontier
// ---------------------------------------------------------------------------

/// Turning points and run diagnostics.
#[napi]
pub fn compute_frontier(input_json: String) -> NapiResult<String> {
    let (_, _, frontier) = trace(&input_json)?;
    to_json(&frontier)
}

/// Full analysis envelope (turning points, named portfolios, sampled
/// frontier, warnings).
#[napi]
pub fn analyze_frontier(input_json: String) -> NapiResult<String> {
    let input: FrontierAnalysisInput = serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output = analysis::analyze_frontier(&input).map_err(to_napi_error)?;
    to_json(&output)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------
//
// Each returns the JSON of the portfolio, or "null" when the frontier has no
// answer for the request.

#[napi]
pub fn target_return_portfolio(input_json: String, target: f64) -> NapiResult<String> {
    let (_, problem, frontier) = trace(&input_json)?;
    let found = query::target_return(frontier.turning_points(), problem.covariance(), target);
    to_json(&found)
}

#[napi]
pub fn target_volatility_portfolio(input_json: String, target: f64) -> NapiResult<String> {
    let (_, problem, frontier) = trace(&input_json)?;
    let found = query::target_volatility(frontier.turning_points(), problem.covariance(), target);
    to_json(&found)
}

#[napi]
pub fn min_variance_portfolio(input_json: String) -> NapiResult<String> {
    let (_, _, frontier) = trace(&input_json)?;
    to_json(&query::minimum_variance(frontier.turning_points()))
}

/// `risk_free_rate` falls back to the input's own rate, then zero.
#[napi]
pub fn max_sharpe_portfolio(input_json: String, risk_free_rate: Option<f64>) -> NapiResult<String> {
    let (input, problem, frontier) = trace(&input_json)?;
    let rf = risk_free_rate
        .or_else(|| input.risk_free_rate.and_then(|r| r.to_f64()))
        .unwrap_or(0.0);
    let found = query::max_sharpe_ratio(frontier.turning_points(), problem.covariance(), rf);
    to_json(&found)
}
