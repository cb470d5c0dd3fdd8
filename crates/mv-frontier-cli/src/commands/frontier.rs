use clap::Args;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Map, Value};
use tracing::debug;

use mv_frontier_core::analysis::{self, FrontierAnalysisInput};
use mv_frontier_core::frontier::query;
use mv_frontier_core::{compute_frontier_with, Frontier, InterpolatedPortfolio, Problem};

use crate::input;

#[derive(Args)]
pub struct FrontierArgs {
    /// Problem file (.json, .yaml); stdin when omitted
    #[arg(long)]
    pub input: Option<String>,
}

#[derive(Args)]
pub struct TargetReturnArgs {
    #[arg(long)]
    pub input: Option<String>,
    /// Target expected return as a decimal (0.08 = 8%)
    #[arg(long, allow_negative_numbers = true)]
    pub value: f64,
}

#[derive(Args)]
pub struct TargetVolatilityArgs {
    #[arg(long)]
    pub input: Option<String>,
    /// Target volatility as a decimal
    #[arg(long)]
    pub value: f64,
}

#[derive(Args)]
pub struct MinVarianceArgs {
    #[arg(long)]
    pub input: Option<String>,
}

#[derive(Args)]
pub struct MaxSharpeArgs {
    #[arg(long)]
    pub input: Option<String>,
    /// Overrides the problem file's risk_free_rate
    #[arg(long, allow_negative_numbers = true)]
    pub risk_free_rate: Option<f64>,
}

#[derive(Args)]
pub struct RiskAversionArgs {
    #[arg(long)]
    pub input: Option<String>,
    /// Risk aversion (lambda >= 0)
    #[arg(long)]
    pub lambda: f64,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    #[arg(long)]
    pub input: Option<String>,
}

/// A loaded problem together with its traced frontier.
struct Loaded {
    names: Vec<String>,
    problem: Problem,
    frontier: Frontier,
    risk_free_rate: f64,
}

pub fn run_frontier(args: FrontierArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let loaded = load(args.input.as_deref())?;
    let rows: Vec<Value> = loaded
        .frontier
        .turning_points()
        .iter()
        .enumerate()
        .map(|(i, tp)| {
            let mut row = Map::new();
            row.insert("index".into(), json!(i));
            row.insert("lambda".into(), json!(tp.lambda));
            row.insert("expected_return".into(), json!(tp.portfolio.mean));
            row.insert("volatility".into(), json!(tp.portfolio.volatility));
            for (name, w) in loaded.names.iter().zip(&tp.portfolio.weights) {
                row.insert(name.clone(), json!(w));
            }
            let free: Vec<&str> = tp.free_assets.iter().map(|j| loaded.names[*j].as_str()).collect();
            row.insert("free_assets".into(), json!(free.join(" ")));
            Value::Object(row)
        })
        .collect();
    Ok(Value::Array(rows))
}

pub fn run_target_return(args: TargetReturnArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let loaded = load(args.input.as_deref())?;
    let found = query::target_return(
        loaded.frontier.turning_points(),
        loaded.problem.covariance(),
        args.value,
    );
    Ok(envelope(
        &loaded,
        found,
        "Target return (linear blend of adjacent turning points)",
        format!("Target return {} is outside the efficient frontier", args.value),
    ))
}

pub fn run_target_volatility(
    args: TargetVolatilityArgs,
) -> Result<Value, Box<dyn std::error::Error>> {
    let loaded = load(args.input.as_deref())?;
    let found = query::target_volatility(
        loaded.frontier.turning_points(),
        loaded.problem.covariance(),
        args.value,
    );
    Ok(envelope(
        &loaded,
        found,
        "Target volatility (quadratic blend of adjacent turning points)",
        format!("Target volatility {} is outside the efficient frontier", args.value),
    ))
}

pub fn run_min_variance(args: MinVarianceArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let loaded = load(args.input.as_deref())?;
    let gmv = query::minimum_variance(loaded.frontier.turning_points());
    Ok(envelope(
        &loaded,
        Some(gmv),
        "Global minimum-variance portfolio (last turning point)",
        String::new(),
    ))
}

pub fn run_max_sharpe(args: MaxSharpeArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut loaded = load(args.input.as_deref())?;
    if let Some(rf) = args.risk_free_rate {
        loaded.risk_free_rate = rf;
    }
    let rf = loaded.risk_free_rate;
    let found = query::max_sharpe_ratio(
        loaded.frontier.turning_points(),
        loaded.problem.covariance(),
        rf,
    );
    Ok(envelope(
        &loaded,
        found,
        "Maximum Sharpe ratio (tangency) portfolio",
        format!("No frontier portfolio earns the risk-free rate {}", rf),
    ))
}

pub fn run_risk_aversion(args: RiskAversionArgs) -> Result<Value, Box<dyn std::error::Error>> {
    if args.lambda.is_nan() || args.lambda < 0.0 {
        return Err(format!("--lambda must be non-negative, got {}", args.lambda).into());
    }
    let loaded = load(args.input.as_deref())?;
    let found = query::at_risk_aversion(
        loaded.frontier.turning_points(),
        loaded.problem.covariance(),
        args.lambda,
    );
    Ok(envelope(
        &loaded,
        Some(found),
        "Efficient portfolio at a given risk aversion",
        String::new(),
    ))
}

pub fn run_analyze(args: AnalyzeArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let input = read_problem(args.input.as_deref())?;
    let result = analysis::analyze_frontier(&input)?;
    Ok(serde_json::to_value(result)?)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_problem(path: Option<&str>) -> Result<FrontierAnalysisInput, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        input::file::read_input(path)
    } else if let Some(data) = input::stdin::read_stdin()? {
        Ok(serde_json::from_value(data)?)
    } else {
        Err("--input <file.json|file.yaml> or stdin required".into())
    }
}

fn load(path: Option<&str>) -> Result<Loaded, Box<dyn std::error::Error>> {
    let input = read_problem(path)?;
    let problem = analysis::build_problem(&input)?;
    let names = analysis::asset_names(&input);
    let config = input.config.clone().unwrap_or_default();
    let frontier = compute_frontier_with(&problem, &config)?;
    let risk_free_rate = input
        .risk_free_rate
        .and_then(|r| r.to_f64())
        .unwrap_or(0.0);
    debug!(
        assets = problem.assets(),
        turning_points = frontier.len(),
        iterations = frontier.diagnostics.iterations,
        "frontier traced"
    );
    Ok(Loaded {
        names,
        problem,
        frontier,
        risk_free_rate,
    })
}

/// Wrap a query answer in the `result`/`warnings`/`methodology` envelope
/// the output formatters expect. A missing answer is reported as a null
/// result with a warning.
fn envelope(
    loaded: &Loaded,
    found: Option<InterpolatedPortfolio>,
    methodology: &str,
    no_solution: String,
) -> Value {
    let (result, warnings) = match found {
        Some(p) => (portfolio_value(loaded, &p), Vec::new()),
        None => (Value::Null, vec![no_solution]),
    };
    json!({
        "result": result,
        "methodology": methodology,
        "warnings": warnings,
    })
}

fn portfolio_value(loaded: &Loaded, p: &InterpolatedPortfolio) -> Value {
    let rf = loaded.risk_free_rate;
    let mut weights = Map::new();
    for (name, w) in loaded.names.iter().zip(&p.portfolio.weights) {
        weights.insert(name.clone(), json!(w));
    }
    let sharpe = p.portfolio.sharpe_ratio(rf);
    json!({
        "weights": weights,
        "expected_return": p.portfolio.mean,
        "volatility": p.portfolio.volatility,
        "sharpe_ratio": if sharpe.is_finite() { json!(sharpe) } else { Value::Null },
        "source_index": p.source_index,
        "source_index2": p.source_index2,
        "factor": p.factor,
    })
}
