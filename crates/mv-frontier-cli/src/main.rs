mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use commands::frontier::{
    AnalyzeArgs, FrontierArgs, MaxSharpeArgs, MinVarianceArgs, RiskAversionArgs,
    TargetReturnArgs, TargetVolatilityArgs,
};

/// Mean-variance efficient frontiers under box constraints
#[derive(Parser)]
#[command(
    name = "mvf",
    version,
    about = "Mean-variance efficient frontiers under box constraints",
    long_about = "Traces the efficient frontier of a box-constrained, fully invested \
                  portfolio with the Critical Line Algorithm and answers target-return, \
                  target-volatility, minimum-variance, maximum-Sharpe and risk-aversion \
                  queries against it. Problems are read from JSON or YAML."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log turning points and active-set transitions to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the turning points of the efficient frontier
    Frontier(FrontierArgs),
    /// Efficient portfolio with a given expected return
    TargetReturn(TargetReturnArgs),
    /// Efficient portfolio with a given volatility
    TargetVolatility(TargetVolatilityArgs),
    /// Global minimum-variance portfolio
    MinVariance(MinVarianceArgs),
    /// Maximum Sharpe ratio (tangency) portfolio
    MaxSharpe(MaxSharpeArgs),
    /// Efficient portfolio at a given risk aversion
    RiskAversion(RiskAversionArgs),
    /// Full frontier analysis with every requested query
    Analyze(AnalyzeArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Frontier(args) => commands::frontier::run_frontier(args),
        Commands::TargetReturn(args) => commands::frontier::run_target_return(args),
        Commands::TargetVolatility(args) => commands::frontier::run_target_volatility(args),
        Commands::MinVariance(args) => commands::frontier::run_min_variance(args),
        Commands::MaxSharpe(args) => commands::frontier::run_max_sharpe(args),
        Commands::RiskAversion(args) => commands::frontier::run_risk_aversion(args),
        Commands::Analyze(args) => commands::frontier::run_analyze(args),
        Commands::Version => {
            println!("mvf {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
