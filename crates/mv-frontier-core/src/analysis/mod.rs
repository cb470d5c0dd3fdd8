pub mod frontier_analysis;

pub use frontier_analysis::{
    analyze_frontier, asset_names, build_problem, FrontierAnalysisInput, FrontierAnalysisOutput,
};
