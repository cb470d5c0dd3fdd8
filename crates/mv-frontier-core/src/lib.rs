pub mod error;
pub mod frontier;
pub mod optimization;
pub mod types;

#[cfg(feature = "analysis")]
pub mod analysis;

pub use error::FrontierError;
pub use frontier::portfolio::{InterpolatedPortfolio, Portfolio};
pub use optimization::cla::{compute_frontier, compute_frontier_with, ClaConfig, Frontier, TurningPoint};
pub use optimization::problem::Problem;
pub use types::*;

/// Standard result type for all frontier operations
pub type FrontierResult<T> = Result<T, FrontierError>;
