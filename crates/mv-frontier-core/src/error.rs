use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontierError {
    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Covariance matrix is not positive semidefinite (smallest eigenvalue {min_eigenvalue:e})")]
    NotPositiveSemidefinite { min_eigenvalue: f64 },

    #[error("Infeasible constraints: {0}")]
    InfeasibleConstraints(String),

    /// The covariance restricted to the free assets carries no variance in
    /// some budget-neutral direction, so the KKT system has no unique
    /// solution. Only reachable with a rank-deficient covariance matrix.
    #[error("Singular covariance: the block over free assets {free_assets:?} cannot be inverted with the budget constraint")]
    SingularCovariance { free_assets: Vec<usize> },

    #[error("Convergence failure: {function} did not finish after {iterations} iterations")]
    ConvergenceFailure { function: String, iterations: usize },
}
