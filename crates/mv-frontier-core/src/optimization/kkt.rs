use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::problem::Problem;
use crate::error::FrontierError;
use crate::FrontierResult;

/// Number of equality constraints folded into the KKT system (the budget).
pub const CONSTRAINTS: usize = 1;

/// Inverses whose crude condition estimate exceeds this are treated as
/// singular.
const MAX_CONDITION: f64 = 1e13;

/// Read-only view of the full bordered KKT matrix
///
/// ```text
///     | Σ   1 |
/// K = |       |
///     | 1'  0 |
/// ```
///
/// indexed by slot: `0..n` are assets, `n` is the budget multiplier.
#[derive(Debug, Clone, Copy)]
pub struct KktSystem<'a> {
    problem: &'a Problem,
}

impl<'a> KktSystem<'a> {
    pub fn new(problem: &'a Problem) -> Self {
        Self { problem }
    }

    pub fn problem(&self) -> &'a Problem {
        self.problem
    }

    pub fn variables(&self) -> usize {
        self.problem.assets()
    }

    pub fn slots(&self) -> usize {
        self.variables() + CONSTRAINTS
    }

    pub fn entry(&self, i: usize, j: usize) -> f64 {
        let n = self.variables();
        match (i < n, j < n) {
            (true, true) => self.problem.covariance()[(i, j)],
            (false, false) => 0.0,
            // Budget row: every asset carries coefficient one.
            _ => 1.0,
        }
    }

    /// `K` restricted to `slots` (rows and columns in the given order).
    pub fn submatrix(&self, slots: &[usize]) -> DMatrix<f64> {
        let k = slots.len();
        DMatrix::from_fn(k, k, |r, c| self.entry(slots[r], slots[c]))
    }

    /// Column `j` of `K` restricted to the rows in `slots`.
    pub fn column(&self, slots: &[usize], j: usize) -> DVector<f64> {
        DVector::from_iterator(slots.len(), slots.iter().map(|s| self.entry(*s, j)))
    }
}

/// How an inverse update was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverseUpdate {
    Incremental,
    Rebuilt,
}

/// Running inverse of `K` restricted to the IN slots, rows ordered as the
/// IN set.
#[derive(Debug, Clone)]
pub struct BorderedInverse {
    inverse: DMatrix<f64>,
}

impl BorderedInverse {
    /// Full inversion of the IN-restricted KKT matrix.
    pub fn build(kkt: &KktSystem<'_>, slots: &[usize]) -> FrontierResult<Self> {
        let matrix = kkt.submatrix(slots);
        invert(&matrix)
            .map(|inverse| Self { inverse })
            .ok_or_else(|| FrontierError::SingularCovariance {
                free_assets: slots
                    .iter()
                    .copied()
                    .filter(|s| *s < kkt.variables())
                    .collect(),
            })
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.inverse
    }

    pub fn dim(&self) -> usize {
        self.inverse.nrows()
    }

    /// Border the inverse with the last slot of `slots`, which has just been
    /// appended to the IN set. Falls back to a full rebuild when the Schur
    /// complement pivot is too small.
    pub fn append(
        &mut self,
        kkt: &KktSystem<'_>,
        slots: &[usize],
        pivot_tolerance: f64,
    ) -> FrontierResult<InverseUpdate> {
        let k = self.dim();
        debug_assert_eq!(slots.len(), k + 1);
        let slot = slots[k];

        let border = kkt.column(&slots[..k], slot);
        let diagonal = kkt.entry(slot, slot);
        let v = &self.inverse * &border;
        let pivot = diagonal - border.dot(&v);
        let scale = 1.0 + diagonal.abs() + border.dot(&v).abs();

        if pivot.abs() <= pivot_tolerance * scale {
            warn!(slot, pivot, "bordering pivot too small, rebuilding KKT inverse");
            *self = Self::build(kkt, slots)?;
            return Ok(InverseUpdate::Rebuilt);
        }

        let mut grown = DMatrix::zeros(k + 1, k + 1);
        grown
            .view_mut((0, 0), (k, k))
            .copy_from(&(&self.inverse + &v * v.transpose() / pivot));
        for r in 0..k {
            grown[(r, k)] = -v[r] / pivot;
            grown[(k, r)] = -v[r] / pivot;
        }
        grown[(k, k)] = 1.0 / pivot;
        self.inverse = grown;
        Ok(InverseUpdate::Incremental)
    }

    /// Drop row and column `rank` after the slot at that rank left the IN
    /// set; `slots` is the IN set after removal.
    pub fn remove(
        &mut self,
        kkt: &KktSystem<'_>,
        slots: &[usize],
        rank: usize,
        pivot_tolerance: f64,
    ) -> FrontierResult<InverseUpdate> {
        let pivot = self.inverse[(rank, rank)];
        let scale = 1.0 + self.inverse.column(rank).amax();

        if pivot.abs() <= pivot_tolerance * scale {
            warn!(rank, pivot, "downdate pivot too small, rebuilding KKT inverse");
            *self = Self::build(kkt, slots)?;
            return Ok(InverseUpdate::Rebuilt);
        }

        let column = self.inverse.column(rank).clone_owned();
        let shrunk = &self.inverse - &column * column.transpose() / pivot;
        self.inverse = shrunk.remove_row(rank).remove_column(rank);
        Ok(InverseUpdate::Incremental)
    }

    /// Largest absolute difference against a fresh inversion.
    pub fn drift(&self, kkt: &KktSystem<'_>, slots: &[usize]) -> FrontierResult<f64> {
        let fresh = Self::build(kkt, slots)?;
        Ok((&self.inverse - &fresh.inverse).amax())
    }
}

fn invert(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inverse = matrix.clone().try_inverse()?;
    let condition = matrix.amax() * inverse.amax() * matrix.nrows() as f64;
    if !condition.is_finite() || condition > MAX_CONDITION {
        return None;
    }
    Some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem() -> Problem {
        let cov = DMatrix::from_row_slice(
            3,
            3,
            &[0.04, 0.006, 0.002, 0.006, 0.09, 0.01, 0.002, 0.01, 0.0225],
        );
        Problem::long_only(vec![0.10, 0.12, 0.06], cov).unwrap()
    }

    fn assert_close(a: &DMatrix<f64>, b: &DMatrix<f64>) {
        assert_eq!(a.shape(), b.shape());
        let diff = (a - b).amax();
        assert!(diff < 1e-9, "matrices differ by {diff}\n{a}\n{b}");
    }

    #[test]
    fn test_entry_layout() {
        let p = problem();
        let kkt = KktSystem::new(&p);
        assert_eq!(kkt.slots(), 4);
        assert_eq!(kkt.entry(0, 1), 0.006);
        assert_eq!(kkt.entry(3, 1), 1.0);
        assert_eq!(kkt.entry(2, 3), 1.0);
        assert_eq!(kkt.entry(3, 3), 0.0);
    }

    #[test]
    fn test_budget_slot_alone_is_singular() {
        let p = problem();
        let kkt = KktSystem::new(&p);
        let err = BorderedInverse::build(&kkt, &[3]).unwrap_err();
        match err {
            FrontierError::SingularCovariance { free_assets } => assert!(free_assets.is_empty()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_append_matches_full_inversion() {
        let p = problem();
        let kkt = KktSystem::new(&p);
        let mut inv = BorderedInverse::build(&kkt, &[3, 1]).unwrap();

        let update = inv.append(&kkt, &[3, 1, 0], 1e-12).unwrap();
        assert_eq!(update, InverseUpdate::Incremental);
        assert_close(inv.matrix(), BorderedInverse::build(&kkt, &[3, 1, 0]).unwrap().matrix());

        inv.append(&kkt, &[3, 1, 0, 2], 1e-12).unwrap();
        assert_close(
            inv.matrix(),
            BorderedInverse::build(&kkt, &[3, 1, 0, 2]).unwrap().matrix(),
        );
        assert!(inv.drift(&kkt, &[3, 1, 0, 2]).unwrap() < 1e-9);
    }

    #[test]
    fn test_remove_matches_full_inversion() {
        let p = problem();
        let kkt = KktSystem::new(&p);
        let mut inv = BorderedInverse::build(&kkt, &[3, 1, 0, 2]).unwrap();

        let update = inv.remove(&kkt, &[3, 1, 2], 2, 1e-12).unwrap();
        assert_eq!(update, InverseUpdate::Incremental);
        assert_close(inv.matrix(), BorderedInverse::build(&kkt, &[3, 1, 2]).unwrap().matrix());
    }

    #[test]
    fn test_identical_assets_are_singular() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.04, 0.04, 0.04]);
        let p = Problem::long_only(vec![0.10, 0.05], cov).unwrap();
        let kkt = KktSystem::new(&p);
        let mut inv = BorderedInverse::build(&kkt, &[2, 0]).unwrap();
        let err = inv.append(&kkt, &[2, 0, 1], 1e-12).unwrap_err();
        match &err {
            FrontierError::SingularCovariance { free_assets } => assert_eq!(free_assets, &vec![0, 1]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().starts_with("Singular covariance"));
        assert!(!err.to_string().contains("Infeasible"));
    }

    #[test]
    fn test_correlated_pair_stays_invertible() {
        // Singular covariance, but the bordered system only needs the
        // difference of the two assets to carry variance.
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.02, 0.02, 0.01]);
        let p = Problem::long_only(vec![0.10, 0.05], cov).unwrap();
        let kkt = KktSystem::new(&p);
        let mut inv = BorderedInverse::build(&kkt, &[2, 0]).unwrap();
        assert_eq!(inv.append(&kkt, &[2, 0, 1], 1e-12).unwrap(), InverseUpdate::Incremental);
    }
}
