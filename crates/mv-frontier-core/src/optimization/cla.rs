use std::cmp::Ordering;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::active_set::{ActiveSet, BoundState};
use super::kkt::{BorderedInverse, InverseUpdate, KktSystem, CONSTRAINTS};
use super::problem::{Problem, BUDGET_TOLERANCE};
use crate::error::FrontierError;
use crate::frontier::portfolio::Portfolio;
use crate::FrontierResult;

/// Verified inverses drifting further than this from a fresh inversion are
/// replaced.
const DRIFT_TOLERANCE: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Numerical knobs for a Critical Line run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaConfig {
    /// Slopes and pivots smaller than this (relative) are treated as zero.
    pub tolerance: f64,
    /// Event lambdas closer than this (relative) are tied.
    pub tie_tolerance: f64,
    /// Corners whose means differ by less than this (relative) are merged.
    pub merge_tolerance: f64,
    /// Cap on active-set transitions; defaults to `4 * assets + 4`.
    pub max_iterations: Option<usize>,
    /// Check every incremental inverse update against a full inversion.
    pub verify_inverse: bool,
}

impl Default for ClaConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            tie_tolerance: 1e-9,
            merge_tolerance: 1e-12,
            max_iterations: None,
            verify_inverse: false,
        }
    }
}

/// Counters describing how a run went.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub iterations: usize,
    pub incremental_updates: usize,
    pub full_rebuilds: usize,
    pub merged_corners: usize,
    /// Largest drift seen when `verify_inverse` is on.
    pub max_inverse_drift: f64,
}

/// A corner portfolio of the efficient frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurningPoint {
    #[serde(flatten)]
    pub portfolio: Portfolio,
    /// Risk aversion at which this corner is reached.
    pub lambda: f64,
    /// Free assets of the basis in force just below `lambda`.
    pub free_assets: Vec<usize>,
}

impl AsRef<Portfolio> for TurningPoint {
    fn as_ref(&self) -> &Portfolio {
        &self.portfolio
    }
}

/// Turning points ordered from maximum return down to minimum variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frontier {
    pub turning_points: Vec<TurningPoint>,
    pub diagnostics: Diagnostics,
}

impl Frontier {
    pub fn turning_points(&self) -> &[TurningPoint] {
        &self.turning_points
    }

    pub fn len(&self) -> usize {
        self.turning_points.len()
    }

    /// Never true for a frontier produced by [`compute_frontier`].
    pub fn is_empty(&self) -> bool {
        self.turning_points.is_empty()
    }

    pub fn max_return(&self) -> &TurningPoint {
        &self.turning_points[0]
    }

    pub fn min_variance(&self) -> &TurningPoint {
        &self.turning_points[self.turning_points.len() - 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    /// A free asset reaches a bound and leaves the IN set.
    Leave(BoundState),
    /// A bounded asset's shadow price changes sign and it joins the IN set.
    Enter,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    lambda: f64,
    slot: usize,
    kind: EventKind,
}

impl Event {
    /// Tie-break order: leaving before entering, then lower slot index.
    fn priority(&self) -> (u8, usize) {
        match self.kind {
            EventKind::Leave(_) => (0, self.slot),
            EventKind::Enter => (1, self.slot),
        }
    }
}

/// `x_IN(λ) = λ·alpha + beta` for the current basis.
struct Direction {
    alpha: DVector<f64>,
    beta: DVector<f64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Trace the efficient frontier with default settings.
pub fn compute_frontier(problem: &Problem) -> FrontierResult<Frontier> {
    compute_frontier_with(problem, &ClaConfig::default())
}

/// Trace the efficient frontier of `problem` with the Critical Line
/// Algorithm, from the maximum-return corner down to the global
/// minimum-variance portfolio.
pub fn compute_frontier_with(problem: &Problem, config: &ClaConfig) -> FrontierResult<Frontier> {
    let n = problem.assets();
    let (weights, states, free) = greedy_fill(problem);

    let lower_sum: f64 = problem.lower_bounds().sum();
    let upper_sum: f64 = problem.upper_bounds().sum();
    let pinned = (lower_sum - 1.0).abs() <= BUDGET_TOLERANCE
        || (upper_sum - 1.0).abs() <= BUDGET_TOLERANCE;

    let free = match free {
        Some(asset) if !pinned => asset,
        _ => {
            debug!(assets = n, "budget pins every weight, frontier is a single point");
            let portfolio = Portfolio::from_weights(
                weights,
                problem.expected_returns(),
                problem.covariance(),
            );
            return Ok(Frontier {
                turning_points: vec![TurningPoint {
                    portfolio,
                    lambda: 0.0,
                    free_assets: Vec::new(),
                }],
                diagnostics: Diagnostics::default(),
            });
        }
    };

    let mut line = CriticalLine::new(problem, config, weights, &states, free)?;
    line.settle_max_return_face(free)?;
    line.run()?;
    Ok(Frontier {
        turning_points: line.points,
        diagnostics: line.diagnostics,
    })
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Maximum-return feasible portfolio: everything at its lower bound, then
/// assets raised to their upper bound in order of decreasing expected return
/// until the budget runs out. The asset that exhausts the budget is the
/// initial free asset.
fn greedy_fill(problem: &Problem) -> (Vec<f64>, Vec<BoundState>, Option<usize>) {
    let n = problem.assets();
    let mu = problem.expected_returns();
    let lower = problem.lower_bounds();
    let upper = problem.upper_bounds();

    let mut order: Vec<usize> = (0..n).collect();
    // Stable sort keeps equal returns in index order.
    order.sort_by(|a, b| mu[*b].partial_cmp(&mu[*a]).unwrap_or(Ordering::Equal));

    let mut weights: Vec<f64> = lower.iter().copied().collect();
    let mut states = vec![BoundState::Low; n];
    let mut remaining = 1.0 - lower.sum();
    let mut free = None;
    let mut last_movable = None;

    for &i in &order {
        if problem.is_fixed(i) {
            continue;
        }
        last_movable = Some(i);
        let room = upper[i] - lower[i];
        if remaining <= room {
            free = Some(i);
            break;
        }
        weights[i] = upper[i];
        states[i] = BoundState::High;
        remaining -= room;
    }

    // Upper bounds summing to one within tolerance leave a sliver on the
    // last asset visited.
    let free = free.or(last_movable);
    if let Some(i) = free {
        let others: f64 = (0..n).filter(|j| *j != i).map(|j| weights[j]).sum();
        weights[i] = 1.0 - others;
        states[i] = BoundState::Low;
    }
    (weights, states, free)
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable state of one Critical Line run.
struct CriticalLine<'a> {
    kkt: KktSystem<'a>,
    config: &'a ClaConfig,
    set: ActiveSet,
    inverse: BorderedInverse,
    /// Asset weights followed by the budget multiplier.
    weights: DVector<f64>,
    lambda: f64,
    /// Slots already moved at the current lambda.
    moved_here: Vec<usize>,
    points: Vec<TurningPoint>,
    diagnostics: Diagnostics,
}

impl<'a> CriticalLine<'a> {
    fn new(
        problem: &'a Problem,
        config: &'a ClaConfig,
        weights: Vec<f64>,
        states: &[BoundState],
        free: usize,
    ) -> FrontierResult<Self> {
        let kkt = KktSystem::new(problem);
        let mut set = ActiveSet::new(states, CONSTRAINTS);
        set.go_in(free);
        let inverse = BorderedInverse::build(&kkt, set.in_vars())?;

        let mut all = DVector::zeros(kkt.slots());
        all.rows_mut(0, weights.len()).copy_from_slice(&weights);

        Ok(Self {
            kkt,
            config,
            set,
            inverse,
            weights: all,
            lambda: f64::INFINITY,
            moved_here: Vec::new(),
            points: Vec::new(),
            diagnostics: Diagnostics::default(),
        })
    }

    fn problem(&self) -> &'a Problem {
        self.kkt.problem()
    }

    fn max_iterations(&self) -> usize {
        self.config
            .max_iterations
            .unwrap_or(4 * self.problem().assets() + 4)
    }

    fn count_iteration(&mut self) -> FrontierResult<()> {
        self.diagnostics.iterations += 1;
        if self.diagnostics.iterations > self.max_iterations() {
            return Err(FrontierError::ConvergenceFailure {
                function: "critical line".into(),
                iterations: self.max_iterations(),
            });
        }
        Ok(())
    }

    /// Move to the least-variance portfolio among those earning the maximum
    /// expected return.
    ///
    /// When several assets share the top return the greedy fill is only one
    /// point of a face of maximum-return portfolios. Primal active-set
    /// descent over the assets tied with `top_asset`, every other asset held
    /// at its bound; entering candidates are taken lowest index first.
    fn settle_max_return_face(&mut self, top_asset: usize) -> FrontierResult<()> {
        let problem = self.problem();
        let mu = problem.expected_returns();
        let top = mu[top_asset];
        let tolerance = self.config.tolerance * (1.0 + top.abs());
        let tied: Vec<bool> = (0..problem.assets())
            .map(|j| !problem.is_fixed(j) && (mu[j] - top).abs() <= tolerance)
            .collect();
        if tied.iter().filter(|t| **t).count() < 2 {
            return Ok(());
        }

        loop {
            let direction = self.direction();

            // Step toward the basis' minimum-variance weights, stopping at the
            // first bound in the way.
            let mut step = 1.0;
            let mut blocking = None;
            for (rank, slot) in self.set.in_vars().iter().copied().enumerate() {
                if !self.set.is_variable(slot) {
                    continue;
                }
                let delta = direction.beta[rank] - self.weights[slot];
                let (bound, side) = if delta < 0.0 {
                    (problem.lower_bounds()[slot], BoundState::Low)
                } else if delta > 0.0 {
                    (problem.upper_bounds()[slot], BoundState::High)
                } else {
                    continue;
                };
                let t = ((bound - self.weights[slot]) / delta).max(0.0);
                if t < step {
                    step = t;
                    blocking = Some((slot, side));
                }
            }
            for (rank, slot) in self.set.in_vars().iter().copied().enumerate() {
                if self.set.is_variable(slot) {
                    let w = self.weights[slot];
                    self.weights[slot] = w + step * (direction.beta[rank] - w);
                }
            }

            let event = match blocking {
                Some((slot, side)) => Event {
                    lambda: f64::INFINITY,
                    slot,
                    kind: EventKind::Leave(side),
                },
                None => {
                    let entering = self
                        .set
                        .out_vars()
                        .iter()
                        .copied()
                        .filter(|slot| tied[*slot])
                        .filter(|slot| {
                            let (_, c) = self.shadow_price(*slot, &direction);
                            self.favourable_now(*slot, c)
                        })
                        .min();
                    match entering {
                        Some(slot) => Event {
                            lambda: f64::INFINITY,
                            slot,
                            kind: EventKind::Enter,
                        },
                        None => break,
                    }
                }
            };

            self.count_iteration()?;
            debug!(
                iteration = self.diagnostics.iterations,
                slot = event.slot,
                kind = ?event.kind,
                "maximum-return face transition"
            );
            self.apply(event)?;
        }

        self.moved_here.clear();
        Ok(())
    }

    fn run(&mut self) -> FrontierResult<()> {
        let mut direction = self.direction();

        loop {
            let event = match self.next_event(&direction) {
                Some(event) if event.lambda > 0.0 => event,
                _ => {
                    self.lambda = 0.0;
                    self.set_free_weights(&direction);
                    self.emit();
                    return Ok(());
                }
            };

            self.count_iteration()?;
            if !self.is_tied(event.lambda, self.lambda) {
                self.moved_here.clear();
            }
            self.lambda = event.lambda.min(self.lambda);
            debug!(
                iteration = self.diagnostics.iterations,
                lambda = self.lambda,
                slot = event.slot,
                kind = ?event.kind,
                "active set transition"
            );

            self.apply(event)?;
            direction = self.direction();
            // Transitions at unbounded lambda only settle ties in expected
            // return; the first corner is emitted at the first finite event.
            if self.lambda.is_finite() {
                self.set_free_weights(&direction);
                self.emit();
            }
        }
    }

    /// Right-hand sides of the IN-restricted KKT system, split into the part
    /// proportional to lambda and the constant part.
    fn direction(&self) -> Direction {
        let problem = self.problem();
        let n = problem.assets();
        let mu = problem.expected_returns();
        let in_slots = self.set.in_vars();

        let q = DVector::from_iterator(
            in_slots.len(),
            in_slots.iter().map(|s| if *s < n { mu[*s] } else { 0.0 }),
        );
        let r = DVector::from_iterator(
            in_slots.len(),
            in_slots.iter().map(|s| {
                let rhs = if *s < n { 0.0 } else { 1.0 };
                rhs - self
                    .set
                    .out_vars()
                    .iter()
                    .map(|o| self.kkt.entry(*s, *o) * self.weights[*o])
                    .sum::<f64>()
            }),
        );

        let ai = self.inverse.matrix();
        Direction {
            alpha: ai * q,
            beta: ai * r,
        }
    }

    fn next_event(&self, direction: &Direction) -> Option<Event> {
        let mut candidates = Vec::new();
        self.leave_candidates(direction, &mut candidates);
        self.enter_candidates(direction, &mut candidates);

        let best = candidates
            .iter()
            .map(|e| e.lambda)
            .fold(f64::NEG_INFINITY, f64::max);
        candidates
            .into_iter()
            .filter(|e| self.is_tied(e.lambda, best))
            .min_by_key(|e| e.priority())
    }

    /// Free assets crossing one of their bounds as lambda decreases.
    fn leave_candidates(&self, direction: &Direction, out: &mut Vec<Event>) {
        let problem = self.problem();
        let scale = self.config.tolerance * (1.0 + direction.alpha.amax());

        for (rank, slot) in self.set.in_vars().iter().copied().enumerate() {
            if !self.set.is_variable(slot) {
                continue;
            }
            let a = direction.alpha[rank];
            let b = direction.beta[rank];
            let lower = problem.lower_bounds()[slot];
            let upper = problem.upper_bounds()[slot];
            let (bound, side) = if a > scale {
                (lower, BoundState::Low)
            } else if a < -scale {
                (upper, BoundState::High)
            } else {
                // Weight does not move with lambda: only an existing
                // violation can make it leave.
                let slack = self.config.tolerance * (1.0 + b.abs());
                if b < lower - slack {
                    self.push_violation(out, slot, BoundState::Low);
                } else if b > upper + slack {
                    self.push_violation(out, slot, BoundState::High);
                }
                continue;
            };
            let lambda = (bound - b) / a;
            trace!(slot, lambda, ?side, "bound crossing candidate");
            if self.lambda.is_finite() && self.is_overdue(lambda) {
                let now = a * self.lambda + b;
                let slack = self.config.tolerance * (1.0 + now.abs());
                let outside = match side {
                    BoundState::Low => now < lower - slack,
                    _ => now > upper + slack,
                };
                if outside {
                    self.push_violation(out, slot, side);
                    continue;
                }
            }
            self.push_candidate(out, lambda, slot, EventKind::Leave(side));
        }
    }

    /// Bounded assets whose shadow price `d(λ) = a·λ + c` turns favourable.
    fn enter_candidates(&self, direction: &Direction, out: &mut Vec<Event>) {
        let problem = self.problem();
        let mu = problem.expected_returns();

        for slot in self.set.out_vars().iter().copied() {
            if problem.is_fixed(slot) {
                continue;
            }
            let (a, c) = self.shadow_price(slot, direction);
            let row_alpha = mu[slot] - a;

            let scale = self.config.tolerance * (1.0 + mu[slot].abs() + row_alpha.abs());
            if a.abs() <= scale {
                // Flat shadow price: enter now if it is already favourable.
                if self.favourable_now(slot, c) {
                    self.push_candidate(out, f64::INFINITY, slot, EventKind::Enter);
                }
                continue;
            }
            let favourable = if self.set.is_lo(slot) { a < 0.0 } else { a > 0.0 };
            if !favourable {
                continue;
            }
            let lambda = -c / a;
            trace!(slot, lambda, "shadow price candidate");
            self.push_candidate(out, lambda, slot, EventKind::Enter);
        }
    }

    /// Shadow price `d(λ) = a·λ + c` of a bounded slot, returned as `(a, c)`.
    fn shadow_price(&self, slot: usize, direction: &Direction) -> (f64, f64) {
        let mu = self.problem().expected_returns();
        let row = self.kkt.column(self.set.in_vars(), slot);
        let a = mu[slot] - row.dot(&direction.alpha);
        let c = -self
            .set
            .out_vars()
            .iter()
            .map(|o| self.kkt.entry(slot, *o) * self.weights[*o])
            .sum::<f64>()
            - row.dot(&direction.beta);
        (a, c)
    }

    /// A bounded slot whose shadow price `c` already points into its box.
    fn favourable_now(&self, slot: usize, c: f64) -> bool {
        let slack = self.config.tolerance * (1.0 + c.abs());
        if self.set.is_lo(slot) {
            c > slack
        } else {
            c < -slack
        }
    }

    /// A free weight already outside its box leaves at the current lambda,
    /// even if it moved here before.
    fn push_violation(&self, out: &mut Vec<Event>, slot: usize, side: BoundState) {
        trace!(slot, ?side, "weight outside its box");
        out.push(Event {
            lambda: self.lambda,
            slot,
            kind: EventKind::Leave(side),
        });
    }

    fn is_overdue(&self, lambda: f64) -> bool {
        lambda >= self.lambda || self.is_tied(lambda, self.lambda)
    }

    fn push_candidate(&self, out: &mut Vec<Event>, lambda: f64, slot: usize, kind: EventKind) {
        if lambda.is_nan() {
            return;
        }
        if self.is_overdue(lambda) {
            // Moving the same slot twice at one lambda would cycle.
            if self.moved_here.contains(&slot) {
                return;
            }
            // Anything at or beyond the current lambda is overdue.
            out.push(Event {
                lambda: self.lambda,
                slot,
                kind,
            });
            return;
        }
        out.push(Event { lambda, slot, kind });
    }

    fn is_tied(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        if !a.is_finite() || !b.is_finite() {
            return false;
        }
        (a - b).abs() <= self.config.tie_tolerance * a.abs().max(b.abs()).max(1.0)
    }

    fn apply(&mut self, event: Event) -> FrontierResult<()> {
        let tolerance = self.config.tolerance;
        let update = match event.kind {
            EventKind::Leave(side) => {
                let problem = self.problem();
                let bound = match side {
                    BoundState::High => problem.upper_bounds()[event.slot],
                    _ => problem.lower_bounds()[event.slot],
                };
                let rank = self.set.go_out(event.slot, side);
                self.weights[event.slot] = bound;
                self.inverse
                    .remove(&self.kkt, self.set.in_vars(), rank, tolerance)?
            }
            EventKind::Enter => {
                self.set.go_in(event.slot);
                self.inverse.append(&self.kkt, self.set.in_vars(), tolerance)?
            }
        };
        self.moved_here.push(event.slot);

        match update {
            InverseUpdate::Incremental => self.diagnostics.incremental_updates += 1,
            InverseUpdate::Rebuilt => self.diagnostics.full_rebuilds += 1,
        }

        if self.config.verify_inverse {
            let drift = self.inverse.drift(&self.kkt, self.set.in_vars())?;
            self.diagnostics.max_inverse_drift = self.diagnostics.max_inverse_drift.max(drift);
            if drift > DRIFT_TOLERANCE {
                warn!(drift, "incremental KKT inverse drifted, replacing with full inversion");
                self.inverse = BorderedInverse::build(&self.kkt, self.set.in_vars())?;
                self.diagnostics.full_rebuilds += 1;
            }
        }
        Ok(())
    }

    fn set_free_weights(&mut self, direction: &Direction) {
        let x = &direction.alpha * self.lambda + &direction.beta;
        for (rank, slot) in self.set.in_vars().iter().enumerate() {
            self.weights[*slot] = x[rank];
        }
    }

    fn emit(&mut self) {
        let problem = self.problem();
        let n = problem.assets();
        let weights: Vec<f64> = self.weights.rows(0, n).iter().copied().collect();
        let portfolio =
            Portfolio::from_weights(weights, problem.expected_returns(), problem.covariance());
        let point = TurningPoint {
            portfolio,
            lambda: self.lambda,
            free_assets: self.set.free_assets(),
        };

        if let Some(last) = self.points.last_mut() {
            let same_mean = (last.portfolio.mean - point.portfolio.mean).abs()
                <= self.config.merge_tolerance * (1.0 + last.portfolio.mean.abs());
            let tied = (last.lambda - point.lambda).abs()
                <= self.config.tie_tolerance * last.lambda.abs().max(1.0);
            if same_mean || tied {
                trace!(lambda = point.lambda, "merging degenerate corner");
                self.diagnostics.merged_corners += 1;
                *last = point;
                return;
            }
        }

        debug!(
            lambda = point.lambda,
            mean = point.portfolio.mean,
            volatility = point.portfolio.volatility,
            free = ?point.free_assets,
            "turning point"
        );
        self.points.push(point);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use pretty_assertions::assert_eq;

    fn two_asset() -> Problem {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.01]);
        Problem::long_only(vec![0.10, 0.05], cov).unwrap()
    }

    fn three_asset() -> Problem {
        let v = [0.15, 0.20, 0.25];
        let rho = [[1.0, 0.3, 0.1], [0.3, 1.0, 0.5], [0.1, 0.5, 1.0]];
        let cov = DMatrix::from_fn(3, 3, |i, j| rho[i][j] * v[i] * v[j]);
        Problem::long_only(vec![0.10, 0.04, 0.07], cov).unwrap()
    }

    fn verifying() -> ClaConfig {
        ClaConfig {
            verify_inverse: true,
            ..ClaConfig::default()
        }
    }

    #[test]
    fn test_greedy_fill_long_only() {
        let (w, states, free) = greedy_fill(&three_asset());
        assert_eq!(free, Some(0));
        assert_eq!(w, vec![1.0, 0.0, 0.0]);
        assert_eq!(states, vec![BoundState::Low; 3]);
    }

    #[test]
    fn test_greedy_fill_respects_caps() {
        let p = Problem::with_uniform_bounds(
            vec![0.10, 0.04, 0.07],
            three_asset().covariance().clone(),
            0.1,
            0.5,
        )
        .unwrap();
        let (w, states, free) = greedy_fill(&p);
        // Asset 0 capped at 0.5, asset 2 takes the rest, asset 1 at floor.
        assert_eq!(free, Some(2));
        assert!((w[0] - 0.5).abs() < 1e-15);
        assert!((w[1] - 0.1).abs() < 1e-15);
        assert!((w[2] - 0.4).abs() < 1e-12);
        assert_eq!(states[0], BoundState::High);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_two_asset_frontier() {
        let frontier = compute_frontier_with(&two_asset(), &verifying()).unwrap();
        let points = frontier.turning_points();
        assert_eq!(points.len(), 2);

        let first = &points[0].portfolio;
        assert!((first.weights[0] - 1.0).abs() < 1e-12);
        assert!((first.mean - 0.10).abs() < 1e-12);
        assert!((first.volatility - 0.20).abs() < 1e-12);
        // Asset 1 becomes attractive once 0.05λ - 0.04 < 0.1λ - 0.08.
        assert!((points[0].lambda - 0.8).abs() < 1e-12);

        let last = &points[1];
        assert_eq!(last.lambda, 0.0);
        assert!((last.portfolio.weights[0] - 0.2).abs() < 1e-12);
        assert!((last.portfolio.weights[1] - 0.8).abs() < 1e-12);
        assert!((last.portfolio.variance() - 0.008).abs() < 1e-12);
        assert_eq!(last.free_assets, vec![0, 1]);
    }

    #[test]
    fn test_single_asset() {
        let p = Problem::new(
            vec![0.07],
            DMatrix::from_element(1, 1, 0.03),
            vec![0.0],
            vec![2.0],
        )
        .unwrap();
        let frontier = compute_frontier(&p).unwrap();
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier.max_return().portfolio.weights, vec![1.0]);
        assert_eq!(frontier.min_variance().lambda, 0.0);
    }

    #[test]
    fn test_pinned_budget_single_point() {
        let p = Problem::new(
            vec![0.10, 0.04, 0.07],
            three_asset().covariance().clone(),
            vec![0.2, 0.3, 0.5],
            vec![1.0, 1.0, 1.0],
        )
        .unwrap();
        let frontier = compute_frontier(&p).unwrap();
        assert_eq!(frontier.len(), 1);
        let w = &frontier.max_return().portfolio.weights;
        for (got, want) in w.iter().zip([0.2, 0.3, 0.5]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_three_asset_invariants() {
        let frontier = compute_frontier_with(&three_asset(), &verifying()).unwrap();
        let points = frontier.turning_points();
        assert!(points.len() >= 2);
        assert!((points[0].portfolio.weights[0] - 1.0).abs() < 1e-12);
        assert_eq!(points.last().unwrap().lambda, 0.0);
        for pair in points.windows(2) {
            assert!(pair[0].portfolio.mean > pair[1].portfolio.mean);
            assert!(pair[0].lambda > pair[1].lambda);
            assert!(pair[0].portfolio.volatility > pair[1].portfolio.volatility);
        }
        for tp in points {
            let total: f64 = tp.portfolio.weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(tp.portfolio.weights.iter().all(|w| *w >= -1e-9 && *w <= 1.0 + 1e-9));
        }
        assert!(frontier.diagnostics.max_inverse_drift < 1e-9);
    }

    #[test]
    fn test_fixed_asset_never_freed() {
        let p = Problem::new(
            vec![0.10, 0.04, 0.07],
            three_asset().covariance().clone(),
            vec![0.0, 0.25, 0.0],
            vec![1.0, 0.25, 1.0],
        )
        .unwrap();
        let frontier = compute_frontier_with(&p, &verifying()).unwrap();
        for tp in frontier.turning_points() {
            assert!(!tp.free_assets.contains(&1));
            assert!((tp.portfolio.weights[1] - 0.25).abs() < 1e-15);
        }
        assert!((frontier.max_return().portfolio.weights[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_iteration_cap_is_enforced() {
        let config = ClaConfig {
            max_iterations: Some(0),
            ..ClaConfig::default()
        };
        let err = compute_frontier_with(&three_asset(), &config).unwrap_err();
        assert!(matches!(err, FrontierError::ConvergenceFailure { .. }));
    }

    #[test]
    fn test_identical_risk_dominated_asset_stays_out() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.04, 0.04, 0.04]);
        let p = Problem::long_only(vec![0.10, 0.05], cov).unwrap();
        // Identical risk with different returns: the dominated asset never
        // enters, so the frontier is the single best asset.
        let frontier = compute_frontier(&p).unwrap();
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier.max_return().portfolio.weights, vec![1.0, 0.0]);
    }

    /// Three assets share the top return. The first corner is the
    /// least-variance mix of the tied assets, not the greedy fill.
    fn tied_top_returns() -> Problem {
        let cov = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.06, 0.03, 0.02, 0.01, //
                0.03, 0.03, 0.0, -0.005, //
                0.02, 0.0, 0.11, 0.07, //
                0.01, -0.005, 0.07, 0.0725,
            ],
        );
        Problem::long_only(vec![0.05, 0.0, 0.05, 0.05], cov).unwrap()
    }

    #[test]
    fn test_tied_top_returns_settle_before_first_corner() {
        let frontier = compute_frontier_with(&tied_top_returns(), &verifying()).unwrap();
        let points = frontier.turning_points();
        assert_eq!(points.len(), 3);

        let expected = [
            (7.0 / 15.0, [5.0 / 9.0, 0.0, 0.0, 4.0 / 9.0]),
            (7.0 / 65.0, [0.0, 25.0 / 39.0, 0.0, 14.0 / 39.0]),
            (0.0, [0.0, 31.0 / 45.0, 0.0, 14.0 / 45.0]),
        ];
        for (tp, (lambda, weights)) in points.iter().zip(expected) {
            assert!((tp.lambda - lambda).abs() < 1e-9, "lambda {} != {lambda}", tp.lambda);
            for (got, want) in tp.portfolio.weights.iter().zip(weights) {
                assert!((got - want).abs() < 1e-9, "weights {:?}", tp.portfolio.weights);
            }
        }
        assert_eq!(points[0].free_assets, vec![0, 3, 1]);
        assert!((points[0].portfolio.mean - 0.05).abs() < 1e-12);
        assert!(frontier.diagnostics.max_inverse_drift < 1e-9);
    }

    #[test]
    fn test_equal_returns_tie_by_index() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.01]);
        let p = Problem::long_only(vec![0.05, 0.05], cov).unwrap();
        let (w, _, free) = greedy_fill(&p);
        assert_eq!(free, Some(0));
        assert_eq!(w, vec![1.0, 0.0]);
        // Equal returns: the second asset enters before any finite lambda and
        // the whole frontier collapses to the min-variance mix.
        let frontier = compute_frontier(&p).unwrap();
        assert_eq!(frontier.len(), 1);
        assert!((frontier.min_variance().portfolio.weights[1] - 0.8).abs() < 1e-12);
    }
}
