use serde::{Deserialize, Serialize};

/// Where a slot currently sits relative to its box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundState {
    /// Pinned at the lower bound.
    Low,
    /// Pinned at the upper bound.
    High,
    /// Free: its value is solved for from the KKT system.
    In,
}

/// Ordered set of slot indices with O(1) membership and rank lookup.
///
/// Order is insertion order and removal keeps the relative order of the
/// survivors, so ranks line up with the rows of the KKT inverse.
#[derive(Debug, Clone)]
struct IndexSet {
    items: Vec<usize>,
    ranks: Vec<Option<usize>>,
}

impl IndexSet {
    fn with_capacity(slots: usize) -> Self {
        Self {
            items: Vec::with_capacity(slots),
            ranks: vec![None; slots],
        }
    }

    fn contains(&self, slot: usize) -> bool {
        self.ranks[slot].is_some()
    }

    fn rank(&self, slot: usize) -> Option<usize> {
        self.ranks[slot]
    }

    fn push(&mut self, slot: usize) {
        debug_assert!(self.ranks[slot].is_none());
        self.ranks[slot] = Some(self.items.len());
        self.items.push(slot);
    }

    fn remove(&mut self, slot: usize) -> Option<usize> {
        let rank = self.ranks[slot].take()?;
        self.items.remove(rank);
        for (r, s) in self.items.iter().enumerate().skip(rank) {
            self.ranks[*s] = Some(r);
        }
        Some(rank)
    }
}

/// Partition of the `variables + constraints` slots into a free (IN) set and
/// a bounded (OUT) set.
///
/// Slots `0..variables` are assets; slots `variables..` are the Lagrange
/// multipliers of the equality constraints. Constraint slots start IN and,
/// once sent OUT, leave circulation for good.
#[derive(Debug, Clone)]
pub struct ActiveSet {
    variables: usize,
    constraints: usize,
    states: Vec<BoundState>,
    in_vars: IndexSet,
    out_vars: IndexSet,
}

impl ActiveSet {
    /// Every variable starts OUT at the given side; every constraint slot
    /// starts IN.
    pub fn new(initial: &[BoundState], constraints: usize) -> Self {
        let variables = initial.len();
        let slots = variables + constraints;
        let mut set = Self {
            variables,
            constraints,
            states: Vec::with_capacity(slots),
            in_vars: IndexSet::with_capacity(slots),
            out_vars: IndexSet::with_capacity(slots),
        };
        for (j, state) in initial.iter().enumerate() {
            assert!(
                *state != BoundState::In,
                "variable {j} must start bounded; free it with go_in"
            );
            set.states.push(*state);
            set.out_vars.push(j);
        }
        for c in 0..constraints {
            set.states.push(BoundState::In);
            set.in_vars.push(variables + c);
        }
        set
    }

    pub fn variables(&self) -> usize {
        self.variables
    }

    pub fn constraints(&self) -> usize {
        self.constraints
    }

    pub fn is_variable(&self, slot: usize) -> bool {
        slot < self.variables
    }

    /// Move `slot` from OUT to IN. The caller owns the matching KKT inverse
    /// update.
    pub fn go_in(&mut self, slot: usize) {
        assert!(
            self.out_vars.contains(slot) && !self.in_vars.contains(slot),
            "go_in({slot}): slot is not OUT"
        );
        self.out_vars.remove(slot);
        self.in_vars.push(slot);
        self.states[slot] = BoundState::In;
    }

    /// Move `slot` from IN to OUT, clipped at `side`. Returns the rank the
    /// slot held in the IN set so the caller can drop the same row and
    /// column from the KKT inverse.
    pub fn go_out(&mut self, slot: usize, side: BoundState) -> usize {
        assert!(side != BoundState::In, "go_out({slot}): side must be Low or High");
        let Some(rank) = self.in_vars.remove(slot) else {
            panic!("go_out({slot}): slot is not IN");
        };
        self.states[slot] = side;
        if self.is_variable(slot) {
            self.out_vars.push(slot);
        }
        rank
    }

    pub fn state(&self, slot: usize) -> BoundState {
        self.states[slot]
    }

    pub fn is_in(&self, slot: usize) -> bool {
        self.states[slot] == BoundState::In
    }

    pub fn is_up(&self, slot: usize) -> bool {
        self.states[slot] == BoundState::High
    }

    pub fn is_lo(&self, slot: usize) -> bool {
        self.states[slot] == BoundState::Low
    }

    /// Rank of `slot` within the IN set, which is also its row in the KKT
    /// inverse.
    pub fn in_position(&self, slot: usize) -> Option<usize> {
        self.in_vars.rank(slot)
    }

    pub fn in_var(&self, rank: usize) -> usize {
        self.in_vars.items[rank]
    }

    pub fn out_var(&self, rank: usize) -> usize {
        self.out_vars.items[rank]
    }

    pub fn in_len(&self) -> usize {
        self.in_vars.items.len()
    }

    pub fn out_len(&self) -> usize {
        self.out_vars.items.len()
    }

    pub fn in_vars(&self) -> &[usize] {
        &self.in_vars.items
    }

    pub fn out_vars(&self) -> &[usize] {
        &self.out_vars.items
    }

    /// Free asset indices in IN-set order.
    pub fn free_assets(&self) -> Vec<usize> {
        self.in_vars
            .items
            .iter()
            .copied()
            .filter(|s| self.is_variable(*s))
            .collect()
    }
}
