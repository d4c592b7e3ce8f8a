// Canopy — Fractional Order Keys
//
// Allocates f64 sort keys between two neighbors so inserting never
// renumbers the rest of a scope. When no double fits between the
// neighbors the allocator says so instead of handing out a duplicate, and
// the caller renumbers the whole scope with `rebalanced()`.

/// Distance between a new edge key and the current first/last key.
pub const EDGE_STEP: f64 = 1.0;

/// Outcome of a key allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKey {
    /// A key strictly between the requested neighbors.
    Key(f64),
    /// Precision is exhausted (or the neighbors are unusable); the scope
    /// has to be renumbered before retrying.
    RebalanceRequired,
}

impl OrderKey {
    pub fn key(self) -> Option<f64> {
        match self {
            OrderKey::Key(k) => Some(k),
            OrderKey::RebalanceRequired => None,
        }
    }
}

/// Sibling position between `prev` and `next`.
/// `(None, None)` is the first child, `(Some, None)` appends, `(None, Some)` prepends.
pub fn position_after(prev: Option<f64>, next: Option<f64>) -> OrderKey {
    midpoint_or_edge(prev, next)
}

/// Global alphabetic index between two neighbors, same rules as positions.
pub fn alpha_index_between(prev: Option<f64>, next: Option<f64>) -> OrderKey {
    midpoint_or_edge(prev, next)
}

/// Message order after the current most recent message. Edge keys are
/// rounded down to whole numbers so a conversation drifts back to
/// integers after out-of-order arrivals.
pub fn order_after(last: Option<f64>) -> OrderKey {
    match last {
        None => OrderKey::Key(0.0),
        Some(last) => checked((last + EDGE_STEP).floor(), Some(last), None),
    }
}

/// Message order before the current least recent message.
pub fn order_before(first: Option<f64>) -> OrderKey {
    match first {
        None => OrderKey::Key(0.0),
        Some(first) => checked((first - EDGE_STEP).ceil(), None, Some(first)),
    }
}

/// Message order strictly between two adjacent messages.
pub fn order_between(a: f64, b: f64) -> OrderKey {
    midpoint_or_edge(Some(a), Some(b))
}

/// Integer-spaced keys for a scope of `len` entries, in their current order.
pub fn rebalanced(len: usize) -> Vec<f64> {
    (0..len).map(|i| i as f64 * EDGE_STEP).collect()
}

fn midpoint_or_edge(prev: Option<f64>, next: Option<f64>) -> OrderKey {
    match (prev, next) {
        (None, None) => OrderKey::Key(0.0),
        (Some(p), None) => checked(p + EDGE_STEP, prev, None),
        (None, Some(n)) => checked(n - EDGE_STEP, None, next),
        // Halving first cannot overflow; the difference form is exact where
        // halves of subnormals round away.
        (Some(p), Some(n)) => match checked(p / 2.0 + n / 2.0, prev, next) {
            OrderKey::RebalanceRequired => checked(p + (n - p) / 2.0, prev, next),
            key => key,
        },
    }
}

fn checked(candidate: f64, prev: Option<f64>, next: Option<f64>) -> OrderKey {
    let above = prev.map_or(true, |p| candidate > p);
    let below = next.map_or(true, |n| candidate < n);
    if candidate.is_finite() && above && below {
        OrderKey::Key(candidate)
    } else {
        OrderKey::RebalanceRequired
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
