// Canopy — Scope Locks
//
// One mutex per order-key scope: the siblings of a parent, a single
// conversation, and the global alphabet. Writers take every scope they
// allocate in before opening their transaction, always in sorted order, so
// two writers can never wait on each other in a cycle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use uuid::Uuid;

/// Entries nobody holds are dropped once the table grows past this.
const PRUNE_THRESHOLD: usize = 256;

/// A set of keys that must stay unique among themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderScope {
    /// alpha_index across every item.
    Alphabet,
    /// position among items sharing one parent_id (`None` = top level).
    Siblings(Option<Uuid>),
    /// order among the messages of one contact.
    Conversation(Uuid),
}

#[derive(Default)]
pub struct ScopeLocks {
    table: Mutex<HashMap<OrderScope, Arc<Mutex<()>>>>,
}

/// Held scopes; released together on drop.
pub struct ScopeGuard {
    _guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every scope in `scopes` is held. Duplicates are ignored.
    ///
    /// Idle entries are dropped whenever the table has grown past
    /// `PRUNE_THRESHOLD`, so it never holds more than that many idle scopes
    /// plus the ones currently requested or held.
    pub fn acquire(&self, scopes: &[OrderScope]) -> ScopeGuard {
        let mut scopes = scopes.to_vec();
        scopes.sort();
        scopes.dedup();

        let mutexes: Vec<Arc<Mutex<()>>> = {
            let mut table = self.table.lock();
            if table.len() > PRUNE_THRESHOLD {
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            scopes
                .iter()
                .map(|scope| Arc::clone(table.entry(*scope).or_default()))
                .collect()
        };

        // The table lock is released before blocking on any scope.
        let guards = mutexes.iter().map(|m| m.lock_arc()).collect();

        ScopeGuard { _guards: guards }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
