// Canopy — Id allocation

use parking_lot::Mutex;
use uuid::Uuid;

pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> Uuid;
}

/// Random v4 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdAllocator for RandomIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic ids counting up from a seed, so a replayed sequence of
/// operations produces the same rows.
#[derive(Debug)]
pub struct SequentialIds {
    next: Mutex<u128>,
}

impl SequentialIds {
    pub fn starting_at(seed: u128) -> Self {
        Self {
            next: Mutex::new(seed),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdAllocator for SequentialIds {
    fn next_id(&self) -> Uuid {
        let mut next = self.next.lock();
        let id = Uuid::from_u128(*next);
        *next += 1;
        id
    }
}
