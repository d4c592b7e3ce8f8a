// Canopy — Store Module
//
// The hierarchical item store: SQLite persistence, fractional order keys,
// the soft-delete bin and per-conversation message ordering. Sealed
// columns arrive already encrypted; only the message engine opens
// anything, and only the sent-at stamps it orders by.

mod clock;
mod db;
mod error;
mod ids;
mod items;
mod locks;
mod messages;
mod models;
pub mod order;
mod trash;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{Database, BUSY_TIMEOUT, POOL_SIZE};
pub use error::StoreError;
pub use ids::{IdAllocator, RandomIds, SequentialIds};
pub use items::{ItemStore, SqliteItemStore};
pub use locks::{OrderScope, ScopeGuard, ScopeLocks};
pub use messages::MessageOrderEngine;
pub use models::{
    AlphaPlacement, Item, ItemSummary, Message, MessageSummary, NewItem, Resealed, SiblingPlacement,
};
pub use order::OrderKey;
pub use trash::{Restored, TrashEngine};
