// Shared fixtures for store tests.

use std::cmp::Ordering;

use chrono::DateTime;
use uuid::Uuid;

use super::clock::ManualClock;
use super::db::Database;
use super::ids::SequentialIds;
use super::items::{ItemStore, SqliteItemStore};
use super::models::{Item, NewItem};
use super::trash::TrashEngine;
use super::StoreError;

/// 2024-01-01T00:00:00Z
pub(crate) const START_MILLIS: i64 = 1_704_067_200_000;

/// In-memory store with a manual clock and sequential ids. Item "names"
/// are stored as raw UTF-8 so tests can compare them without a cipher.
pub(crate) struct Fixture {
    pub db: Database,
    pub clock: ManualClock,
    pub ids: SequentialIds,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            db: Database::open_in_memory().expect("in-memory database"),
            clock: ManualClock::new(
                DateTime::from_timestamp_millis(START_MILLIS).expect("valid start"),
            ),
            ids: SequentialIds::default(),
        }
    }

    pub fn items(&self) -> SqliteItemStore<'_> {
        SqliteItemStore::new(&self.db, &self.clock, &self.ids)
    }

    pub fn trash(&self) -> TrashEngine<'_> {
        TrashEngine::new(&self.db, &self.clock)
    }

    /// Insert `name` as the last child of `parent`, placed alphabetically.
    pub fn add(&self, parent: Option<Uuid>, name: &str) -> Uuid {
        let store = self.items();
        let alpha = store.locate_alpha(&mut by_name(name)).expect("locate");
        let id = store.allocate_id();
        store
            .insert(NewItem::new(id, name.as_bytes().to_vec()).under(parent).alpha(alpha))
            .expect("insert");
        id
    }

    pub fn get(&self, id: &Uuid) -> Item {
        self.items().get(id).expect("read").expect("item exists")
    }
}

pub(crate) fn name_of(item: &Item) -> String {
    String::from_utf8_lossy(&item.enc_name).into_owned()
}

pub(crate) fn by_name(name: &str) -> impl FnMut(&Item) -> Result<Ordering, StoreError> + '_ {
    move |candidate| Ok(name.cmp(name_of(candidate).as_str()))
}
