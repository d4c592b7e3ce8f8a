// Canopy — Item Store
//
// CRUD and hierarchy queries over the vault tree. Sibling positions and the
// global alphabetic index are fractional keys; every allocation happens
// inside the write transaction while the matching scope lock is held, and
// a scope whose keys ran out of precision is renumbered in the same
// transaction.
//
// Names are sealed: the store never decrypts them. Alphabetic placement is
// decided by the caller through `locate_alpha`, which binary-searches the
// stored order with a comparator that opens names on the caller's side.

use std::cmp::Ordering;
use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use uuid::Uuid;

use super::clock::Clock;
use super::db::Database;
use super::ids::IdAllocator;
use super::locks::OrderScope;
use super::models::{
    from_millis, opt_id, parse_opt_uuid, parse_uuid, to_millis, AlphaPlacement, Item, NewItem,
    Resealed, SiblingPlacement,
};
use super::order::{self, OrderKey};
use super::StoreError;

/// Column list matching `row_to_item`.
pub(super) const ITEM_COLUMNS: &str = "items.id, items.parent_id, items.deleted_parent_id, \
     items.deleted_at, items.is_favorite, items.position, items.alpha_index, items.consulted_at, \
     items.created_at, items.updated_at, items.enc_name, items.enc_color, items.icon_id";

/// Recursion bound for tree walks in SQL.
pub(super) const MAX_DEPTH: i64 = 4096;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the item tree.
pub trait ItemStore {
    /// Allocate the id for an item about to be inserted. Names are sealed
    /// to this id before `insert` is called.
    fn allocate_id(&self) -> Uuid;

    /// Insert a new item. The parent must exist and not be in the bin.
    fn insert(&self, new_item: NewItem) -> Result<Item, StoreError>;

    /// Find where an item belongs in the global alphabetic order.
    ///
    /// `cmp` receives stored items and returns how the new name orders
    /// against that item's name. Equal names go after the existing ones.
    fn locate_alpha(
        &self,
        cmp: &mut dyn FnMut(&Item) -> Result<Ordering, StoreError>,
    ) -> Result<AlphaPlacement, StoreError>;

    /// Reparent an item, appending it after its new siblings.
    fn move_item(&self, item_id: &Uuid, new_parent_id: Option<Uuid>) -> Result<Item, StoreError>;

    /// Flip the favorite flag. Returns the new value.
    fn toggle_favorite(&self, item_id: &Uuid) -> Result<bool, StoreError>;

    /// Replace the sealed name and move the item to `alpha` in the global order.
    fn rename(&self, item_id: &Uuid, enc_name: Vec<u8>, alpha: AlphaPlacement) -> Result<(), StoreError>;

    fn set_icon(&self, item_id: &Uuid, icon_id: Option<Uuid>) -> Result<(), StoreError>;

    fn set_color(&self, item_id: &Uuid, enc_color: Option<Vec<u8>>) -> Result<(), StoreError>;

    /// Record that the item was just opened.
    fn touch_consulted(&self, item_id: &Uuid) -> Result<(), StoreError>;

    fn get(&self, item_id: &Uuid) -> Result<Option<Item>, StoreError>;

    /// The item and its live descendants, parents before children. Empty
    /// when the item is missing or in the bin.
    fn find_with_descendants(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError>;

    /// The item and its live ancestors, root first. The walk stops at the
    /// first ancestor in the bin.
    fn find_with_ancestors(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError>;

    /// Highest position among all children of `parent_id`, binned ones included.
    fn highest_position(&self, parent_id: Option<Uuid>) -> Result<Option<f64>, StoreError>;

    /// Closest position above the item's among its siblings, if any.
    fn next_sibling_position(&self, item_id: &Uuid) -> Result<Option<f64>, StoreError>;

    fn count_children(&self, parent_id: Option<Uuid>, include_deleted: bool) -> Result<usize, StoreError>;

    /// Live children in position order.
    fn children(&self, parent_id: Option<Uuid>) -> Result<Vec<Item>, StoreError>;

    /// Favorites, most recently updated first.
    fn favorites(&self) -> Result<Vec<Item>, StoreError>;

    fn count_favorites(&self) -> Result<usize, StoreError>;

    /// Live items most recently consulted first.
    fn last_consulted(&self, limit: usize) -> Result<Vec<Item>, StoreError>;

    /// Every stored item, binned ones included.
    fn count(&self) -> Result<usize, StoreError>;

    /// The `index`-th item in global alphabetic order.
    fn item_at(&self, index: usize) -> Result<Option<Item>, StoreError>;

    /// Lowest and highest alpha_index in use.
    fn alpha_index_range(&self) -> Result<Option<(f64, f64)>, StoreError>;

    /// Copy a live item and its live descendants. The copy lands directly
    /// after the original among its siblings; descendants keep their
    /// relative positions under the copied parents.
    ///
    /// `reseal` receives each source item and the id its copy will get, and
    /// returns the copy's sealed fields. It runs before the write starts.
    fn duplicate(
        &self,
        item_id: &Uuid,
        reseal: &mut dyn FnMut(&Item, &Uuid) -> Result<Resealed, StoreError>,
    ) -> Result<Item, StoreError>;
}

// ─── SQLite Implementation ──────────────────────────────────────────────────

pub struct SqliteItemStore<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
    ids: &'a dyn IdAllocator,
}

impl<'a> SqliteItemStore<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock, ids: &'a dyn IdAllocator) -> Self {
        Self { db, clock, ids }
    }
}

impl ItemStore for SqliteItemStore<'_> {
    fn allocate_id(&self) -> Uuid {
        self.ids.next_id()
    }

    fn insert(&self, new_item: NewItem) -> Result<Item, StoreError> {
        let now = self.clock.now();
        let scopes = [OrderScope::Siblings(new_item.parent_id), OrderScope::Alphabet];

        let item = self.db.write(&scopes, |tx| {
            if get_item(tx, &new_item.id)?.is_some() {
                return Err(StoreError::PreconditionViolation(format!(
                    "item id {} is already in use",
                    new_item.id
                )));
            }
            if let Some(parent_id) = new_item.parent_id {
                require_live_parent(tx, &parent_id)?;
            }

            let position = allocate_position(tx, new_item.parent_id, new_item.placement)?;
            let alpha_index = allocate_alpha(tx, new_item.alpha, None)?;

            let item = Item {
                id: new_item.id,
                parent_id: new_item.parent_id,
                deleted_parent_id: None,
                deleted_at: None,
                is_favorite: new_item.is_favorite,
                position,
                alpha_index,
                consulted_at: None,
                created_at: now,
                updated_at: now,
                enc_name: new_item.enc_name,
                enc_color: new_item.enc_color,
                icon_id: new_item.icon_id,
            };

            insert_row(tx, &item)?;
            Ok(item)
        })?;

        tracing::info!(item_id = %item.id, parent_id = ?item.parent_id, "Item created");
        Ok(item)
    }

    fn locate_alpha(
        &self,
        cmp: &mut dyn FnMut(&Item) -> Result<Ordering, StoreError>,
    ) -> Result<AlphaPlacement, StoreError> {
        // Upper bound: first stored item the new name sorts strictly before.
        let (mut lo, mut hi) = (0usize, self.count()?);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.item_at(mid)? {
                Some(candidate) if cmp(&candidate)? != Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }

        if lo == 0 {
            return Ok(AlphaPlacement::First);
        }
        Ok(match self.item_at(lo - 1)? {
            Some(prev) => AlphaPlacement::After(prev.id),
            None => AlphaPlacement::Last,
        })
    }

    fn move_item(&self, item_id: &Uuid, new_parent_id: Option<Uuid>) -> Result<Item, StoreError> {
        let now = self.clock.now();

        let moved = self.db.write(&[OrderScope::Siblings(new_parent_id)], |tx| {
            let mut item = require_item(tx, item_id)?;
            if item.is_deleted() {
                return Err(StoreError::PreconditionViolation(format!(
                    "item {item_id} is in the bin"
                )));
            }
            if item.parent_id == new_parent_id {
                return Ok(item);
            }
            if let Some(parent_id) = new_parent_id {
                if is_structural_ancestor(tx, item_id, &parent_id)? {
                    return Err(StoreError::PreconditionViolation(format!(
                        "moving {item_id} under {parent_id} would create a cycle"
                    )));
                }
                require_live_parent(tx, &parent_id)?;
            }

            let position = allocate_position(tx, new_parent_id, SiblingPlacement::Last)?;
            tx.execute(
                "UPDATE items SET parent_id = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
                params![opt_id(new_parent_id), position, to_millis(now), item_id.to_string()],
            )?;

            item.parent_id = new_parent_id;
            item.position = position;
            item.updated_at = now;
            Ok(item)
        })?;

        tracing::info!(item_id = %item_id, parent_id = ?new_parent_id, "Item moved");
        Ok(moved)
    }

    fn toggle_favorite(&self, item_id: &Uuid) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.db.write(&[], |tx| {
            let item = require_item(tx, item_id)?;
            if item.is_deleted() {
                return Err(StoreError::PreconditionViolation(format!(
                    "item {item_id} is in the bin"
                )));
            }
            tx.execute(
                "UPDATE items SET is_favorite = NOT is_favorite, updated_at = ?1 WHERE id = ?2",
                params![to_millis(now), item_id.to_string()],
            )?;
            Ok(!item.is_favorite)
        })
    }

    fn rename(&self, item_id: &Uuid, enc_name: Vec<u8>, alpha: AlphaPlacement) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.db.write(&[OrderScope::Alphabet], |tx| {
            let item = require_item(tx, item_id)?;
            let alpha_index = match alpha {
                AlphaPlacement::After(anchor) if anchor == *item_id => item.alpha_index,
                _ => allocate_alpha(tx, alpha, Some(item_id))?,
            };
            tx.execute(
                "UPDATE items SET enc_name = ?1, alpha_index = ?2, updated_at = ?3 WHERE id = ?4",
                params![enc_name, alpha_index, to_millis(now), item_id.to_string()],
            )?;
            Ok(())
        })?;

        tracing::info!(item_id = %item_id, "Item renamed");
        Ok(())
    }

    fn set_icon(&self, item_id: &Uuid, icon_id: Option<Uuid>) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.update_one(
            item_id,
            "UPDATE items SET icon_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![opt_id(icon_id), to_millis(now), item_id.to_string()],
        )
    }

    fn set_color(&self, item_id: &Uuid, enc_color: Option<Vec<u8>>) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.update_one(
            item_id,
            "UPDATE items SET enc_color = ?1, updated_at = ?2 WHERE id = ?3",
            params![enc_color, to_millis(now), item_id.to_string()],
        )
    }

    fn touch_consulted(&self, item_id: &Uuid) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.update_one(
            item_id,
            "UPDATE items SET consulted_at = ?1 WHERE id = ?2",
            params![to_millis(now), item_id.to_string()],
        )
    }

    fn get(&self, item_id: &Uuid) -> Result<Option<Item>, StoreError> {
        self.db.read(|conn| get_item(conn, item_id))
    }

    fn find_with_descendants(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "WITH RECURSIVE subtree(id, depth) AS (
                SELECT id, 0 FROM items WHERE id = ?1 AND deleted_at IS NULL
                UNION
                SELECT items.id, subtree.depth + 1
                FROM items JOIN subtree ON items.parent_id = subtree.id
                WHERE items.deleted_at IS NULL AND subtree.depth < ?2
            )
            SELECT {ITEM_COLUMNS} FROM items JOIN subtree ON items.id = subtree.id
            ORDER BY subtree.depth, items.position, items.id"
        );
        self.db
            .read(|conn| query_items(conn, &sql, params![item_id.to_string(), MAX_DEPTH]))
    }

    fn find_with_ancestors(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "WITH RECURSIVE chain(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM items WHERE id = ?1
                UNION
                SELECT items.id, items.parent_id, chain.depth + 1
                FROM items JOIN chain ON items.id = chain.parent_id
                WHERE items.deleted_at IS NULL AND chain.depth < ?2
            )
            SELECT {ITEM_COLUMNS} FROM items JOIN chain ON items.id = chain.id
            ORDER BY chain.depth DESC"
        );
        self.db
            .read(|conn| query_items(conn, &sql, params![item_id.to_string(), MAX_DEPTH]))
    }

    fn highest_position(&self, parent_id: Option<Uuid>) -> Result<Option<f64>, StoreError> {
        self.db.read(|conn| highest_position(conn, parent_id))
    }

    fn next_sibling_position(&self, item_id: &Uuid) -> Result<Option<f64>, StoreError> {
        self.db.read(|conn| {
            let item = require_item(conn, item_id)?;
            next_sibling_position(conn, item.parent_id, item.position)
        })
    }

    fn count_children(&self, parent_id: Option<Uuid>, include_deleted: bool) -> Result<usize, StoreError> {
        self.db.read(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM items WHERE parent_id IS ?1 AND (?2 OR deleted_at IS NULL)",
                params![opt_id(parent_id), include_deleted],
            )
        })
    }

    fn children(&self, parent_id: Option<Uuid>) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE parent_id IS ?1 AND deleted_at IS NULL
             ORDER BY position, id"
        );
        self.db.read(|conn| query_items(conn, &sql, params![opt_id(parent_id)]))
    }

    fn favorites(&self) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE is_favorite = 1 AND deleted_at IS NULL
             ORDER BY updated_at DESC, id"
        );
        self.db.read(|conn| query_items(conn, &sql, []))
    }

    fn count_favorites(&self) -> Result<usize, StoreError> {
        self.db.read(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM items WHERE is_favorite = 1 AND deleted_at IS NULL",
                [],
            )
        })
    }

    fn last_consulted(&self, limit: usize) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE deleted_at IS NULL AND consulted_at IS NOT NULL
             ORDER BY consulted_at DESC, id
             LIMIT ?1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.read(|conn| query_items(conn, &sql, params![limit]))
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.db
            .read(|conn| count(conn, "SELECT COUNT(*) FROM items", []))
    }

    fn item_at(&self, index: usize) -> Result<Option<Item>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             ORDER BY alpha_index, id
             LIMIT 1 OFFSET ?1"
        );
        let Ok(offset) = i64::try_from(index) else {
            return Ok(None);
        };
        self.db.read(|conn| {
            Ok(conn
                .query_row(&sql, params![offset], row_to_item)
                .optional()?)
        })
    }

    fn alpha_index_range(&self) -> Result<Option<(f64, f64)>, StoreError> {
        self.db.read(|conn| {
            let (min, max): (Option<f64>, Option<f64>) = conn.query_row(
                "SELECT MIN(alpha_index), MAX(alpha_index) FROM items",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(min.zip(max))
        })
    }

    fn duplicate(
        &self,
        item_id: &Uuid,
        reseal: &mut dyn FnMut(&Item, &Uuid) -> Result<Resealed, StoreError>,
    ) -> Result<Item, StoreError> {
        let source = self.find_with_descendants(item_id)?;
        let Some(root) = source.first() else {
            return Err(match self.get(item_id)? {
                Some(_) => {
                    StoreError::PreconditionViolation(format!("item {item_id} is in the bin"))
                }
                None => StoreError::NotFound(format!("item {item_id}")),
            });
        };
        let parent_id = root.parent_id;

        let new_ids: Vec<Uuid> = source.iter().map(|_| self.ids.next_id()).collect();
        let mapped: HashMap<Uuid, Uuid> = source
            .iter()
            .map(|item| item.id)
            .zip(new_ids.iter().copied())
            .collect();
        let mut sealed = Vec::with_capacity(source.len());
        for (item, new_id) in source.iter().zip(&new_ids) {
            sealed.push(reseal(item, new_id)?);
        }

        let now = self.clock.now();
        let scopes = [OrderScope::Siblings(parent_id), OrderScope::Alphabet];
        let copy = self.db.write(&scopes, |tx| {
            let current = require_item(tx, item_id)?;
            if current.is_deleted() || current.parent_id != parent_id {
                return Err(StoreError::TransactionAborted(format!(
                    "item {item_id} changed while it was being copied"
                )));
            }

            let mut copies = Vec::with_capacity(source.len());
            for ((item, new_id), fields) in source.iter().zip(&new_ids).zip(sealed) {
                let (parent, position) = if item.id == *item_id {
                    let placement = SiblingPlacement::After(*item_id);
                    (parent_id, allocate_position(tx, parent_id, placement)?)
                } else {
                    (item.parent_id.and_then(|p| mapped.get(&p).copied()), item.position)
                };
                let copy = Item {
                    id: *new_id,
                    parent_id: parent,
                    deleted_parent_id: None,
                    deleted_at: None,
                    is_favorite: false,
                    position,
                    alpha_index: allocate_alpha(tx, fields.alpha, None)?,
                    consulted_at: None,
                    created_at: now,
                    updated_at: now,
                    enc_name: fields.enc_name,
                    enc_color: fields.enc_color,
                    icon_id: item.icon_id,
                };
                insert_row(tx, &copy)?;
                copies.push(copy);
            }
            copies
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::InvalidData(format!("nothing copied from {item_id}")))
        })?;

        tracing::info!(item_id = %item_id, copy_id = %copy.id, items = source.len(), "Item duplicated");
        Ok(copy)
    }
}

impl SqliteItemStore<'_> {
    /// Single-row field update; unknown ids are NotFound.
    fn update_one<P: Params>(&self, item_id: &Uuid, sql: &str, params: P) -> Result<(), StoreError> {
        let changed = self.db.write(&[], |tx| Ok(tx.execute(sql, params)?))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("item {item_id}")));
        }
        Ok(())
    }
}

// ─── Row mapping and shared queries ─────────────────────────────────────────

/// Parse an item row selected with `ITEM_COLUMNS`.
pub(super) fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let id: String = row.get(0)?;
    let parent_id: Option<String> = row.get(1)?;
    let deleted_parent_id: Option<String> = row.get(2)?;
    let deleted_at: Option<i64> = row.get(3)?;
    let consulted_at: Option<i64> = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let updated_at: i64 = row.get(9)?;
    let icon_id: Option<String> = row.get(12)?;

    Ok(Item {
        id: parse_uuid(0, &id)?,
        parent_id: parse_opt_uuid(1, parent_id)?,
        deleted_parent_id: parse_opt_uuid(2, deleted_parent_id)?,
        deleted_at: deleted_at.map(|ms| from_millis(3, ms)).transpose()?,
        is_favorite: row.get(4)?,
        position: row.get(5)?,
        alpha_index: row.get(6)?,
        consulted_at: consulted_at.map(|ms| from_millis(7, ms)).transpose()?,
        created_at: from_millis(8, created_at)?,
        updated_at: from_millis(9, updated_at)?,
        enc_name: row.get(10)?,
        enc_color: row.get(11)?,
        icon_id: parse_opt_uuid(12, icon_id)?,
    })
}

pub(super) fn query_items<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Item>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map(params, row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub(super) fn count<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    usize::try_from(n).map_err(|_| StoreError::InvalidData(format!("negative count {n}")))
}

pub(super) fn get_item(conn: &Connection, item_id: &Uuid) -> Result<Option<Item>, StoreError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![item_id.to_string()], row_to_item)
        .optional()?)
}

fn insert_row(conn: &Connection, item: &Item) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO items (id, parent_id, deleted_parent_id, deleted_at, is_favorite,
         position, alpha_index, consulted_at, created_at, updated_at, enc_name, enc_color, icon_id)
         VALUES (?1, ?2, NULL, NULL, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?10)",
        params![
            item.id.to_string(),
            opt_id(item.parent_id),
            item.is_favorite,
            item.position,
            item.alpha_index,
            to_millis(item.created_at),
            to_millis(item.updated_at),
            item.enc_name,
            item.enc_color,
            opt_id(item.icon_id),
        ],
    )?;
    Ok(())
}

pub(super) fn require_item(conn: &Connection, item_id: &Uuid) -> Result<Item, StoreError> {
    get_item(conn, item_id)?.ok_or_else(|| StoreError::NotFound(format!("item {item_id}")))
}

fn require_live_parent(conn: &Connection, parent_id: &Uuid) -> Result<(), StoreError> {
    match get_item(conn, parent_id)? {
        None => Err(StoreError::PreconditionViolation(format!(
            "parent {parent_id} does not exist"
        ))),
        Some(parent) if parent.is_deleted() => Err(StoreError::PreconditionViolation(format!(
            "parent {parent_id} is in the bin"
        ))),
        Some(_) => Ok(()),
    }
}

/// True when `ancestor` is `item` itself or sits on its parent_id chain,
/// binned links included.
fn is_structural_ancestor(conn: &Connection, ancestor: &Uuid, item: &Uuid) -> Result<bool, StoreError> {
    let found: i64 = conn.query_row(
        "WITH RECURSIVE chain(id, parent_id) AS (
            SELECT id, parent_id FROM items WHERE id = ?1
            UNION
            SELECT items.id, items.parent_id
            FROM items JOIN chain ON items.id = chain.parent_id
        )
        SELECT EXISTS(SELECT 1 FROM chain WHERE id = ?2)",
        params![item.to_string(), ancestor.to_string()],
        |row| row.get(0),
    )?;
    Ok(found != 0)
}

pub(super) fn highest_position(conn: &Connection, parent_id: Option<Uuid>) -> Result<Option<f64>, StoreError> {
    Ok(conn.query_row(
        "SELECT MAX(position) FROM items WHERE parent_id IS ?1",
        params![opt_id(parent_id)],
        |row| row.get(0),
    )?)
}

fn next_sibling_position(
    conn: &Connection,
    parent_id: Option<Uuid>,
    position: f64,
) -> Result<Option<f64>, StoreError> {
    Ok(conn.query_row(
        "SELECT MIN(position) FROM items WHERE parent_id IS ?1 AND position > ?2",
        params![opt_id(parent_id), position],
        |row| row.get(0),
    )?)
}

// ─── Key allocation ─────────────────────────────────────────────────────────

/// Allocate a sibling position under `parent_id`. Must run inside a write
/// holding `OrderScope::Siblings(parent_id)`.
pub(super) fn allocate_position(
    conn: &Connection,
    parent_id: Option<Uuid>,
    placement: SiblingPlacement,
) -> Result<f64, StoreError> {
    let neighbors = |conn: &Connection| -> Result<(Option<f64>, Option<f64>), StoreError> {
        match placement {
            SiblingPlacement::Last => Ok((highest_position(conn, parent_id)?, None)),
            SiblingPlacement::After(sibling_id) => {
                let sibling = require_item(conn, &sibling_id)?;
                if sibling.parent_id != parent_id {
                    return Err(StoreError::PreconditionViolation(format!(
                        "{sibling_id} is not a sibling under {parent_id:?}"
                    )));
                }
                let next = next_sibling_position(conn, parent_id, sibling.position)?;
                Ok((Some(sibling.position), next))
            }
        }
    };

    let (prev, next) = neighbors(conn)?;
    if let OrderKey::Key(position) = order::position_after(prev, next) {
        return Ok(position);
    }

    rebalance_siblings(conn, parent_id)?;
    let (prev, next) = neighbors(conn)?;
    order::position_after(prev, next).key().ok_or_else(|| {
        StoreError::InvalidData(format!("no position fits under {parent_id:?} after rebalance"))
    })
}

/// Allocate an alpha_index for `placement`, ignoring `exclude` (the item
/// being renamed). Must run holding `OrderScope::Alphabet`.
fn allocate_alpha(
    conn: &Connection,
    placement: AlphaPlacement,
    exclude: Option<&Uuid>,
) -> Result<f64, StoreError> {
    let exclude = exclude.map(Uuid::to_string).unwrap_or_default();
    let neighbors = |conn: &Connection| -> Result<(Option<f64>, Option<f64>), StoreError> {
        let min_above = |floor: Option<f64>| -> Result<Option<f64>, StoreError> {
            Ok(conn.query_row(
                "SELECT MIN(alpha_index) FROM items WHERE id != ?1 AND (?2 IS NULL OR alpha_index > ?2)",
                params![exclude, floor],
                |row| row.get(0),
            )?)
        };
        match placement {
            AlphaPlacement::First => Ok((None, min_above(None)?)),
            AlphaPlacement::Last => {
                let max: Option<f64> = conn.query_row(
                    "SELECT MAX(alpha_index) FROM items WHERE id != ?1",
                    params![exclude],
                    |row| row.get(0),
                )?;
                Ok((max, None))
            }
            AlphaPlacement::After(anchor_id) => {
                let anchor = get_item(conn, &anchor_id)?.ok_or_else(|| {
                    StoreError::PreconditionViolation(format!(
                        "alphabetic anchor {anchor_id} does not exist"
                    ))
                })?;
                Ok((Some(anchor.alpha_index), min_above(Some(anchor.alpha_index))?))
            }
        }
    };

    let (prev, next) = neighbors(conn)?;
    if let OrderKey::Key(index) = order::alpha_index_between(prev, next) {
        return Ok(index);
    }

    rebalance_alphabet(conn)?;
    let (prev, next) = neighbors(conn)?;
    order::alpha_index_between(prev, next)
        .key()
        .ok_or_else(|| StoreError::InvalidData("no alpha index fits after rebalance".into()))
}

/// Renumber every sibling under `parent_id` (binned ones included) to
/// integer positions, keeping their order.
fn rebalance_siblings(conn: &Connection, parent_id: Option<Uuid>) -> Result<(), StoreError> {
    let ids = select_ids(
        conn,
        "SELECT id FROM items WHERE parent_id IS ?1 ORDER BY position, id",
        params![opt_id(parent_id)],
    )?;
    let mut stmt = conn.prepare("UPDATE items SET position = ?1 WHERE id = ?2")?;
    for (id, position) in ids.iter().zip(order::rebalanced(ids.len())) {
        stmt.execute(params![position, id])?;
    }
    tracing::debug!(parent_id = ?parent_id, siblings = ids.len(), "Rebalanced sibling positions");
    Ok(())
}

fn rebalance_alphabet(conn: &Connection) -> Result<(), StoreError> {
    let ids = select_ids(conn, "SELECT id FROM items ORDER BY alpha_index, id", [])?;
    let mut stmt = conn.prepare("UPDATE items SET alpha_index = ?1 WHERE id = ?2")?;
    for (id, index) in ids.iter().zip(order::rebalanced(ids.len())) {
        stmt.execute(params![index, id])?;
    }
    tracing::debug!(items = ids.len(), "Rebalanced alphabetic index");
    Ok(())
}

fn select_ids<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{by_name, name_of, Fixture};
    use chrono::Duration;

    #[test]
    fn test_first_child_then_appends() {
        let fx = Fixture::new();
        let folder = fx.add(None, "folder");
        let a = fx.add(Some(folder), "a");
        let b = fx.add(Some(folder), "b");
        let c = fx.add(Some(folder), "c");

        assert_eq!(fx.get(&a).position, 0.0);
        assert_eq!(fx.get(&b).position, 1.0);
        assert_eq!(fx.get(&c).position, 2.0);
        assert_eq!(fx.items().highest_position(Some(folder)).unwrap(), Some(2.0));
    }

    #[test]
    fn test_insert_after_sibling_takes_midpoint() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let b = fx.add(None, "b");

        let store = fx.items();
        let id = store.allocate_id();
        let mid = store
            .insert(NewItem::new(id, b"m".to_vec()).placed(SiblingPlacement::After(a)))
            .unwrap();
        assert_eq!(mid.position, 0.5);

        let order: Vec<Uuid> = store.children(None).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(order, vec![a, id, b]);
        assert_eq!(store.next_sibling_position(&a).unwrap(), Some(0.5));
        assert_eq!(store.next_sibling_position(&b).unwrap(), None);
    }

    #[test]
    fn test_repeated_insert_after_rebalances_and_keeps_order() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let b = fx.add(None, "b");
        let store = fx.items();

        let mut expected_after_a = Vec::new();
        for _ in 0..80 {
            let id = store.allocate_id();
            store
                .insert(NewItem::new(id, b"x".to_vec()).placed(SiblingPlacement::After(a)))
                .unwrap();
            expected_after_a.insert(0, id);
        }

        let children = store.children(None).unwrap();
        let mut expected = vec![a];
        expected.extend(expected_after_a);
        expected.push(b);
        assert_eq!(children.iter().map(|i| i.id).collect::<Vec<_>>(), expected);
        assert!(children.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[test]
    fn test_insert_rejects_missing_or_binned_parent() {
        let fx = Fixture::new();
        let store = fx.items();

        let orphan = NewItem::new(store.allocate_id(), b"x".to_vec()).under(Some(Uuid::new_v4()));
        assert!(matches!(
            store.insert(orphan),
            Err(StoreError::PreconditionViolation(_))
        ));

        let binned = fx.add(None, "binned");
        fx.trash().soft_delete(&binned, fx.clock.now()).unwrap();
        let child = NewItem::new(store.allocate_id(), b"x".to_vec()).under(Some(binned));
        assert!(matches!(
            store.insert(child),
            Err(StoreError::PreconditionViolation(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_insert_rejects_reused_id() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let again = fx.items().insert(NewItem::new(a, b"a".to_vec()));
        assert!(matches!(again, Err(StoreError::PreconditionViolation(_))));
    }

    #[test]
    fn test_locate_alpha_keeps_global_order() {
        let fx = Fixture::new();
        let outer = fx.add(None, "M");
        fx.add(Some(outer), "C");
        fx.add(None, "X");
        fx.add(Some(outer), "A");
        fx.add(None, "Q");
        fx.add(None, "0");

        let store = fx.items();
        let names: Vec<String> = (0..store.count().unwrap())
            .map(|k| name_of(&store.item_at(k).unwrap().unwrap()))
            .collect();
        assert_eq!(names, vec!["0", "A", "C", "M", "Q", "X"]);
        assert!(store.item_at(6).unwrap().is_none());

        let (min, max) = store.alpha_index_range().unwrap().unwrap();
        assert_eq!(min, store.item_at(0).unwrap().unwrap().alpha_index);
        assert_eq!(max, store.item_at(5).unwrap().unwrap().alpha_index);
    }

    #[test]
    fn test_locate_alpha_puts_equal_names_after() {
        let fx = Fixture::new();
        let first = fx.add(None, "same");
        let second = fx.add(None, "same");

        let store = fx.items();
        assert_eq!(store.item_at(0).unwrap().unwrap().id, first);
        assert_eq!(store.item_at(1).unwrap().unwrap().id, second);
        assert_eq!(
            store.locate_alpha(&mut by_name("same")).unwrap(),
            AlphaPlacement::After(second)
        );
        assert_eq!(
            store.locate_alpha(&mut by_name("a")).unwrap(),
            AlphaPlacement::First
        );
    }

    #[test]
    fn test_empty_store_has_no_range() {
        let fx = Fixture::new();
        let store = fx.items();
        assert_eq!(store.alpha_index_range().unwrap(), None);
        assert_eq!(store.locate_alpha(&mut by_name("a")).unwrap(), AlphaPlacement::First);
    }

    #[test]
    fn test_rename_moves_item_in_alphabet() {
        let fx = Fixture::new();
        let b = fx.add(None, "b");
        let c = fx.add(None, "c");
        let store = fx.items();

        let placement = store.locate_alpha(&mut by_name("d")).unwrap();
        store.rename(&b, b"d".to_vec(), placement).unwrap();

        assert_eq!(store.item_at(0).unwrap().unwrap().id, c);
        assert_eq!(name_of(&store.item_at(1).unwrap().unwrap()), "d");

        // Renaming to a name that lands right after itself keeps the index
        let before = fx.get(&b).alpha_index;
        store.rename(&b, b"e".to_vec(), AlphaPlacement::After(b)).unwrap();
        assert_eq!(fx.get(&b).alpha_index, before);
    }

    #[test]
    fn test_alphabet_rebalances_when_exhausted() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let z = fx.add(None, "z");
        let store = fx.items();

        for _ in 0..80 {
            let id = store.allocate_id();
            store
                .insert(NewItem::new(id, b"m".to_vec()).alpha(AlphaPlacement::After(a)))
                .unwrap();
        }

        let count = store.count().unwrap();
        let indices: Vec<f64> = (0..count)
            .map(|k| store.item_at(k).unwrap().unwrap().alpha_index)
            .collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.item_at(0).unwrap().unwrap().id, a);
        assert_eq!(store.item_at(count - 1).unwrap().unwrap().id, z);
    }

    #[test]
    fn test_move_appends_under_new_parent() {
        let fx = Fixture::new();
        let left = fx.add(None, "left");
        let right = fx.add(None, "right");
        let existing = fx.add(Some(right), "existing");
        let item = fx.add(Some(left), "item");

        let moved = fx.items().move_item(&item, Some(right)).unwrap();
        assert_eq!(moved.parent_id, Some(right));
        assert!(moved.position > fx.get(&existing).position);
        assert_eq!(fx.items().count_children(Some(left), false).unwrap(), 0);
        assert_eq!(fx.items().count_children(Some(right), false).unwrap(), 2);
    }

    #[test]
    fn test_move_rejects_cycles() {
        let fx = Fixture::new();
        let root = fx.add(None, "root");
        let child = fx.add(Some(root), "child");
        let grandchild = fx.add(Some(child), "grandchild");
        let store = fx.items();

        for target in [root, child, grandchild] {
            let err = store.move_item(&root, Some(target)).unwrap_err();
            assert!(matches!(err, StoreError::PreconditionViolation(_)), "{target}");
        }
        assert_eq!(fx.get(&root).parent_id, None);
    }

    #[test]
    fn test_move_rejects_binned_target_and_unknown_item() {
        let fx = Fixture::new();
        let item = fx.add(None, "item");
        let bin = fx.add(None, "bin");
        fx.trash().soft_delete(&bin, fx.clock.now()).unwrap();

        let store = fx.items();
        assert!(matches!(
            store.move_item(&item, Some(bin)),
            Err(StoreError::PreconditionViolation(_))
        ));
        assert!(matches!(
            store.move_item(&Uuid::new_v4(), None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_descendants_by_depth_then_position() {
        let fx = Fixture::new();
        let root = fx.add(None, "root");
        let a = fx.add(Some(root), "a");
        let b = fx.add(Some(root), "b");
        let a1 = fx.add(Some(a), "a1");
        let b1 = fx.add(Some(b), "b1");
        let a2 = fx.add(Some(a), "a2");

        let ids: Vec<Uuid> = fx
            .items()
            .find_with_descendants(&root)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids[0], root);
        assert_eq!(&ids[1..3], &[a, b]);
        assert_eq!(ids.len(), 6);
        // depth 2: positions a1=0, b1=0, a2=1
        assert!(ids[3..].contains(&a1) && ids[3..].contains(&b1));
        assert_eq!(ids[5], a2);
    }

    #[test]
    fn test_ancestors_root_first() {
        let fx = Fixture::new();
        let root = fx.add(None, "root");
        let mid = fx.add(Some(root), "mid");
        let leaf = fx.add(Some(mid), "leaf");

        let ids: Vec<Uuid> = fx
            .items()
            .find_with_ancestors(&leaf)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![root, mid, leaf]);
        assert!(fx.items().find_with_ancestors(&Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_favorites() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let b = fx.add(None, "b");
        let store = fx.items();

        assert!(store.toggle_favorite(&a).unwrap());
        fx.clock.advance(Duration::seconds(1));
        assert!(store.toggle_favorite(&b).unwrap());
        assert_eq!(store.count_favorites().unwrap(), 2);

        let ids: Vec<Uuid> = store.favorites().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b, a]);

        assert!(!store.toggle_favorite(&a).unwrap());
        assert_eq!(store.count_favorites().unwrap(), 1);
    }

    #[test]
    fn test_last_consulted_most_recent_first() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let b = fx.add(None, "b");
        let c = fx.add(None, "c");
        let store = fx.items();

        for id in [a, c, b] {
            fx.clock.advance(Duration::minutes(1));
            store.touch_consulted(&id).unwrap();
        }

        let ids: Vec<Uuid> = store.last_consulted(2).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b, c]);
        assert_eq!(fx.get(&b).consulted_at, Some(fx.clock.now()));
    }

    #[test]
    fn test_field_updates() {
        let fx = Fixture::new();
        let a = fx.add(None, "a");
        let store = fx.items();
        let icon = Uuid::new_v4();

        store.set_icon(&a, Some(icon)).unwrap();
        store.set_color(&a, Some(vec![1, 2, 3])).unwrap();

        let item = fx.get(&a);
        assert_eq!(item.icon_id, Some(icon));
        assert_eq!(item.enc_color, Some(vec![1, 2, 3]));

        assert!(matches!(
            store.set_icon(&Uuid::new_v4(), None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_count_children_with_and_without_binned() {
        let fx = Fixture::new();
        let folder = fx.add(None, "folder");
        fx.add(Some(folder), "keep");
        let gone = fx.add(Some(folder), "gone");
        fx.trash().soft_delete(&gone, fx.clock.now()).unwrap();

        let store = fx.items();
        assert_eq!(store.count_children(Some(folder), false).unwrap(), 1);
        assert_eq!(store.count_children(Some(folder), true).unwrap(), 2);
        assert_eq!(store.count_children(None, false).unwrap(), 1);
    }

    fn copy_named<'a>(
        store: &'a SqliteItemStore<'a>,
        root: Uuid,
    ) -> impl FnMut(&Item, &Uuid) -> Result<Resealed, StoreError> + 'a {
        move |item, _new_id| {
            let mut name = name_of(item);
            if item.id == root {
                name.push_str(" copy");
            }
            let alpha = store.locate_alpha(&mut by_name(&name))?;
            Ok(Resealed {
                enc_name: name.into_bytes(),
                enc_color: item.enc_color.clone(),
                alpha,
            })
        }
    }

    #[test]
    fn test_duplicate_copies_subtree_next_to_original() {
        let fx = Fixture::new();
        let folder = fx.add(None, "folder");
        let zeta = fx.add(None, "zeta");
        let a = fx.add(Some(folder), "a");
        let a1 = fx.add(Some(a), "a1");
        let b = fx.add(Some(folder), "b");
        fx.items().toggle_favorite(&folder).unwrap();
        fx.items().set_color(&a, Some(vec![7])).unwrap();
        let before = fx.items().find_with_descendants(&folder).unwrap();

        let store = fx.items();
        let copy = store.duplicate(&folder, &mut copy_named(&store, folder)).unwrap();

        assert_eq!(name_of(&copy), "folder copy");
        assert_eq!(copy.parent_id, None);
        assert!(!copy.is_favorite);
        assert!(fx.get(&folder).position < copy.position);
        assert!(copy.position < fx.get(&zeta).position);

        let copied = store.find_with_descendants(&copy.id).unwrap();
        assert_eq!(copied.len(), 4);
        let by_label: HashMap<String, &Item> = copied.iter().map(|i| (name_of(i), i)).collect();
        let (ca, ca1, cb) = (by_label["a"], by_label["a1"], by_label["b"]);
        assert_eq!(ca.parent_id, Some(copy.id));
        assert_eq!(cb.parent_id, Some(copy.id));
        assert_eq!(ca1.parent_id, Some(ca.id));
        assert_eq!(ca.position, fx.get(&a).position);
        assert_eq!(cb.position, fx.get(&b).position);
        assert_eq!(ca.enc_color, Some(vec![7]));
        assert!(![a, a1, b, folder].contains(&ca.id));

        let after = store.find_with_descendants(&folder).unwrap();
        assert_eq!(
            before.iter().map(|i| (i.id, i.parent_id, i.position)).collect::<Vec<_>>(),
            after.iter().map(|i| (i.id, i.parent_id, i.position)).collect::<Vec<_>>()
        );

        let names: Vec<String> = (0..store.count().unwrap())
            .map(|k| name_of(&store.item_at(k).unwrap().unwrap()))
            .collect();
        assert_eq!(names.len(), 9);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_duplicate_skips_binned_descendants() {
        let fx = Fixture::new();
        let folder = fx.add(None, "folder");
        fx.add(Some(folder), "keep");
        let gone = fx.add(Some(folder), "gone");
        fx.trash().soft_delete(&gone, fx.clock.now()).unwrap();

        let store = fx.items();
        let copy = store.duplicate(&folder, &mut copy_named(&store, folder)).unwrap();
        let copied: Vec<String> = store
            .find_with_descendants(&copy.id)
            .unwrap()
            .iter()
            .map(name_of)
            .collect();
        assert_eq!(copied, vec!["folder copy", "keep"]);
    }

    #[test]
    fn test_duplicate_rejects_binned_and_unknown_items() {
        let fx = Fixture::new();
        let gone = fx.add(None, "gone");
        fx.trash().soft_delete(&gone, fx.clock.now()).unwrap();

        let store = fx.items();
        assert!(matches!(
            store.duplicate(&gone, &mut copy_named(&store, gone)),
            Err(StoreError::PreconditionViolation(_))
        ));
        let unknown = Uuid::new_v4();
        assert!(matches!(
            store.duplicate(&unknown, &mut copy_named(&store, unknown)),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }
}
