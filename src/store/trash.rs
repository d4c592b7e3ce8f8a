// Canopy — Trash Engine
//
// Soft-delete cascade, scoped restore, orphan reattachment and purge.
//
// A soft-deleted item keeps its structural parent_id. The cascade also
// writes deleted_parent_id on every co-deleted descendant, which is what
// lets restore bring back exactly the set that went into the bin together,
// whatever else was binned since.
//
// Reattach and purge move items to parents that depend on the current
// data, so their sibling scope is planned from a read, locked, and then
// re-checked inside the transaction. A plan that went stale is retried.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use uuid::Uuid;

use super::clock::Clock;
use super::db::Database;
use super::items::{
    allocate_position, count, get_item, query_items, require_item, ITEM_COLUMNS, MAX_DEPTH,
};
use super::locks::OrderScope;
use super::models::{opt_id, to_millis, Item, SiblingPlacement};
use super::StoreError;

/// Attempts before a data-dependent write gives up with TransactionAborted.
const MAX_REPLANS: usize = 3;

/// Result of a write whose lock scopes were planned ahead of time.
enum Planned<T> {
    Done(T),
    /// The data moved between planning and locking; nothing was written.
    Replan,
}

/// What `restore_and_reattach` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    pub restored: usize,
    pub reattached: bool,
}

/// Which binned items a purge removes.
#[derive(Debug, Clone, Copy)]
enum PurgeSet {
    One(Uuid),
    DeletedBefore(DateTime<Utc>),
    All,
}

/// Relink applied to an item that survives a purge.
#[derive(Debug, Clone, PartialEq)]
struct Relink {
    id: Uuid,
    position: f64,
    new_parent: Option<Option<Uuid>>,
    new_deleted_parent: Option<Option<Uuid>>,
}

pub struct TrashEngine<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> TrashEngine<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    // ─── Soft delete ────────────────────────────────────────────────────────

    /// Bin `item_id` and all of its live descendants. Returns how many
    /// items were binned.
    pub fn soft_delete(&self, item_id: &Uuid, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let binned = self.db.write(&[], |tx| {
            let item = require_item(tx, item_id)?;
            if item.is_deleted() {
                return Err(StoreError::PreconditionViolation(format!(
                    "item {item_id} is already in the bin"
                )));
            }
            cascade_delete(tx, item_id, now)
        })?;

        tracing::info!(item_id = %item_id, binned, "Item moved to bin");
        Ok(binned)
    }

    /// Bin every live item that has no live parent.
    pub fn soft_delete_all(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let binned = self.db.write(&[], |tx| {
            let roots = query_items(
                tx,
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items
                     LEFT JOIN items AS parent ON parent.id = items.parent_id
                     WHERE items.deleted_at IS NULL
                       AND (parent.id IS NULL OR parent.deleted_at IS NOT NULL)"
                ),
                [],
            )?;
            let mut total = 0;
            for root in roots {
                total += cascade_delete(tx, &root.id, now)?;
            }
            Ok(total)
        })?;

        tracing::info!(binned, "All items moved to bin");
        Ok(binned)
    }

    // ─── Restore ────────────────────────────────────────────────────────────

    /// Restore `item_id` and everything binned with it below it, or every
    /// binned item when `item_id` is `None`. The structural parent is left
    /// alone; see `reattach_orphans`.
    pub fn restore(&self, item_id: Option<&Uuid>) -> Result<usize, StoreError> {
        let restored = self.db.write(&[], |tx| match item_id {
            Some(id) => restore_subtree(tx, id),
            // Every binned item hangs off some deletion root, so this is the
            // union of all roots and their co-deleted sets.
            None => Ok(tx.execute(
                "UPDATE items SET deleted_at = NULL, deleted_parent_id = NULL
                 WHERE deleted_at IS NOT NULL",
                [],
            )?),
        })?;

        tracing::info!(item_id = ?item_id, restored, "Items restored from bin");
        Ok(restored)
    }

    /// Restore then reattach in one transaction.
    pub fn restore_and_reattach(&self, item_id: &Uuid) -> Result<Restored, StoreError> {
        let outcome = self.replanned(
            |conn| {
                let item = require_item(conn, item_id)?;
                Ok(reattach_target(conn, item.parent_id)?.map(OrderScope::Siblings).into_iter().collect())
            },
            |tx, scopes| {
                let item = require_item(tx, item_id)?;
                let target = reattach_target(tx, item.parent_id)?;
                if !target.map_or(true, |t| scopes.contains(&OrderScope::Siblings(t))) {
                    return Ok(Planned::Replan);
                }

                let restored = restore_subtree(tx, item_id)?;
                if let Some(parent_id) = target {
                    reparent(tx, item_id, parent_id, self.clock.now())?;
                }
                Ok(Planned::Done(Restored {
                    restored,
                    reattached: target.is_some(),
                }))
            },
        )?;

        tracing::info!(
            item_id = %item_id,
            restored = outcome.restored,
            reattached = outcome.reattached,
            "Item restored"
        );
        Ok(outcome)
    }

    /// If the item's structural parent is binned or gone, move the item up
    /// to the nearest live ancestor (top level if none). Returns 1 when the
    /// item moved, 0 otherwise.
    pub fn reattach_orphans(&self, item_id: &Uuid) -> Result<usize, StoreError> {
        let moved = self.replanned(
            |conn| {
                let item = require_item(conn, item_id)?;
                Ok(reattach_target(conn, item.parent_id)?.map(OrderScope::Siblings).into_iter().collect())
            },
            |tx, scopes| {
                let item = require_item(tx, item_id)?;
                if item.is_deleted() {
                    return Err(StoreError::PreconditionViolation(format!(
                        "item {item_id} is in the bin; restore it first"
                    )));
                }
                let Some(parent_id) = reattach_target(tx, item.parent_id)? else {
                    return Ok(Planned::Done(0));
                };
                if !scopes.contains(&OrderScope::Siblings(parent_id)) {
                    return Ok(Planned::Replan);
                }
                reparent(tx, item_id, parent_id, self.clock.now())?;
                Ok(Planned::Done(1))
            },
        )?;

        if moved > 0 {
            tracing::info!(item_id = %item_id, "Orphan reattached to live ancestor");
        }
        Ok(moved)
    }

    // ─── Bin queries ────────────────────────────────────────────────────────

    /// A binned item and everything binned with it below it, by depth.
    pub fn find_deleted_with_descendants(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "WITH RECURSIVE binned(id, depth) AS (
                SELECT id, 0 FROM items WHERE id = ?1 AND deleted_at IS NOT NULL
                UNION
                SELECT items.id, binned.depth + 1
                FROM items JOIN binned ON items.deleted_parent_id = binned.id
                WHERE binned.depth < ?2
            )
            SELECT {ITEM_COLUMNS} FROM items JOIN binned ON items.id = binned.id
            ORDER BY binned.depth, items.position, items.id"
        );
        self.db
            .read(|conn| query_items(conn, &sql, params![item_id.to_string(), MAX_DEPTH]))
    }

    /// The item and the chain of items it was binned under, deletion root first.
    pub fn find_with_deleted_ancestors(&self, item_id: &Uuid) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "WITH RECURSIVE chain(id, deleted_parent_id, depth) AS (
                SELECT id, deleted_parent_id, 0 FROM items WHERE id = ?1
                UNION
                SELECT items.id, items.deleted_parent_id, chain.depth + 1
                FROM items JOIN chain ON items.id = chain.deleted_parent_id
                WHERE items.deleted_at IS NOT NULL AND chain.depth < ?2
            )
            SELECT {ITEM_COLUMNS} FROM items JOIN chain ON items.id = chain.id
            ORDER BY chain.depth DESC"
        );
        self.db
            .read(|conn| query_items(conn, &sql, params![item_id.to_string(), MAX_DEPTH]))
    }

    /// Binned items recorded under `deleted_parent_id`; `None` lists the
    /// deletion roots. Most recently binned first.
    pub fn deleted_children(&self, deleted_parent_id: Option<Uuid>) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE deleted_parent_id IS ?1 AND deleted_at IS NOT NULL
             ORDER BY deleted_at DESC, position, id"
        );
        self.db
            .read(|conn| query_items(conn, &sql, params![opt_id(deleted_parent_id)]))
    }

    pub fn count_deleted_children(&self, deleted_parent_id: Option<Uuid>) -> Result<usize, StoreError> {
        self.db.read(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM items WHERE deleted_parent_id IS ?1 AND deleted_at IS NOT NULL",
                params![opt_id(deleted_parent_id)],
            )
        })
    }

    pub fn count_deleted(&self) -> Result<usize, StoreError> {
        self.db.read(|conn| {
            count(conn, "SELECT COUNT(*) FROM items WHERE deleted_at IS NOT NULL", [])
        })
    }

    pub fn highest_deleted_position(&self, deleted_parent_id: Option<Uuid>) -> Result<Option<f64>, StoreError> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(position) FROM items WHERE deleted_parent_id IS ?1 AND deleted_at IS NOT NULL",
                params![opt_id(deleted_parent_id)],
                |row| row.get(0),
            )?)
        })
    }

    // ─── Purge ──────────────────────────────────────────────────────────────

    /// Hard-remove one binned item. Its children move to its parent.
    pub fn purge(&self, item_id: &Uuid) -> Result<usize, StoreError> {
        self.purge_set(PurgeSet::One(*item_id))
    }

    /// Hard-remove every item binned before `threshold`.
    pub fn purge_older_than(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError> {
        self.purge_set(PurgeSet::DeletedBefore(threshold))
    }

    /// Hard-remove everything in the bin.
    pub fn empty_trash(&self) -> Result<usize, StoreError> {
        self.purge_set(PurgeSet::All)
    }

    fn purge_set(&self, set: PurgeSet) -> Result<usize, StoreError> {
        let result = self.replanned(
            |conn| {
                let doomed = load_purge_set(conn, set)?;
                Ok(purge_scopes(&plan_relinks(conn, &doomed)?))
            },
            |tx, scopes| {
                let doomed = load_purge_set(tx, set)?;
                let relinks = plan_relinks(tx, &doomed)?;
                if purge_scopes(&relinks) != scopes {
                    return Ok(Planned::Replan);
                }
                apply_purge(tx, &doomed, &relinks).map(Planned::Done)
            },
        );

        match &result {
            Ok(purged) => tracing::info!(?set, purged, "Purged items from bin"),
            Err(e) => tracing::error!(?set, error = %e, "Purge failed"),
        }
        result
    }

    // ─── Planned writes ─────────────────────────────────────────────────────

    fn replanned<T>(
        &self,
        plan: impl Fn(&Connection) -> Result<Vec<OrderScope>, StoreError>,
        run: impl Fn(&Transaction<'_>, &[OrderScope]) -> Result<Planned<T>, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=MAX_REPLANS {
            let scopes = self.db.read(&plan)?;
            match self.db.write(&scopes, |tx| run(tx, &scopes))? {
                Planned::Done(value) => return Ok(value),
                Planned::Replan => {
                    tracing::debug!(attempt, "Lock plan went stale, replanning");
                }
            }
        }
        Err(StoreError::TransactionAborted(format!(
            "data kept changing across {MAX_REPLANS} attempts"
        )))
    }
}

// ─── Transaction steps ──────────────────────────────────────────────────────

fn cascade_delete(conn: &Connection, item_id: &Uuid, now: DateTime<Utc>) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "WITH RECURSIVE doomed(id) AS (
            VALUES(?1)
            UNION
            SELECT items.id FROM items JOIN doomed ON items.parent_id = doomed.id
            WHERE items.deleted_at IS NULL
        )
        UPDATE items
        SET deleted_at = ?2,
            is_favorite = 0,
            deleted_parent_id = CASE WHEN id = ?1 THEN NULL ELSE parent_id END
        WHERE id IN doomed",
        params![item_id.to_string(), to_millis(now)],
    )?)
}

fn restore_subtree(conn: &Connection, item_id: &Uuid) -> Result<usize, StoreError> {
    let item = require_item(conn, item_id)?;
    if !item.is_deleted() {
        return Err(StoreError::PreconditionViolation(format!(
            "item {item_id} is not in the bin"
        )));
    }
    Ok(conn.execute(
        "WITH RECURSIVE restoring(id) AS (
            VALUES(?1)
            UNION
            SELECT items.id FROM items JOIN restoring ON items.deleted_parent_id = restoring.id
        )
        UPDATE items SET deleted_at = NULL, deleted_parent_id = NULL
        WHERE id IN restoring",
        params![item_id.to_string()],
    )?)
}

/// Where an item under `parent_id` has to move so it hangs off a live
/// item. `None` means it already does (or is top level); `Some(None)`
/// means top level.
fn reattach_target(conn: &Connection, parent_id: Option<Uuid>) -> Result<Option<Option<Uuid>>, StoreError> {
    let mut current = parent_id;
    let mut seen = HashSet::new();
    let mut moved = false;
    while let Some(id) = current {
        match get_item(conn, &id)? {
            Some(ancestor) if !ancestor.is_deleted() => break,
            Some(ancestor) => {
                if !seen.insert(id) {
                    return Err(StoreError::InvalidData(format!(
                        "parent chain loops through {id}"
                    )));
                }
                current = ancestor.parent_id;
            }
            None => current = None,
        }
        moved = true;
    }
    Ok(moved.then_some(current))
}

fn reparent(
    conn: &Connection,
    item_id: &Uuid,
    parent_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let position = allocate_position(conn, parent_id, SiblingPlacement::Last)?;
    conn.execute(
        "UPDATE items SET parent_id = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
        params![opt_id(parent_id), position, to_millis(now), item_id.to_string()],
    )?;
    Ok(())
}

fn load_purge_set(conn: &Connection, set: PurgeSet) -> Result<HashMap<Uuid, Item>, StoreError> {
    let items = match set {
        PurgeSet::One(id) => {
            let item = require_item(conn, &id)?;
            if !item.is_deleted() {
                return Err(StoreError::PreconditionViolation(format!(
                    "item {id} is not in the bin"
                )));
            }
            vec![item]
        }
        PurgeSet::DeletedBefore(threshold) => query_items(
            conn,
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE deleted_at < ?1"),
            params![to_millis(threshold)],
        )?,
        PurgeSet::All => query_items(
            conn,
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE deleted_at IS NOT NULL"),
            [],
        )?,
    };
    Ok(items.into_iter().map(|item| (item.id, item)).collect())
}

/// For every surviving item that points into `doomed`, find the first
/// surviving ancestor along the same link.
fn plan_relinks(conn: &Connection, doomed: &HashMap<Uuid, Item>) -> Result<Vec<Relink>, StoreError> {
    let mut relinks: BTreeMap<Uuid, Relink> = BTreeMap::new();
    let child_sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE parent_id = ?1");
    let binned_sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE deleted_parent_id = ?1");

    for id in doomed.keys() {
        for child in query_items(conn, &child_sql, params![id.to_string()])? {
            if doomed.contains_key(&child.id) {
                continue;
            }
            let entry = relinks.entry(child.id).or_insert_with(|| Relink {
                id: child.id,
                position: child.position,
                new_parent: None,
                new_deleted_parent: None,
            });
            entry.new_parent = Some(survivor(doomed, Some(*id), |i| i.parent_id));
        }
        for child in query_items(conn, &binned_sql, params![id.to_string()])? {
            if doomed.contains_key(&child.id) {
                continue;
            }
            let entry = relinks.entry(child.id).or_insert_with(|| Relink {
                id: child.id,
                position: child.position,
                new_parent: None,
                new_deleted_parent: None,
            });
            entry.new_deleted_parent = Some(survivor(doomed, Some(*id), |i| i.deleted_parent_id));
        }
    }

    let mut relinks: Vec<Relink> = relinks.into_values().collect();
    relinks.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
    Ok(relinks)
}

/// Follow `link` from `start` until it leaves the doomed set.
fn survivor(
    doomed: &HashMap<Uuid, Item>,
    start: Option<Uuid>,
    link: impl Fn(&Item) -> Option<Uuid>,
) -> Option<Uuid> {
    let mut current = start;
    let mut hops = 0;
    while let Some(item) = current.and_then(|id| doomed.get(&id)) {
        current = link(item);
        hops += 1;
        if hops > doomed.len() {
            return None;
        }
    }
    current
}

fn purge_scopes(relinks: &[Relink]) -> Vec<OrderScope> {
    let scopes: BTreeSet<OrderScope> = relinks
        .iter()
        .filter_map(|r| r.new_parent.map(OrderScope::Siblings))
        .collect();
    scopes.into_iter().collect()
}

fn apply_purge(conn: &Connection, doomed: &HashMap<Uuid, Item>, relinks: &[Relink]) -> Result<usize, StoreError> {
    for relink in relinks {
        if let Some(parent_id) = relink.new_parent {
            let position = allocate_position(conn, parent_id, SiblingPlacement::Last)?;
            conn.execute(
                "UPDATE items SET parent_id = ?1, position = ?2 WHERE id = ?3",
                params![opt_id(parent_id), position, relink.id.to_string()],
            )?;
        }
        if let Some(deleted_parent_id) = relink.new_deleted_parent {
            conn.execute(
                "UPDATE items SET deleted_parent_id = ?1 WHERE id = ?2",
                params![opt_id(deleted_parent_id), relink.id.to_string()],
            )?;
        }
    }

    let mut stmt = conn.prepare("DELETE FROM items WHERE id = ?1")?;
    let mut purged = 0;
    for id in doomed.keys() {
        purged += stmt.execute(params![id.to_string()])?;
    }
    Ok(purged)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::items::ItemStore;
    use crate::store::testing::Fixture;
    use chrono::Duration;

    fn ids(items: &[Item]) -> Vec<Uuid> {
        items.iter().map(|i| i.id).collect()
    }

    /// root ─┬─ a ── a1
    ///       └─ b
    fn small_tree(fx: &Fixture) -> (Uuid, Uuid, Uuid, Uuid) {
        let root = fx.add(None, "root");
        let a = fx.add(Some(root), "a");
        let b = fx.add(Some(root), "b");
        let a1 = fx.add(Some(a), "a1");
        (root, a, b, a1)
    }

    #[test]
    fn test_soft_delete_cascades_and_records_deleted_parent() {
        let fx = Fixture::new();
        let (root, a, b, a1) = small_tree(&fx);
        fx.items().toggle_favorite(&a1).unwrap();

        let now = fx.clock.now();
        assert_eq!(fx.trash().soft_delete(&root, now).unwrap(), 4);

        let root_item = fx.get(&root);
        assert_eq!(root_item.deleted_at, Some(now));
        assert_eq!(root_item.deleted_parent_id, None);
        assert!(root_item.is_deletion_root());

        assert_eq!(fx.get(&a).deleted_parent_id, Some(root));
        assert_eq!(fx.get(&b).deleted_parent_id, Some(root));
        assert_eq!(fx.get(&a1).deleted_parent_id, Some(a));
        assert_eq!(fx.get(&a1).parent_id, Some(a), "structural parent survives");
        assert!(!fx.get(&a1).is_favorite);
        assert_eq!(fx.items().count_favorites().unwrap(), 0);

        assert!(fx.items().find_with_descendants(&root).unwrap().is_empty());
        let binned = fx.trash().find_deleted_with_descendants(&root).unwrap();
        assert_eq!(ids(&binned), vec![root, a, b, a1]);
    }

    #[test]
    fn test_soft_delete_twice_is_rejected() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();
        assert!(matches!(
            trash.soft_delete(&root, fx.clock.now()),
            Err(StoreError::PreconditionViolation(_))
        ));
        assert!(matches!(
            trash.soft_delete(&Uuid::new_v4(), fx.clock.now()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_restore_brings_back_identical_tree() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        let before = fx.items().find_with_descendants(&root).unwrap();

        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();
        assert_eq!(trash.restore(Some(&root)).unwrap(), 4);

        let after = fx.items().find_with_descendants(&root).unwrap();
        assert_eq!(after.len(), before.len());
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.parent_id, new.parent_id);
            assert_eq!(old.position, new.position);
            assert_eq!(new.deleted_at, None);
            assert_eq!(new.deleted_parent_id, None);
        }
    }

    #[test]
    fn test_restore_leaves_separately_binned_items_alone() {
        let fx = Fixture::new();
        let (root, a, b, a1) = small_tree(&fx);
        let trash = fx.trash();

        trash.soft_delete(&a1, fx.clock.now()).unwrap();
        fx.clock.advance(Duration::minutes(5));
        trash.soft_delete(&root, fx.clock.now()).unwrap();

        assert_eq!(trash.restore(Some(&root)).unwrap(), 3);
        assert!(!fx.get(&a).is_deleted());
        assert!(!fx.get(&b).is_deleted());
        assert!(fx.get(&a1).is_deleted(), "binned on its own earlier");
        assert!(fx.get(&a1).is_deletion_root());
    }

    #[test]
    fn test_restore_of_live_item_is_rejected() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        assert!(matches!(
            fx.trash().restore(Some(&root)),
            Err(StoreError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_restore_all_empties_bin() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        let other = fx.add(None, "other");
        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();
        trash.soft_delete(&other, fx.clock.now()).unwrap();

        assert_eq!(trash.restore(None).unwrap(), 5);
        assert_eq!(trash.count_deleted().unwrap(), 0);
    }

    #[test]
    fn test_grandparent_chain_restore_and_reattach() {
        let fx = Fixture::new();
        let top = fx.add(None, "top");
        let grandparent = fx.add(Some(top), "grandparent");
        let parent = fx.add(Some(grandparent), "parent");
        let child = fx.add(Some(parent), "child");
        let grandchild = fx.add(Some(child), "grandchild");
        let trash = fx.trash();

        trash.soft_delete(&grandparent, fx.clock.now()).unwrap();
        assert_eq!(trash.restore(Some(&parent)).unwrap(), 3);

        for id in [parent, child, grandchild] {
            assert!(!fx.get(&id).is_deleted());
        }
        assert!(fx.get(&grandparent).is_deleted());
        assert_eq!(fx.get(&parent).parent_id, Some(grandparent), "unchanged until reattach");

        assert_eq!(trash.reattach_orphans(&parent).unwrap(), 1);
        assert_eq!(fx.get(&parent).parent_id, Some(top));
        assert_eq!(trash.reattach_orphans(&parent).unwrap(), 0);

        let live: Vec<Uuid> = ids(&fx.items().find_with_descendants(&top).unwrap());
        assert_eq!(live, vec![top, parent, child, grandchild]);
    }

    #[test]
    fn test_restore_and_reattach_goes_to_top_level_without_live_ancestor() {
        let fx = Fixture::new();
        let (root, a, _, a1) = small_tree(&fx);
        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();

        let outcome = trash.restore_and_reattach(&a).unwrap();
        assert_eq!(outcome, Restored { restored: 2, reattached: true });

        let a_item = fx.get(&a);
        assert_eq!(a_item.parent_id, None);
        assert!(!a_item.is_deleted());
        assert_eq!(fx.get(&a1).parent_id, Some(a));
        assert!(fx.get(&root).is_deleted());
    }

    #[test]
    fn test_reattach_rejects_binned_item() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        fx.trash().soft_delete(&root, fx.clock.now()).unwrap();
        assert!(matches!(
            fx.trash().reattach_orphans(&root),
            Err(StoreError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_deleted_children_and_counts() {
        let fx = Fixture::new();
        let (root, a, b, _) = small_tree(&fx);
        let loose = fx.add(None, "loose");
        let trash = fx.trash();

        trash.soft_delete(&loose, fx.clock.now()).unwrap();
        fx.clock.advance(Duration::seconds(1));
        trash.soft_delete(&root, fx.clock.now()).unwrap();

        assert_eq!(trash.count_deleted_children(None).unwrap(), 2);
        assert_eq!(ids(&trash.deleted_children(None).unwrap()), vec![root, loose]);
        assert_eq!(ids(&trash.deleted_children(Some(root)).unwrap()), vec![a, b]);
        assert_eq!(trash.count_deleted().unwrap(), 5);
        assert_eq!(trash.highest_deleted_position(Some(root)).unwrap(), Some(1.0));
    }

    #[test]
    fn test_deleted_ancestors_root_first() {
        let fx = Fixture::new();
        let (root, a, _, a1) = small_tree(&fx);
        fx.trash().soft_delete(&root, fx.clock.now()).unwrap();
        assert_eq!(
            ids(&fx.trash().find_with_deleted_ancestors(&a1).unwrap()),
            vec![root, a, a1]
        );
    }

    #[test]
    fn test_soft_delete_all_bins_every_live_item() {
        let fx = Fixture::new();
        small_tree(&fx);
        fx.add(None, "other");
        let trash = fx.trash();

        assert_eq!(trash.soft_delete_all(fx.clock.now()).unwrap(), 5);
        assert_eq!(fx.items().children(None).unwrap().len(), 0);
        assert_eq!(trash.count_deleted_children(None).unwrap(), 2);
    }

    #[test]
    fn test_purge_relinks_children() {
        let fx = Fixture::new();
        let (root, a, b, a1) = small_tree(&fx);
        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();

        assert_eq!(trash.purge(&a).unwrap(), 1);
        assert!(fx.items().get(&a).unwrap().is_none());

        let a1_item = fx.get(&a1);
        assert_eq!(a1_item.parent_id, Some(root));
        assert_eq!(a1_item.deleted_parent_id, Some(root));
        assert!(a1_item.position > fx.get(&b).position);

        // Restoring the root still brings back the relinked grandchild
        assert_eq!(trash.restore(Some(&root)).unwrap(), 3);
        assert_eq!(ids(&fx.items().find_with_descendants(&root).unwrap()), vec![root, b, a1]);
    }

    #[test]
    fn test_purge_of_live_item_is_rejected() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        assert!(matches!(
            fx.trash().purge(&root),
            Err(StoreError::PreconditionViolation(_))
        ));
        assert_eq!(fx.items().count().unwrap(), 4);
    }

    #[test]
    fn test_purge_older_than_respects_threshold() {
        let fx = Fixture::new();
        let (root, ..) = small_tree(&fx);
        let recent = fx.add(None, "recent");
        let trash = fx.trash();

        trash.soft_delete(&root, fx.clock.now()).unwrap();
        fx.clock.advance(Duration::days(40));
        trash.soft_delete(&recent, fx.clock.now()).unwrap();

        let threshold = fx.clock.now() - Duration::days(30);
        assert_eq!(trash.purge_older_than(threshold).unwrap(), 4);
        assert_eq!(fx.items().count().unwrap(), 1);
        assert!(fx.get(&recent).is_deleted());
    }

    #[test]
    fn test_purge_keeps_live_child_attached() {
        let fx = Fixture::new();
        let top = fx.add(None, "top");
        let folder = fx.add(Some(top), "folder");
        let child = fx.add(Some(folder), "child");
        let trash = fx.trash();

        trash.soft_delete(&folder, fx.clock.now()).unwrap();
        trash.restore(Some(&child)).unwrap();
        assert_eq!(trash.empty_trash().unwrap(), 1);

        let child_item = fx.get(&child);
        assert_eq!(child_item.parent_id, Some(top));
        assert_eq!(child_item.deleted_parent_id, None);
        assert!(!child_item.is_deleted());
    }

    #[test]
    fn test_failed_purge_leaves_state_unchanged() {
        let fx = Fixture::new();
        let (root, a, _, a1) = small_tree(&fx);
        let trash = fx.trash();
        trash.soft_delete(&root, fx.clock.now()).unwrap();

        fx.db
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_delete BEFORE DELETE ON items
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let before = fx.get(&a1);
        assert!(trash.purge(&a).is_err());
        assert_eq!(fx.get(&a1), before, "relink must roll back with the delete");
        assert!(fx.items().get(&a).unwrap().is_some());
    }

    #[test]
    fn test_failed_cascade_leaves_state_unchanged() {
        let fx = Fixture::new();
        let (root, _, b, _) = small_tree(&fx);

        fx.db
            .conn()
            .unwrap()
            .execute_batch(&format!(
                "CREATE TRIGGER refuse_b BEFORE UPDATE OF deleted_at ON items
                 WHEN NEW.id = '{b}'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;"
            ))
            .unwrap();

        assert!(fx.trash().soft_delete(&root, fx.clock.now()).is_err());
        assert_eq!(fx.trash().count_deleted().unwrap(), 0);
        assert_eq!(fx.items().find_with_descendants(&root).unwrap().len(), 4);
    }
}
