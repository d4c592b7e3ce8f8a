// Canopy — CLI Command Handlers
//
// Each function handles one CLI subcommand. They unlock the field cipher
// from the keyring, open the database, and drive the store. Names and
// message bodies are opened here, on the caller's side of the store.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::enclave::{FieldCipher, KeyringProvider, VaultCipher, VaultKeyProvider};
use crate::error::{CanopyError, Result};
use crate::store::{
    Clock, Database, Item, ItemStore, ItemSummary, MessageOrderEngine, MessageSummary, NewItem,
    RandomIds, Resealed, SiblingPlacement, SqliteItemStore, StoreError, SystemClock, TrashEngine,
};

use super::{Cli, Commands};

const DB_FILE: &str = "canopy.db";

/// Default directory for Canopy data files.
fn default_data_dir() -> PathBuf {
    let base = dirs_next::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("canopy")
}

/// Execute the parsed CLI command.
pub fn execute(cli: Cli) -> Result<()> {
    let dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Init => cmd_init(&dir),
        Commands::Add {
            name,
            parent,
            after,
            favorite,
        } => cmd_add(&open_vault(&dir)?, &out, name, parent, after, favorite),
        Commands::Tree { root } => cmd_tree(&open_vault(&dir)?, &out, root),
        Commands::Move { id, to } => cmd_move(&open_vault(&dir)?, &out, id, to),
        Commands::Rename { id, name } => cmd_rename(&open_vault(&dir)?, id, name),
        Commands::Duplicate { id } => cmd_duplicate(&open_vault(&dir)?, &out, id),
        Commands::Favorite { id } => cmd_favorite(&open_vault(&dir)?, id),
        Commands::Trash { id, all } => cmd_trash(&open_vault(&dir)?, id, all),
        Commands::Restore { id, reattach } => cmd_restore(&open_vault(&dir)?, id, reattach),
        Commands::Bin { id } => cmd_bin(&open_vault(&dir)?, &out, id),
        Commands::Purge {
            id,
            older_than_days,
            all,
        } => cmd_purge(&open_vault(&dir)?, id, older_than_days, all),
        Commands::Send { contact, message, at } => {
            cmd_send(&open_vault(&dir)?, &out, contact, message, at)
        }
        Commands::Conversation { contact } => cmd_conversation(&open_vault(&dir)?, &out, contact),
    }
}

// ─── Init ────────────────────────────────────────────────────────────────────

fn cmd_init(dir: &Path) -> Result<()> {
    let provider = KeyringProvider::new();
    let created = !provider.has_master_secret()?;
    provider.get_or_create_master_secret()?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(DB_FILE);
    Database::open(&path)?;

    println!("✓ Canopy initialized");
    println!("  Database: {}", path.display());
    if created {
        println!("  New master secret stored in platform keyring");
    } else {
        println!("  Reusing the master secret already in the keyring");
    }
    println!();
    println!("Next: add an item with `canopy add <name>`");
    Ok(())
}

// ─── Tree ────────────────────────────────────────────────────────────────────

fn cmd_add(
    vault: &Vault,
    out: &Output,
    name: String,
    parent: Option<Uuid>,
    after: Option<Uuid>,
    favorite: bool,
) -> Result<()> {
    let store = vault.items();
    let alpha = store.locate_alpha(&mut |candidate: &Item| vault.compare_name(&name, candidate))?;

    let id = store.allocate_id();
    let enc_name = vault.cipher.encrypt(&id, name.as_bytes())?;
    let placement = after.map_or(SiblingPlacement::Last, SiblingPlacement::After);
    let item = store.insert(
        NewItem::new(id, enc_name)
            .under(parent)
            .placed(placement)
            .alpha(alpha)
            .favorite(favorite),
    )?;

    out.emit(&ItemSummary::from_item(&item, name.clone(), 0), || {
        println!("✓ Added {name}");
        println!("  ID: {}", item.id);
    })
}

fn cmd_tree(vault: &Vault, out: &Output, root: Option<Uuid>) -> Result<()> {
    let store = vault.items();
    let mut rows = Vec::new();

    match root {
        Some(id) => {
            let item = store
                .get(&id)?
                .filter(|item| !item.is_deleted())
                .ok_or_else(|| CanopyError::Other(format!("No live item {id}")))?;
            rows.push(vault.summarize(&item, 0)?);
            walk(vault, &store, Some(id), 1, &mut rows)?;
        }
        None => walk(vault, &store, None, 0, &mut rows)?,
    }

    out.emit(&rows, || {
        if rows.is_empty() {
            println!("The vault is empty. Add an item with `canopy add <name>`");
        }
        for row in &rows {
            let star = if row.is_favorite { " ★" } else { "" };
            println!("{}{}{}  {}", "  ".repeat(row.depth), row.name, star, row.id);
        }
    })
}

/// Depth-first walk of live children in position order.
fn walk(
    vault: &Vault,
    store: &SqliteItemStore<'_>,
    parent: Option<Uuid>,
    depth: usize,
    rows: &mut Vec<ItemSummary>,
) -> Result<()> {
    for child in store.children(parent)? {
        rows.push(vault.summarize(&child, depth)?);
        walk(vault, store, Some(child.id), depth + 1, rows)?;
    }
    Ok(())
}

fn cmd_move(vault: &Vault, out: &Output, id: Uuid, to: Option<Uuid>) -> Result<()> {
    let item = vault.items().move_item(&id, to)?;
    let summary = vault.summarize(&item, 0)?;
    out.emit(&summary, || match to {
        Some(parent) => println!("✓ Moved {} under {parent}", summary.name),
        None => println!("✓ Moved {} to the top level", summary.name),
    })
}

fn cmd_rename(vault: &Vault, id: Uuid, name: String) -> Result<()> {
    let store = vault.items();
    let alpha = store.locate_alpha(&mut |candidate: &Item| vault.compare_name(&name, candidate))?;
    let enc_name = vault.cipher.encrypt(&id, name.as_bytes())?;
    store.rename(&id, enc_name, alpha)?;
    println!("✓ Renamed {id} to {name}");
    Ok(())
}

fn cmd_duplicate(vault: &Vault, out: &Output, id: Uuid) -> Result<()> {
    let store = vault.items();
    let mut reseal = |item: &Item, new_id: &Uuid| -> std::result::Result<Resealed, StoreError> {
        let mut name = vault.name_of(item)?;
        if item.id == id {
            name.push_str(" (copy)");
        }
        let enc_color = match &item.enc_color {
            Some(sealed) => {
                let color = vault.cipher.decrypt(&item.id, sealed)?;
                Some(vault.cipher.encrypt(new_id, &color)?)
            }
            None => None,
        };
        Ok(Resealed {
            enc_name: vault.cipher.encrypt(new_id, name.as_bytes())?,
            enc_color,
            alpha: store.locate_alpha(&mut |candidate: &Item| vault.compare_name(&name, candidate))?,
        })
    };
    let copy = store.duplicate(&id, &mut reseal)?;

    let summary = vault.summarize(&copy, 0)?;
    out.emit(&summary, || println!("✓ Duplicated {id} as {} ({})", summary.name, copy.id));
    Ok(())
}

fn cmd_favorite(vault: &Vault, id: Uuid) -> Result<()> {
    if vault.items().toggle_favorite(&id)? {
        println!("✓ {id} added to favorites");
    } else {
        println!("✓ {id} removed from favorites");
    }
    Ok(())
}

// ─── Bin ─────────────────────────────────────────────────────────────────────

fn cmd_trash(vault: &Vault, id: Option<Uuid>, all: bool) -> Result<()> {
    let trash = vault.trash();
    let now = SystemClock.now();
    let binned = match id {
        Some(id) if !all => trash.soft_delete(&id, now)?,
        _ => trash.soft_delete_all(now)?,
    };
    println!("✓ Moved {binned} item(s) to the bin");
    Ok(())
}

fn cmd_restore(vault: &Vault, id: Option<Uuid>, reattach: bool) -> Result<()> {
    let trash = vault.trash();
    match (id, reattach) {
        (Some(id), true) => {
            let outcome = trash.restore_and_reattach(&id)?;
            println!("✓ Restored {} item(s)", outcome.restored);
            if outcome.reattached {
                println!("  Moved under its nearest live ancestor");
            }
        }
        (id, _) => {
            let restored = trash.restore(id.as_ref())?;
            println!("✓ Restored {restored} item(s)");
        }
    }
    Ok(())
}

fn cmd_bin(vault: &Vault, out: &Output, id: Option<Uuid>) -> Result<()> {
    let trash = vault.trash();
    let rows = trash
        .deleted_children(id)?
        .iter()
        .map(|item| vault.summarize(item, 0))
        .collect::<Result<Vec<_>>>()?;
    let total = trash.count_deleted()?;

    out.emit(&rows, || {
        if rows.is_empty() {
            println!("The bin is empty.");
            return;
        }
        println!("Bin ({total} item(s) in total):\n");
        for row in &rows {
            let when = row
                .deleted_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("  {} │ {when} │ {}", row.id, row.name);
        }
    })
}

fn cmd_purge(vault: &Vault, id: Option<Uuid>, older_than_days: i64, all: bool) -> Result<()> {
    let trash = vault.trash();
    let purged = match (id, all) {
        (Some(id), _) => trash.purge(&id)?,
        (None, true) => trash.empty_trash()?,
        (None, false) => {
            let days = Duration::try_days(older_than_days).ok_or_else(|| {
                CanopyError::Other(format!("Retention of {older_than_days} days is out of range"))
            })?;
            trash.purge_older_than(SystemClock.now() - days)?
        }
    };
    println!("✓ Permanently removed {purged} item(s)");
    Ok(())
}

// ─── Conversations ───────────────────────────────────────────────────────────

fn cmd_send(
    vault: &Vault,
    out: &Output,
    contact: Uuid,
    message: String,
    at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    let engine = vault.messages();
    let sent_at = at.unwrap_or_else(|| SystemClock.now());
    let stored = engine.insert(&contact, sent_at, message.as_bytes())?;

    let summary = MessageSummary {
        id: stored.id,
        sent_at: engine.sent_at(&stored)?,
        content: message,
    };
    out.emit(&summary, || println!("✓ Message {} recorded", summary.id))
}

fn cmd_conversation(vault: &Vault, out: &Output, contact: Uuid) -> Result<()> {
    let engine = vault.messages();
    let mut rows = Vec::new();
    for message in engine.list(&contact)? {
        let opened = engine
            .sent_at(&message)
            .and_then(|sent_at| Ok((sent_at, engine.content(&message)?)));
        match opened {
            Ok((sent_at, content)) => rows.push(MessageSummary {
                id: message.id,
                sent_at,
                content: String::from_utf8_lossy(&content).into_owned(),
            }),
            Err(e) => tracing::warn!(message_id = %message.id, error = %e, "Skipping unreadable message"),
        }
    }

    out.emit(&rows, || {
        if rows.is_empty() {
            println!("No messages with {contact}.");
        }
        for row in &rows {
            println!("{}  {}", row.sent_at.format("%Y-%m-%d %H:%M:%S"), row.content);
        }
    })
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Output {
    json: bool,
}

impl Output {
    /// Print `value` as JSON, or run `text` for the human-readable form.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }
}

/// Open database plus the unlocked field cipher.
struct Vault {
    db: Database,
    cipher: VaultCipher,
}

impl Vault {
    fn items(&self) -> SqliteItemStore<'_> {
        SqliteItemStore::new(&self.db, &SystemClock, &RandomIds)
    }

    fn trash(&self) -> TrashEngine<'_> {
        TrashEngine::new(&self.db, &SystemClock)
    }

    fn messages(&self) -> MessageOrderEngine<'_> {
        MessageOrderEngine::new(&self.db, &self.cipher, &RandomIds)
    }

    fn name_of(&self, item: &Item) -> std::result::Result<String, StoreError> {
        let plain = self.cipher.decrypt(&item.id, &item.enc_name)?;
        Ok(String::from_utf8_lossy(&plain).into_owned())
    }

    /// Case-insensitive collation, ties broken by exact bytes.
    fn compare_name(&self, name: &str, candidate: &Item) -> std::result::Result<Ordering, StoreError> {
        let other = self.name_of(candidate)?;
        Ok(name
            .to_lowercase()
            .cmp(&other.to_lowercase())
            .then_with(|| name.cmp(&other)))
    }

    fn summarize(&self, item: &Item, depth: usize) -> Result<ItemSummary> {
        Ok(ItemSummary::from_item(item, self.name_of(item)?, depth))
    }
}

/// Unlock the cipher from the platform keyring and open the database.
fn open_vault(dir: &Path) -> Result<Vault> {
    let provider = KeyringProvider::new();
    if !provider.has_master_secret()? {
        return Err(CanopyError::Other(
            "Canopy is not initialized. Run `canopy init` first.".to_string(),
        ));
    }

    let path = dir.join(DB_FILE);
    if !path.exists() {
        return Err(CanopyError::Other(format!(
            "Database not found at {}. Run `canopy init` first.",
            path.display()
        )));
    }

    let cipher = provider.unlock()?;
    let db = Database::open(&path)?;
    Ok(Vault { db, cipher })
}
