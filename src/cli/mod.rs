// Canopy — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: init, add, tree, move, rename, favorite, trash, restore,
// bin, purge, send, conversation.

mod commands;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

pub use commands::execute;

/// Default retention for `canopy purge`.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Canopy — a local encrypted vault organized as a tree.
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the vault database.
    #[arg(long, env = "CANOPY_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the master secret and the vault database.
    Init,

    /// Add an item.
    Add {
        /// Display name (stored encrypted).
        name: String,

        /// Parent folder id; top level when omitted.
        #[arg(long)]
        parent: Option<Uuid>,

        /// Place directly after this sibling instead of at the end.
        #[arg(long)]
        after: Option<Uuid>,

        /// Mark as favorite.
        #[arg(long)]
        favorite: bool,
    },

    /// Print the live tree, or the subtree under an item.
    Tree {
        root: Option<Uuid>,
    },

    /// Move an item under another parent.
    Move {
        id: Uuid,

        /// New parent id; top level when omitted.
        #[arg(long)]
        to: Option<Uuid>,
    },

    /// Rename an item.
    Rename {
        id: Uuid,
        name: String,
    },

    /// Copy an item and its subtree next to the original.
    Duplicate {
        id: Uuid,
    },

    /// Toggle the favorite flag.
    Favorite {
        id: Uuid,
    },

    /// Move an item and its subtree to the bin.
    Trash {
        #[arg(required_unless_present = "all")]
        id: Option<Uuid>,

        /// Bin every item.
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Restore an item from the bin, or everything when no id is given.
    Restore {
        id: Option<Uuid>,

        /// Also move the item under its nearest live ancestor.
        #[arg(long, requires = "id")]
        reattach: bool,
    },

    /// List the bin: deletion roots, or what was binned under an item.
    Bin {
        id: Option<Uuid>,
    },

    /// Permanently remove binned items.
    Purge {
        /// Remove only this binned item.
        id: Option<Uuid>,

        /// Retention: remove items binned more than this many days ago.
        #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS, conflicts_with_all = ["id", "all"])]
        older_than_days: i64,

        /// Empty the bin.
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Record a message in a conversation.
    Send {
        contact: Uuid,
        message: String,

        /// When the message was sent (RFC 3339); now when omitted.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Print a conversation in sent order.
    Conversation {
        contact: Uuid,
    },
}
