// Canopy — Item and message data models
//
// Sealed columns (`enc_name`, `enc_color`, message stamps and bodies) are
// opaque ciphertext here. Debug output shows their length, never bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One node of the vault tree, as stored.
#[derive(Clone, PartialEq)]
pub struct Item {
    pub id: Uuid,
    /// Structural parent. Kept as-is while the item sits in the bin.
    pub parent_id: Option<Uuid>,
    /// Ancestor recorded by the delete cascade; `None` on the deletion root
    /// and on every live item.
    pub deleted_parent_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_favorite: bool,
    pub position: f64,
    pub alpha_index: f64,
    pub consulted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enc_name: Vec<u8>,
    pub enc_color: Option<Vec<u8>>,
    pub icon_id: Option<Uuid>,
}

impl Item {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_deletion_root(&self) -> bool {
        self.is_deleted() && self.deleted_parent_id.is_none()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("deleted_parent_id", &self.deleted_parent_id)
            .field("deleted_at", &self.deleted_at)
            .field("is_favorite", &self.is_favorite)
            .field("position", &self.position)
            .field("alpha_index", &self.alpha_index)
            .field("consulted_at", &self.consulted_at)
            .field("enc_name", &format_args!("[{} bytes]", self.enc_name.len()))
            .field(
                "enc_color",
                &self.enc_color.as_ref().map(|c| format!("[{} bytes]", c.len())),
            )
            .field("icon_id", &self.icon_id)
            .finish()
    }
}

/// Where a new item goes among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiblingPlacement {
    #[default]
    Last,
    /// Directly after an existing sibling.
    After(Uuid),
}

/// Where an item goes in the global alphabetic order. Produced by
/// `ItemStore::locate_alpha`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaPlacement {
    First,
    #[default]
    Last,
    After(Uuid),
}

/// Sealed fields for one copy made by `ItemStore::duplicate`, bound to the
/// copy's new id, plus where the copy's name sorts.
#[derive(Clone)]
pub struct Resealed {
    pub enc_name: Vec<u8>,
    pub enc_color: Option<Vec<u8>>,
    pub alpha: AlphaPlacement,
}

/// Input for `ItemStore::insert`.
///
/// The id is allocated up front (`ItemStore::allocate_id`) because the
/// sealed name is bound to it.
#[derive(Clone)]
pub struct NewItem {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub enc_name: Vec<u8>,
    pub enc_color: Option<Vec<u8>>,
    pub icon_id: Option<Uuid>,
    pub is_favorite: bool,
    pub placement: SiblingPlacement,
    pub alpha: AlphaPlacement,
}

impl NewItem {
    pub fn new(id: Uuid, enc_name: Vec<u8>) -> Self {
        Self {
            id,
            parent_id: None,
            enc_name,
            enc_color: None,
            icon_id: None,
            is_favorite: false,
            placement: SiblingPlacement::Last,
            alpha: AlphaPlacement::Last,
        }
    }

    pub fn under(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn placed(mut self, placement: SiblingPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn alpha(mut self, alpha: AlphaPlacement) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }
}

impl fmt::Debug for NewItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewItem")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("enc_name", &format_args!("[{} bytes]", self.enc_name.len()))
            .field("placement", &self.placement)
            .field("alpha", &self.alpha)
            .finish()
    }
}

/// Item view with its name opened, as printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub depth: usize,
    pub is_favorite: bool,
    pub position: f64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ItemSummary {
    pub fn from_item(item: &Item, name: String, depth: usize) -> Self {
        Self {
            id: item.id,
            parent_id: item.parent_id,
            name,
            depth,
            is_favorite: item.is_favorite,
            position: item.position,
            deleted_at: item.deleted_at,
            created_at: item.created_at,
        }
    }
}

/// One stored message. Stamp and body stay sealed to the contact id.
#[derive(Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub order: f64,
    pub enc_sent_at: Vec<u8>,
    pub enc_content: Vec<u8>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("contact_id", &self.contact_id)
            .field("order", &self.order)
            .field("enc_sent_at", &format_args!("[{} bytes]", self.enc_sent_at.len()))
            .field("enc_content", &format_args!("[{} bytes]", self.enc_content.len()))
            .finish()
    }
}

/// Opened message, as printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub content: String,
}

// ─── Column encoding ─────────────────────────────────────────────────────────

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_opt_uuid(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    raw.map(|s| parse_uuid(idx, &s)).transpose()
}

pub(crate) fn opt_id(id: Option<Uuid>) -> Option<String> {
    id.map(|id| id.to_string())
}
