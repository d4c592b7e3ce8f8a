// Canopy — Message Order Engine
//
// Keeps each conversation sorted by sent-at time even though the stamps
// are sealed. Inserting decrypts the conversation's stamps (under the
// conversation lock, inside the write) and binary-searches them; the new
// message gets a fractional key between its neighbors. Stamps that no
// longer decrypt are skipped by the search but their keys stay reserved.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::enclave::FieldCipher;

use super::clock::truncate_millis;
use super::db::Database;
use super::ids::IdAllocator;
use super::items::count;
use super::locks::OrderScope;
use super::models::{from_millis, parse_uuid, to_millis, Message};
use super::order::{self, OrderKey};
use super::StoreError;

const MESSAGE_COLUMNS: &str = "id, contact_id, sort_order, enc_sent_at, enc_content";

/// A stored message as seen by the placement search.
#[derive(Debug, Clone, Copy)]
struct Slot {
    order: f64,
    /// `None` when the stamp failed to decrypt.
    stamp: Option<i64>,
}

pub struct MessageOrderEngine<'a> {
    db: &'a Database,
    cipher: &'a dyn FieldCipher,
    ids: &'a dyn IdAllocator,
}

impl<'a> MessageOrderEngine<'a> {
    pub fn new(db: &'a Database, cipher: &'a dyn FieldCipher, ids: &'a dyn IdAllocator) -> Self {
        Self { db, cipher, ids }
    }

    /// Seal and store a message, placed by its sent-at time. Messages with
    /// equal stamps keep arrival order. An identical (stamp, content) pair
    /// already in the conversation is a `Conflict`.
    pub fn insert(&self, contact_id: &Uuid, sent_at: DateTime<Utc>, content: &[u8]) -> Result<Message, StoreError> {
        let stamp = to_millis(truncate_millis(sent_at));
        let stamp_bytes = stamp.to_be_bytes();

        let parts: [&[u8]; 2] = [&stamp_bytes, content];
        let fingerprint = self.cipher.fingerprint(contact_id, &parts)?;
        let enc_sent_at = self.cipher.encrypt(contact_id, &stamp_bytes)?;
        let enc_content = self.cipher.encrypt(contact_id, content)?;
        let id = self.ids.next_id();

        let message = self.db.write(&[OrderScope::Conversation(*contact_id)], |tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM messages WHERE contact_id = ?1 AND fingerprint = ?2",
                    params![contact_id.to_string(), fingerprint.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::Conflict {
                    contact_id: *contact_id,
                    existing_id: parse_uuid(0, &existing)?,
                });
            }

            let order = self.allocate_order(tx, contact_id, stamp)?;
            tx.execute(
                "INSERT INTO messages (id, contact_id, sort_order, enc_sent_at, enc_content, fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    contact_id.to_string(),
                    order,
                    enc_sent_at,
                    enc_content,
                    fingerprint.as_slice(),
                ],
            )?;
            Ok(Message {
                id,
                contact_id: *contact_id,
                order,
                enc_sent_at,
                enc_content,
            })
        })?;

        tracing::debug!(message_id = %message.id, contact_id = %contact_id, order = message.order, "Message stored");
        Ok(message)
    }

    /// The conversation in sent-at order.
    pub fn list(&self, contact_id: &Uuid) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE contact_id = ?1 ORDER BY sort_order, id"
        );
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let messages = stmt
                .query_map(params![contact_id.to_string()], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
    }

    /// The `index`-th message of the conversation in sent-at order.
    pub fn message_at(&self, contact_id: &Uuid, index: usize) -> Result<Option<Message>, StoreError> {
        let Ok(offset) = i64::try_from(index) else {
            return Ok(None);
        };
        self.first_where(
            "WHERE contact_id = ?1 ORDER BY sort_order, id LIMIT 1 OFFSET ?2",
            contact_id,
            offset,
        )
    }

    pub fn count(&self, contact_id: &Uuid) -> Result<usize, StoreError> {
        self.db.read(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM messages WHERE contact_id = ?1",
                params![contact_id.to_string()],
            )
        })
    }

    pub fn most_recent(&self, contact_id: &Uuid) -> Result<Option<Message>, StoreError> {
        self.first_where(
            "WHERE contact_id = ?1 ORDER BY sort_order DESC, id DESC LIMIT 1 OFFSET ?2",
            contact_id,
            0,
        )
    }

    pub fn least_recent(&self, contact_id: &Uuid) -> Result<Option<Message>, StoreError> {
        self.first_where(
            "WHERE contact_id = ?1 ORDER BY sort_order, id LIMIT 1 OFFSET ?2",
            contact_id,
            0,
        )
    }

    /// Returns false when the message was not stored.
    pub fn delete(&self, message_id: &Uuid) -> Result<bool, StoreError> {
        let deleted = self.db.write(&[], |tx| {
            Ok(tx.execute("DELETE FROM messages WHERE id = ?1", params![message_id.to_string()])?)
        })?;
        if deleted > 0 {
            tracing::info!(message_id = %message_id, "Message deleted");
        }
        Ok(deleted > 0)
    }

    pub fn sent_at(&self, message: &Message) -> Result<DateTime<Utc>, StoreError> {
        let plain = self.cipher.decrypt(&message.contact_id, &message.enc_sent_at)?;
        let stamp = decode_stamp(&plain).ok_or_else(|| {
            StoreError::InvalidData(format!("message {} has a malformed stamp", message.id))
        })?;
        Ok(from_millis(0, stamp)?)
    }

    pub fn content(&self, message: &Message) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        Ok(self.cipher.decrypt(&message.contact_id, &message.enc_content)?)
    }

    fn first_where(&self, tail: &str, contact_id: &Uuid, offset: i64) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages {tail}");
        self.db.read(|conn| {
            Ok(conn
                .query_row(&sql, params![contact_id.to_string(), offset], row_to_message)
                .optional()?)
        })
    }

    /// Must run inside a write holding `OrderScope::Conversation(contact_id)`.
    fn allocate_order(&self, conn: &Connection, contact_id: &Uuid, stamp: i64) -> Result<f64, StoreError> {
        if let OrderKey::Key(order) = place(&self.load_slots(conn, contact_id)?, stamp) {
            return Ok(order);
        }

        rebalance_conversation(conn, contact_id)?;
        place(&self.load_slots(conn, contact_id)?, stamp)
            .key()
            .ok_or_else(|| StoreError::InvalidData(format!("no order fits in conversation {contact_id}")))
    }

    fn load_slots(&self, conn: &Connection, contact_id: &Uuid) -> Result<Vec<Slot>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, sort_order, enc_sent_at FROM messages WHERE contact_id = ?1 ORDER BY sort_order, id",
        )?;
        let rows = stmt
            .query_map(params![contact_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, Vec<u8>>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, order, enc_sent_at)| {
                let stamp = self
                    .cipher
                    .decrypt(contact_id, &enc_sent_at)
                    .ok()
                    .and_then(|plain| decode_stamp(&plain));
                if stamp.is_none() {
                    tracing::warn!(message_id = %id, contact_id = %contact_id, "Message stamp unreadable, excluded from ordering");
                }
                Slot { order, stamp }
            })
            .collect())
    }
}

/// Key for a message stamped `stamp` given the conversation in key order.
fn place(slots: &[Slot], stamp: i64) -> OrderKey {
    let readable: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.stamp.map(|_| i))
        .collect();
    // Upper bound: readable messages stamped at or before `stamp` come first.
    let after = readable.partition_point(|&i| slots[i].stamp.is_some_and(|s| s <= stamp));

    if after > 0 {
        let prev = readable[after - 1];
        return match slots.get(prev + 1) {
            Some(next) => order::order_between(slots[prev].order, next.order),
            None => order::order_after(Some(slots[prev].order)),
        };
    }
    match readable.first() {
        Some(&0) => order::order_before(Some(slots[0].order)),
        Some(&first) => order::order_between(slots[first - 1].order, slots[first].order),
        None => order::order_after(slots.last().map(|s| s.order)),
    }
}

fn rebalance_conversation(conn: &Connection, contact_id: &Uuid) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM messages WHERE contact_id = ?1 ORDER BY sort_order, id")?;
    let ids = stmt
        .query_map(params![contact_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut update = conn.prepare("UPDATE messages SET sort_order = ?1 WHERE id = ?2")?;
    for (id, order) in ids.iter().zip(order::rebalanced(ids.len())) {
        update.execute(params![order, id])?;
    }
    tracing::debug!(contact_id = %contact_id, messages = ids.len(), "Rebalanced conversation order");
    Ok(())
}

fn decode_stamp(plain: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = plain.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let contact_id: String = row.get(1)?;
    Ok(Message {
        id: parse_uuid(0, &id)?,
        contact_id: parse_uuid(1, &contact_id)?,
        order: row.get(2)?,
        enc_sent_at: row.get(3)?,
        enc_content: row.get(4)?,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
