// Canopy — SQLite Database Management
//
// Pooled SQLite connections in WAL mode. Readers each take their own
// pooled connection and only ever see committed state; writers go through
// `write()`, which takes the scope locks first and then runs the closure in
// a single `BEGIN IMMEDIATE` transaction. Nothing is encrypted at this
// layer: sealed columns arrive as ciphertext from the enclave.

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::locks::{OrderScope, ScopeLocks};
use super::StoreError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Upper bound on concurrent connections for a file-backed store.
pub const POOL_SIZE: u32 = 8;

/// How long a connection waits on a competing writer before giving up
/// with SQLITE_BUSY.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = OFF;
";

/// Pooled database handle plus the scope locks guarding order-key allocation.
pub struct Database {
    pool: DbPool,
    locks: ScopeLocks,
}

impl Database {
    /// Open (or create) the database file at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(PRAGMAS)
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let db = Self {
            pool,
            locks: ScopeLocks::new(),
        };
        db.run_migrations()?;

        tracing::info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// Every in-memory SQLite connection is its own database, so the pool is
    /// pinned to one connection that is never recycled. Callers must not
    /// hold a connection while asking for another.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = OFF;")
        });
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let db = Self {
            pool,
            locks: ScopeLocks::new(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Borrow a pooled connection for reads.
    pub fn conn(&self) -> Result<DbConnection, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` against a pooled connection.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn()?;
        f(&conn)
    }

    /// Run `f` inside one immediate write transaction while holding the
    /// given order scopes. Any error rolls the whole transaction back.
    pub fn write<T>(
        &self,
        scopes: &[OrderScope],
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _scopes = self.locks.acquire(scopes);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Dropping `tx` on the error path rolls back.
        let out = f(&tx)?;

        tx.commit()
            .map_err(|e| StoreError::TransactionAborted(format!("commit failed: {e}")))?;
        Ok(out)
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS items (
                id                  TEXT PRIMARY KEY,
                parent_id           TEXT,
                deleted_parent_id   TEXT,
                deleted_at          INTEGER,
                is_favorite         INTEGER NOT NULL DEFAULT 0,
                position            REAL NOT NULL,
                alpha_index         REAL NOT NULL,
                consulted_at        INTEGER,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER NOT NULL,
                enc_name            BLOB NOT NULL,
                enc_color           BLOB,
                icon_id             TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_items_parent
                ON items(parent_id, position);

            CREATE INDEX IF NOT EXISTS idx_items_deleted_parent
                ON items(deleted_parent_id);

            CREATE INDEX IF NOT EXISTS idx_items_alpha
                ON items(alpha_index);

            CREATE INDEX IF NOT EXISTS idx_items_deleted_at
                ON items(deleted_at);

            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                contact_id      TEXT NOT NULL,
                sort_order      REAL NOT NULL,
                enc_sent_at     BLOB NOT NULL,
                enc_content     BLOB NOT NULL,
                fingerprint     BLOB NOT NULL,
                UNIQUE(contact_id, fingerprint)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_contact
                ON messages(contact_id, sort_order);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
