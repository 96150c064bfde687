use anyhow::Context;
use anyhow::Result;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use rusqlite::Connection;
use std::path::Path;

pub mod admin;
pub mod feedback;
pub mod images;
pub mod inbox;
pub mod keys;

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    post TEXT NOT NULL,
    data BLOB NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS keys (
    wallet TEXT NOT NULL PRIMARY KEY,
    key TEXT NOT NULL,
    chal TEXT NOT NULL DEFAULT '',
    settings TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS admin (
    role TEXT NOT NULL PRIMARY KEY,
    chal TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    wallet TEXT NOT NULL,
    target TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    done INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS inbox (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    user TEXT NOT NULL,
    sender TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
"#;

/// The node's local tabular store.
///
/// A single connection behind a mutex; callers run their statements from
/// `spawn_blocking` tasks. Row-level atomicity comes from sqlite itself.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL")?;

        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Creates missing tables and adds any column an older database predates.
/// Additive only, so downgrades keep working against the same file.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES_SQL)
        .context("Failed to create tables")?;

    ensure_column(conn, "images", "active", "INTEGER NOT NULL DEFAULT 1")?;
    ensure_column(conn, "keys", "settings", "TEXT NOT NULL DEFAULT '{}'")?;
    ensure_column(conn, "feedback", "done", "INTEGER NOT NULL DEFAULT 0")?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, definition: &str) -> Result<()> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut names = statement.query_map([], |row| row.get::<_, String>(1))?;

    if names.any(|name| matches!(name.as_deref(), Ok(existing) if existing == column)) {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
        [],
    )
    .with_context(|| format!("Failed to add column {table}.{column}"))?;

    tracing::info!(table, column, "Migrated database schema");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let store = Store::open_in_memory().unwrap();

        migrate(&store.conn()).unwrap();
        migrate(&store.conn()).unwrap();
    }

    #[test]
    fn migration_adds_missing_columns_with_defaults() {
        let conn = Connection::open_in_memory().unwrap();

        // An old database from before the soft-delete flag existed.
        conn.execute_batch(
            "CREATE TABLE images (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                wallet TEXT NOT NULL,
                post TEXT NOT NULL,
                data BLOB NOT NULL
            );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO images (wallet, post, data) VALUES (?1, ?2, ?3)",
            rusqlite::params!["w1", "p1", b"bytes".to_vec()],
        )
        .unwrap();

        migrate(&conn).unwrap();

        let active = conn
            .query_row("SELECT active FROM images WHERE wallet = 'w1'", [], |row| {
                row.get::<_, bool>(0)
            })
            .unwrap();
        assert!(active, "existing rows default to active");
    }
}
