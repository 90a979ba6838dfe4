pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", 2)?;
        Ok(())
    }

    /// V1: Pipeline state — canonical songs, unmatched review queue, jobs, kv store
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS songs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                artist          TEXT NOT NULL,
                title           TEXT NOT NULL,
                canonical_key   TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(artist, canonical_key)
            );

            CREATE INDEX IF NOT EXISTS idx_songs_artist ON songs(artist);

            CREATE TABLE IF NOT EXISTS song_aliases (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                song_id     INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
                alias       TEXT NOT NULL,
                UNIQUE(song_id, alias)
            );

            CREATE INDEX IF NOT EXISTS idx_aliases_song ON song_aliases(song_id);

            -- Raw track names that failed all matching tiers, kept for human review
            CREATE TABLE IF NOT EXISTS unmatched_tracks (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                artist       TEXT NOT NULL,
                raw_title    TEXT NOT NULL,
                suggestion   TEXT,
                confidence   REAL,
                occurrences  INTEGER NOT NULL DEFAULT 1,
                first_seen   TEXT NOT NULL DEFAULT (datetime('now')),
                last_seen    TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(artist, raw_title)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                status          TEXT NOT NULL DEFAULT 'queued',
                artist          TEXT NOT NULL,
                collection      TEXT NOT NULL,
                limit_count     INTEGER,
                offset_count    INTEGER,
                dry_run         INTEGER NOT NULL DEFAULT 0,
                total_shows     INTEGER NOT NULL DEFAULT 0,
                processed_shows INTEGER NOT NULL DEFAULT 0,
                tracks_created  INTEGER NOT NULL DEFAULT 0,
                tracks_updated  INTEGER NOT NULL DEFAULT 0,
                tracks_skipped  INTEGER NOT NULL DEFAULT 0,
                error_count     INTEGER NOT NULL DEFAULT 0,
                progress        INTEGER NOT NULL DEFAULT 0,
                message         TEXT,
                errors_json     TEXT,
                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                started_at      TEXT,
                finished_at     TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            -- Generic TTL key-value store: circuit breaker state, response
            -- cache, lock tokens. expires_at NULL = no expiry.
            CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                expires_at  TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// V2: Thin catalog adapter tables (items keyed by content-hash SKU + group paths)
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS catalog_items (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                sku              TEXT NOT NULL UNIQUE,
                name             TEXT NOT NULL,
                title            TEXT,
                canonical_key    TEXT,
                artist           TEXT NOT NULL,
                show_identifier  TEXT NOT NULL,
                show_date        TEXT,
                venue            TEXT,
                track_number     INTEGER,
                length_secs      REAL,
                format           TEXT,
                created_at       TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_items_artist ON catalog_items(artist);
            CREATE INDEX IF NOT EXISTS idx_items_show ON catalog_items(show_identifier);

            CREATE TABLE IF NOT EXISTS catalog_groups (
                item_id     INTEGER NOT NULL REFERENCES catalog_items(id) ON DELETE CASCADE,
                group_path  TEXT NOT NULL,
                PRIMARY KEY (item_id, group_path)
            );
            ",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_migrates() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_migrate_idempotent() {
        let db = Database::open_in_memory().unwrap();
        // Running migrations again must not fail
        db.migrate().unwrap();
    }
}
