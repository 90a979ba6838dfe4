use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::models::{ImportJob, JobStatus, Song, UnmatchedTrack};
use super::{Database, DbError, Result};

/// SQLite-friendly UTC timestamp ("YYYY-MM-DD HH:MM:SS"), comparable with
/// datetime('now') in queries.
fn fmt_utc(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

impl Database {
    // ------------------------------------------------------------------
    // Canonical songs
    // ------------------------------------------------------------------

    /// Insert or update a canonical song with its aliases. Returns the song id.
    pub fn upsert_song(
        &self,
        artist: &str,
        title: &str,
        canonical_key: &str,
        aliases: &[String],
    ) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO songs (artist, title, canonical_key)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(artist, canonical_key) DO UPDATE SET title = excluded.title",
            params![artist, title, canonical_key],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM songs WHERE artist = ?1 AND canonical_key = ?2",
            params![artist, canonical_key],
            |row| row.get(0),
        )?;
        for alias in aliases {
            tx.execute(
                "INSERT OR IGNORE INTO song_aliases (song_id, alias) VALUES (?1, ?2)",
                params![id, alias],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Load every canonical song (with aliases) for an artist.
    pub fn get_songs_for_artist(&self, artist: &str) -> Result<Vec<Song>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, artist, title, canonical_key FROM songs WHERE artist = ?1 ORDER BY id",
        )?;
        let mut songs = stmt
            .query_map(params![artist], |row| {
                Ok(Song {
                    id: row.get(0)?,
                    artist: row.get(1)?,
                    title: row.get(2)?,
                    canonical_key: row.get(3)?,
                    aliases: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut alias_stmt = self
            .conn
            .prepare("SELECT alias FROM song_aliases WHERE song_id = ?1 ORDER BY id")?;
        for song in &mut songs {
            song.aliases = alias_stmt
                .query_map(params![song.id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
        }
        Ok(songs)
    }

    pub fn count_songs(&self, artist: &str) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM songs WHERE artist = ?1",
            params![artist],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Unmatched review queue
    // ------------------------------------------------------------------

    /// Record a raw track name that failed every matching tier, bumping the
    /// occurrence count on repeats.
    pub fn record_unmatched(
        &self,
        artist: &str,
        raw_title: &str,
        suggestion: Option<&str>,
        confidence: Option<f64>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO unmatched_tracks (artist, raw_title, suggestion, confidence)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(artist, raw_title) DO UPDATE SET
                suggestion = excluded.suggestion,
                confidence = excluded.confidence,
                occurrences = occurrences + 1,
                last_seen = datetime('now')",
            params![artist, raw_title, suggestion, confidence],
        )?;
        Ok(())
    }

    /// Unmatched tracks for an artist, most frequent first.
    pub fn list_unmatched(&self, artist: &str, limit: usize) -> Result<Vec<UnmatchedTrack>> {
        let mut stmt = self.conn.prepare(
            "SELECT artist, raw_title, suggestion, confidence, occurrences
             FROM unmatched_tracks WHERE artist = ?1
             ORDER BY occurrences DESC, raw_title LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![artist, limit as i64], |row| {
                Ok(UnmatchedTrack {
                    artist: row.get(0)?,
                    raw_title: row.get(1)?,
                    suggestion: row.get(2)?,
                    confidence: row.get(3)?,
                    occurrences: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Persist a new queued job and return it.
    pub fn insert_job(
        &self,
        artist: &str,
        collection: &str,
        limit: Option<u64>,
        offset: Option<u64>,
        dry_run: bool,
    ) -> Result<ImportJob> {
        self.conn.execute(
            "INSERT INTO jobs (status, artist, collection, limit_count, offset_count, dry_run)
             VALUES ('queued', ?1, ?2, ?3, ?4, ?5)",
            params![
                artist,
                collection,
                limit.map(|v| v as i64),
                offset.map(|v| v as i64),
                dry_run as i64
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?
            .ok_or_else(|| DbError::Migration(format!("job {id} vanished after insert")))
    }

    pub fn get_job(&self, id: i64) -> Result<Option<ImportJob>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<ImportJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Queued job ids, oldest first — the worker's work list.
    pub fn queued_job_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM jobs WHERE status = 'queued' ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Transition queued → running. Returns false if the job was no longer
    /// queued (cancelled, or claimed by another worker).
    pub fn mark_job_running(&self, id: i64) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE jobs SET status = 'running', started_at = datetime('now')
             WHERE id = ?1 AND status = 'queued'",
            params![id],
        )?;
        Ok(n == 1)
    }

    /// Update in-flight counters. Only the owning worker calls this.
    #[allow(clippy::too_many_arguments)]
    pub fn update_job_progress(
        &self,
        id: i64,
        total_shows: u64,
        processed_shows: u64,
        tracks_created: u64,
        tracks_updated: u64,
        tracks_skipped: u64,
        error_count: u64,
    ) -> Result<()> {
        let progress = if total_shows > 0 {
            ((processed_shows * 100) / total_shows).min(100)
        } else {
            0
        };
        self.conn.execute(
            "UPDATE jobs SET total_shows = ?2, processed_shows = ?3,
                tracks_created = ?4, tracks_updated = ?5, tracks_skipped = ?6,
                error_count = ?7, progress = ?8
             WHERE id = ?1",
            params![
                id,
                total_shows as i64,
                processed_shows as i64,
                tracks_created as i64,
                tracks_updated as i64,
                tracks_skipped as i64,
                error_count as i64,
                progress as i64
            ],
        )?;
        Ok(())
    }

    /// Set a job's status and optional message directly. Terminal statuses
    /// stamp finished_at. Returns false for unknown job ids.
    pub fn set_job_status(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE jobs SET status = ?2,
                message = COALESCE(?3, message),
                finished_at = CASE
                    WHEN ?2 IN ('completed', 'failed', 'cancelled') THEN datetime('now')
                    ELSE finished_at
                END
             WHERE id = ?1",
            params![id, status.as_str(), message],
        )?;
        Ok(n == 1)
    }

    /// Move a job to a terminal state with a message and captured errors.
    pub fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
        errors: &[String],
    ) -> Result<()> {
        let errors_json = serde_json::to_string(errors).unwrap_or_else(|_| "[]".to_string());
        let progress = if status == JobStatus::Completed { 100 } else { -1 };
        self.conn.execute(
            "UPDATE jobs SET status = ?2, message = ?3, errors_json = ?4,
                finished_at = datetime('now'),
                progress = CASE WHEN ?5 >= 0 THEN ?5 ELSE progress END
             WHERE id = ?1",
            params![id, status.as_str(), message, errors_json, progress],
        )?;
        Ok(())
    }

    /// Cancel a queued or running job. Returns false for terminal/unknown jobs.
    pub fn cancel_job(&self, id: i64) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE jobs SET status = 'cancelled', finished_at = datetime('now')
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![id],
        )?;
        Ok(n == 1)
    }

    /// True if the job has been cancelled. The worker polls this mid-run.
    pub fn job_is_cancelled(&self, id: i64) -> Result<bool> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status.as_deref() == Some("cancelled"))
    }

    /// Delete terminal jobs older than the retention window. Returns count.
    pub fn purge_terminal_jobs(&self, retention_days: i64) -> Result<usize> {
        let cutoff = fmt_utc(Utc::now() - Duration::days(retention_days));
        let n = self.conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND COALESCE(finished_at, created_at) < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Key-value store (TTL) — breaker state, response cache, lock tokens
    // ------------------------------------------------------------------

    /// Get a value if present and not expired.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > datetime('now'))",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a value with an optional TTL, overwriting any previous entry.
    pub fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<()> {
        let expires_at = ttl_secs.map(|s| fmt_utc(Utc::now() + Duration::seconds(s)));
        self.conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Insert only if the key is absent (expired entries count as absent).
    /// Returns true if the insert won. This is the lock-acquire primitive.
    pub fn kv_set_if_absent(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL
             AND expires_at <= datetime('now')",
            params![key],
        )?;
        let expires_at = ttl_secs.map(|s| fmt_utc(Utc::now() + Duration::seconds(s)));
        let n = tx.execute(
            "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        tx.commit()?;
        Ok(n == 1)
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n == 1)
    }

    /// Live (non-expired) entries whose key starts with `prefix`.
    pub fn kv_scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM kv WHERE key LIKE ?1 ESCAPE '\\'
             AND (expires_at IS NULL OR expires_at > datetime('now'))
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![pattern], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop expired entries. Returns count removed.
    pub fn kv_sweep_expired(&self) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= datetime('now')",
            [],
        )?;
        Ok(n)
    }
}

const JOB_COLUMNS: &str = "id, status, artist, collection, limit_count, offset_count, dry_run,
    total_shows, processed_shows, tracks_created, tracks_updated, tracks_skipped,
    error_count, progress, message, errors_json, created_at, started_at, finished_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ImportJob> {
    let status_str: String = row.get(1)?;
    let errors_json: Option<String> = row.get(15)?;
    let created_at: String = row.get(16)?;
    let started_at: Option<String> = row.get(17)?;
    let finished_at: Option<String> = row.get(18)?;
    Ok(ImportJob {
        id: row.get(0)?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        artist: row.get(2)?,
        collection: row.get(3)?,
        limit: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        offset: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        dry_run: row.get::<_, i64>(6)? != 0,
        total_shows: row.get::<_, i64>(7)? as u64,
        processed_shows: row.get::<_, i64>(8)? as u64,
        tracks_created: row.get::<_, i64>(9)? as u64,
        tracks_updated: row.get::<_, i64>(10)? as u64,
        tracks_skipped: row.get::<_, i64>(11)? as u64,
        error_count: row.get::<_, i64>(12)? as u64,
        progress: row.get::<_, i64>(13)?.clamp(0, 100) as u8,
        message: row.get(14)?,
        errors: errors_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        created_at: parse_utc(&created_at).unwrap_or_else(Utc::now),
        started_at: started_at.as_deref().and_then(parse_utc),
        finished_at: finished_at.as_deref().and_then(parse_utc),
    })
}
