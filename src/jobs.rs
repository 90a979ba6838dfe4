use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::archive::ArchiveClient;
use crate::cache::MetadataCache;
use crate::catalog::SqliteCatalog;
use crate::config::{AppConfig, ConfigError};
use crate::db::models::{ImportJob, JobStatus};
use crate::db::{Database, DbError};
use crate::importer::{ImportError, ImportOptions, ImportReport, Importer};
use crate::lock::{LockError, LockService};
use crate::matcher::MatchEngine;

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("Job {0} not found")]
    NotFound(i64),
}

type Result<T> = std::result::Result<T, JobError>;

/// Producer side of the persisted job queue: enqueue, inspect, cancel.
pub struct JobQueue<'a> {
    db: &'a Database,
    cfg: &'a AppConfig,
}

impl<'a> JobQueue<'a> {
    pub fn new(db: &'a Database, cfg: &'a AppConfig) -> Self {
        Self { db, cfg }
    }

    /// Enqueue an import for an artist. The artist must have a collection
    /// mapping in config; resolving it here means a typo fails at publish
    /// time, not hours later in the worker.
    pub fn publish(
        &self,
        artist: &str,
        limit: Option<u64>,
        offset: Option<u64>,
        dry_run: bool,
    ) -> Result<ImportJob> {
        let collection = self.cfg.collection_for_artist(artist)?;
        let job = self.db.insert_job(artist, collection, limit, offset, dry_run)?;
        log::info!("Queued job {} for {artist} ({collection})", job.id);
        Ok(job)
    }

    pub fn get(&self, id: i64) -> Result<ImportJob> {
        self.db.get_job(id)?.ok_or(JobError::NotFound(id))
    }

    pub fn list(&self, limit: usize) -> Result<Vec<ImportJob>> {
        Ok(self.db.list_jobs(limit)?)
    }

    /// Push a status change onto a job, with an optional operator message.
    /// For external supervisors that mark jobs failed/completed out of band.
    pub fn update_status(&self, id: i64, status: JobStatus, message: Option<&str>) -> Result<()> {
        if !self.db.set_job_status(id, status, message)? {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    /// Request cancellation. Queued jobs never start; running jobs stop
    /// at the next progress checkpoint. Returns false for terminal jobs.
    pub fn cancel(&self, id: i64) -> Result<bool> {
        Ok(self.db.cancel_job(id)?)
    }

    /// Drop terminal jobs past the retention window.
    pub fn purge(&self) -> Result<usize> {
        Ok(self.db.purge_terminal_jobs(self.cfg.jobs.retention_days)?)
    }
}

/// Consumer side: polls the jobs table and executes queued imports one at
/// a time. Multiple workers may run; the per-collection lock plus the
/// conditional queued→running claim keep them from colliding.
pub struct Worker<'a> {
    db: &'a Database,
    cfg: &'a AppConfig,
    cache: &'a MetadataCache,
}

impl<'a> Worker<'a> {
    pub fn new(db: &'a Database, cfg: &'a AppConfig, cache: &'a MetadataCache) -> Self {
        Self { db, cfg, cache }
    }

    /// Poll until interrupted, sleeping between empty scans.
    pub fn run_forever(&self) -> Result<()> {
        log::info!("Worker started (pid {})", std::process::id());
        loop {
            let did_work = self.run_pending()? > 0;
            if !did_work {
                thread::sleep(Duration::from_millis(self.cfg.jobs.poll_interval_ms));
            }
        }
    }

    /// Execute everything currently queued. Returns the number of jobs
    /// this worker actually ran to completion (any terminal state).
    pub fn run_pending(&self) -> Result<usize> {
        let mut ran = 0usize;
        for id in self.db.queued_job_ids()? {
            if self.run_job(id)? {
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Run one job. Returns false when the job was skipped — cancelled
    /// before start, claimed elsewhere, or its collection is locked.
    fn run_job(&self, id: i64) -> Result<bool> {
        let Some(job) = self.db.get_job(id)? else {
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            return Ok(false);
        }

        let locks = LockService::new(self.db, self.cfg.locks.clone());
        let handle = match locks.acquire("import", &job.collection, 0) {
            Ok(h) => h,
            Err(LockError::AlreadyLocked { key }) => {
                // Leave the job queued; whoever holds the lock will finish
                // and a later scan picks this up
                log::debug!("Job {id} deferred, {key} is held");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if !self.db.mark_job_running(id)? {
            // Cancelled or claimed between the scan and now
            let _ = locks.release(handle);
            return Ok(false);
        }

        log::info!("Job {id}: importing {} from {}", job.artist, job.collection);
        let outcome = self.execute(&job);
        if let Err(e) = locks.release(handle) {
            log::warn!("Job {id}: lock release failed: {e}");
        }

        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                self.db
                    .finish_job(id, JobStatus::Failed, Some(&e.to_string()), &[])?;
                log::error!("Job {id} failed: {e}");
                Ok(true)
            }
        }
    }

    fn execute(&self, job: &ImportJob) -> Result<()> {
        let client = ArchiveClient::new(self.db, self.cfg.archive.clone(), &self.cfg.breaker);
        let store = SqliteCatalog::new(self.db);
        let matcher = MatchEngine::new(self.db, self.cfg.matching.clone());
        let mut importer = Importer::new(self.db, self.cache, &client, &store, matcher);

        let opts = ImportOptions {
            limit: job.limit.map(|v| v as usize),
            offset: job.offset.unwrap_or(0) as usize,
            dry_run: job.dry_run,
        };

        let batch = self.cfg.jobs.progress_batch.max(1) as usize;
        let db = self.db;
        let job_id = job.id;
        let mut on_progress = |processed: usize, total: usize, report: &ImportReport| -> bool {
            if processed % batch != 0 && processed != total {
                return true;
            }
            // Checkpoint: persist the running counters so pollers never see
            // them go backwards, then honor cancellation
            if let Err(e) = db.update_job_progress(
                job_id,
                total as u64,
                processed as u64,
                report.tracks_created as u64,
                report.tracks_updated as u64,
                report.tracks_skipped as u64,
                report.errors.len() as u64,
            ) {
                log::warn!("Job {job_id}: progress write failed: {e}");
            }
            !matches!(db.job_is_cancelled(job_id), Ok(true))
        };

        let report = importer.import_collection(
            &job.artist,
            &job.collection,
            &opts,
            Some(&mut on_progress),
        )?;

        self.db.update_job_progress(
            job_id,
            report.shows_total as u64,
            report.shows_processed as u64,
            report.tracks_created as u64,
            report.tracks_updated as u64,
            report.tracks_skipped as u64,
            report.errors.len() as u64,
        )?;

        if report.cancelled {
            // cancel_job already moved the row to cancelled; just log
            log::info!("Job {job_id} cancelled after {} shows", report.shows_processed);
            return Ok(());
        }

        let message = format!(
            "{} shows: {} created, {} updated, {} unchanged, {} unmatched",
            report.shows_processed,
            report.tracks_created,
            report.tracks_updated,
            report.tracks_skipped,
            report.tracks_unmatched
        );
        self.db
            .finish_job(job_id, JobStatus::Completed, Some(&message), &report.errors)?;
        log::info!("Job {job_id} completed: {message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtistMapping;
    use crate::db::models::{Show, Track};
    use crate::matcher::normalize;

    fn test_config() -> AppConfig {
        AppConfig {
            artists: vec![ArtistMapping {
                name: "Grateful Dead".to_string(),
                collection: "GratefulDead".to_string(),
            }],
            ..Default::default()
        }
    }

    fn seeded_cache(dir: &tempfile::TempDir) -> MetadataCache {
        let cache = MetadataCache::open(dir.path()).unwrap();
        let show = Show {
            identifier: "gd1977-05-08.sbd".to_string(),
            title: "Barton Hall".to_string(),
            date: "1977-05-08".to_string(),
            venue: Some("Barton Hall".to_string()),
            taper: None,
            server: None,
            dir: None,
            avg_rating: 4.9,
            num_reviews: 100,
            downloads: 500_000,
            tracks: vec![Track {
                name: "t01.flac".to_string(),
                title: Some("Morning Dew".to_string()),
                track_number: Some(1),
                length_secs: Some(640.0),
                format: "Flac".to_string(),
                sha1: "sku-dew".to_string(),
            }],
        };
        cache.store_show(&show).unwrap();
        let mut progress = cache.load_progress("GratefulDead");
        progress.downloaded.insert(show.identifier);
        cache.store_progress("GratefulDead", &progress).unwrap();
        cache
    }

    #[test]
    fn test_publish_requires_known_artist() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let queue = JobQueue::new(&db, &cfg);

        assert!(matches!(
            queue.publish("Phish", None, None, false),
            Err(JobError::Config(ConfigError::UnknownArtist(_)))
        ));
        let job = queue.publish("Grateful Dead", Some(10), None, true).unwrap();
        assert_eq!(job.collection, "GratefulDead");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.dry_run);
    }

    #[test]
    fn test_worker_runs_queued_job_to_completion() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_song("Grateful Dead", "Morning Dew", &normalize("Morning Dew"), &[])
            .unwrap();
        let cfg = test_config();
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);

        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, false).unwrap();

        let worker = Worker::new(&db, &cfg, &cache);
        assert_eq!(worker.run_pending().unwrap(), 1);

        let done = queue.get(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_shows, 1);
        assert_eq!(done.tracks_created, 1);
        assert_eq!(done.progress, 100);
        assert!(done.finished_at.is_some());

        // Lock was released on the way out
        let locks = LockService::new(&db, cfg.locks.clone());
        assert!(!locks.is_locked("import", "GratefulDead").unwrap());
    }

    #[test]
    fn test_cancelled_before_start_never_runs() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);

        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, false).unwrap();
        assert!(queue.cancel(job.id).unwrap());

        let worker = Worker::new(&db, &cfg, &cache);
        assert_eq!(worker.run_pending().unwrap(), 0);
        assert_eq!(queue.get(job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_held_lock_defers_job() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);

        let locks = LockService::new(&db, cfg.locks.clone());
        let held = locks.acquire("import", "GratefulDead", 0).unwrap();

        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, false).unwrap();

        let worker = Worker::new(&db, &cfg, &cache);
        assert_eq!(worker.run_pending().unwrap(), 0);
        // Still queued, runnable once the lock clears
        assert_eq!(queue.get(job.id).unwrap().status, JobStatus::Queued);

        locks.release(held).unwrap();
        assert_eq!(worker.run_pending().unwrap(), 1);
        assert_eq!(queue.get(job.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_dry_run_job_reports_without_writes() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);

        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, true).unwrap();
        Worker::new(&db, &cfg, &cache).run_pending().unwrap();

        let done = queue.get(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.tracks_created, 1);

        let store = SqliteCatalog::new(&db);
        assert_eq!(store.item_count().unwrap(), 0);
    }

    #[test]
    fn test_update_status() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, false).unwrap();

        queue
            .update_status(job.id, JobStatus::Failed, Some("supervisor timeout"))
            .unwrap();
        let j = queue.get(job.id).unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.message.as_deref(), Some("supervisor timeout"));
        assert!(j.finished_at.is_some());

        assert!(matches!(
            queue.update_status(9999, JobStatus::Failed, None),
            Err(JobError::NotFound(9999))
        ));
    }

    #[test]
    fn test_purge_delegates_retention() {
        let db = Database::open_in_memory().unwrap();
        let cfg = test_config();
        let queue = JobQueue::new(&db, &cfg);
        let job = queue.publish("Grateful Dead", None, None, false).unwrap();
        queue.cancel(job.id).unwrap();
        // Too recent to purge
        assert_eq!(queue.purge().unwrap(), 0);
    }
}
