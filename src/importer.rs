use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::archive::{ApiError, ArchiveApi};
use crate::cache::{CacheError, MetadataCache};
use crate::catalog::{CatalogError, CatalogStore, ItemFields, UpsertAction};
use crate::crawler::{self, CrawlError, CrawlOptions};
use crate::db::models::{Show, Track};
use crate::db::{Database, DbError};
use crate::matcher::{clean_track_name, MatchEngine};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Crawl(#[from] CrawlError),
}

type Result<T> = std::result::Result<T, ImportError>;

#[derive(Debug, Default, Clone)]
pub struct ImportOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    /// Count what would change without writing to the catalog.
    pub dry_run: bool,
}

/// Aggregate outcome of an import run. Per-show failures are collected
/// here instead of aborting the batch.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub shows_total: usize,
    pub shows_processed: usize,
    pub tracks_created: usize,
    pub tracks_updated: usize,
    pub tracks_skipped: usize,
    pub tracks_matched: usize,
    pub tracks_unmatched: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl ImportReport {
    pub fn tracks_total(&self) -> usize {
        self.tracks_created + self.tracks_updated + self.tracks_skipped
    }
}

/// Callback invoked after each processed show: (processed, total, the
/// report so far). The report carries running track counters so callers
/// can checkpoint them. Returning false stops the import cleanly.
pub type ImportProgressFn<'f> = &'f mut dyn FnMut(usize, usize, &ImportReport) -> bool;

/// Drives cached show metadata through matching and into the catalog
/// store. Item identity is the track's content-hash SKU, which makes
/// every import re-runnable: unchanged tracks are skipped, changed ones
/// updated in place.
pub struct Importer<'a, S: CatalogStore> {
    db: &'a Database,
    cache: &'a MetadataCache,
    client: &'a dyn ArchiveApi,
    store: &'a S,
    matcher: MatchEngine<'a>,
}

impl<'a, S: CatalogStore> Importer<'a, S> {
    pub fn new(
        db: &'a Database,
        cache: &'a MetadataCache,
        client: &'a dyn ArchiveApi,
        store: &'a S,
        matcher: MatchEngine<'a>,
    ) -> Self {
        Self {
            db,
            cache,
            client,
            store,
            matcher,
        }
    }

    /// Import every cached show of a collection for one artist. Crawls
    /// first when nothing is cached yet, so a bare `import` works on a
    /// fresh machine.
    pub fn import_collection(
        &mut self,
        artist: &str,
        collection: &str,
        opts: &ImportOptions,
        mut on_progress: Option<ImportProgressFn<'_>>,
    ) -> Result<ImportReport> {
        let mut progress = self.cache.load_progress(collection);
        if progress.downloaded.is_empty() {
            log::info!("No cached shows for {collection}, crawling first");
            crawler::download(
                self.client,
                self.cache,
                collection,
                &CrawlOptions::default(),
                None,
            )?;
            progress = self.cache.load_progress(collection);
        }

        let identifiers: Vec<String> = progress
            .downloaded
            .iter()
            .skip(opts.offset)
            .take(opts.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        let total = identifiers.len();

        self.matcher.set_record_misses(!opts.dry_run);
        let songs = self.matcher.build_indexes(artist)?;
        if songs == 0 {
            log::warn!("No canonical songs loaded for {artist}; every track will queue for review");
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} shows {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        let mut report = ImportReport {
            shows_total: total,
            ..Default::default()
        };
        for (processed, identifier) in identifiers.iter().enumerate() {
            pb.set_message(identifier.clone());

            match self.load_or_fetch(identifier) {
                Ok(show) => {
                    self.import_show_tracks(&show, artist, opts.dry_run, &mut report);
                    report.shows_processed += 1;
                }
                Err(ImportError::Api(e)) if e.is_connectivity() => {
                    // Unreachable API poisons the whole batch — stop here
                    pb.abandon_with_message("aborted");
                    return Err(ImportError::Api(e));
                }
                Err(e) => {
                    log::warn!("Skipping {identifier}: {e}");
                    report.errors.push(format!("{identifier}: {e}"));
                }
            }

            pb.inc(1);
            if let Some(cb) = on_progress.as_deref_mut() {
                if !cb(processed + 1, total, &report) {
                    log::info!("Import of {collection} stopped by caller");
                    report.cancelled = true;
                    break;
                }
            }
        }

        pb.finish_with_message("done");
        self.matcher.clear_indexes(Some(artist));
        Ok(report)
    }

    /// Import a single show by identifier.
    pub fn import_show(
        &mut self,
        identifier: &str,
        artist: &str,
        dry_run: bool,
    ) -> Result<ImportReport> {
        self.matcher.set_record_misses(!dry_run);
        self.matcher.build_indexes(artist)?;
        let show = self.load_or_fetch(identifier)?;
        let mut report = ImportReport::default();
        self.import_show_tracks(&show, artist, dry_run, &mut report);
        report.shows_total = 1;
        report.shows_processed = 1;
        Ok(report)
    }

    fn load_or_fetch(&self, identifier: &str) -> Result<Show> {
        if let Some(show) = self.cache.load_show(identifier) {
            return Ok(show);
        }
        let show = self.client.fetch_show_metadata(identifier)?;
        self.cache.store_show(&show)?;
        Ok(show)
    }

    /// Run every track of a show through matching and the catalog store.
    /// A failing track is collected into the report's error list and the
    /// rest of the show still imports.
    fn import_show_tracks(
        &mut self,
        show: &Show,
        artist: &str,
        dry_run: bool,
        report: &mut ImportReport,
    ) {
        for track in &show.tracks {
            if let Err(e) = self.import_track(show, track, artist, dry_run, report) {
                log::warn!("Skipping track {} in {}: {e}", track.name, show.identifier);
                report
                    .errors
                    .push(format!("{}/{}: {e}", show.identifier, track.name));
            }
        }
    }

    fn import_track(
        &mut self,
        show: &Show,
        track: &Track,
        artist: &str,
        dry_run: bool,
        report: &mut ImportReport,
    ) -> Result<()> {
        let raw = track.title.as_deref().unwrap_or(&track.name);
        let matched = self.matcher.match_track(raw, artist)?;
        match &matched {
            Some(m) => {
                log::debug!(
                    "{raw} -> {} ({} {:.0})",
                    m.canonical_title,
                    m.match_type.as_str(),
                    m.confidence
                );
                report.tracks_matched += 1;
            }
            None => report.tracks_unmatched += 1,
        }

        let fields = ItemFields {
            name: track.name.clone(),
            title: matched
                .as_ref()
                .map(|m| m.canonical_title.clone())
                .or_else(|| Some(clean_track_name(raw)))
                .filter(|t| !t.is_empty()),
            canonical_key: matched.as_ref().map(|m| m.canonical_key.clone()),
            artist: artist.to_string(),
            show_identifier: show.identifier.clone(),
            show_date: (!show.date.is_empty()).then(|| show.date.clone()),
            venue: show.venue.clone(),
            track_number: track.track_number,
            length_secs: track.length_secs,
            format: track.format.clone(),
        };

        if dry_run {
            match self.store.get_item(track.sku())? {
                None => report.tracks_created += 1,
                Some((_, existing)) if existing == fields => report.tracks_skipped += 1,
                Some(_) => report.tracks_updated += 1,
            }
            return Ok(());
        }

        let outcome = self.store.upsert_item(track.sku(), &fields)?;
        match outcome.action {
            UpsertAction::Created => report.tracks_created += 1,
            UpsertAction::Updated => report.tracks_updated += 1,
            UpsertAction::Unchanged => report.tracks_skipped += 1,
        }

        let artist_group = format!("artist/{artist}");
        self.store.assign_to_group(outcome.item_id, &artist_group)?;
        if !show.date.is_empty() {
            let date_group = format!("{artist_group}/{}", show.date);
            self.store.assign_to_group(outcome.item_id, &date_group)?;
        }
        Ok(())
    }
}
