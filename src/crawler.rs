use std::collections::HashMap;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::archive::{ApiError, ArchiveApi, SearchDoc, BATCH_STATS_LIMIT};
use crate::cache::{CacheError, MetadataCache};
use crate::db::models::ShowStats;

/// Persist crawl progress after this many processed shows, so an
/// interrupted run resumes from the last completed batch.
const PROGRESS_BATCH: usize = 10;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Default, Clone)]
pub struct CrawlOptions {
    /// Cap on enumerated recordings (None = whole collection).
    pub limit: Option<usize>,
    /// Re-download shows that are already cached.
    pub force: bool,
    /// Restrict to shows published after the last successful sync.
    pub incremental: bool,
    /// Explicit lower bound for incremental mode (overrides stored sync time).
    pub since: Option<String>,
}

/// Outcome of one crawl run.
#[derive(Debug, Default)]
pub struct CrawlResult {
    pub total_recordings: usize,
    pub unique_shows: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub failed: usize,
    pub failed_identifiers: Vec<String>,
    /// True when a progress callback asked to stop early.
    pub stopped_early: bool,
}

/// Callback invoked after each processed show: (processed, total).
/// Returning false stops the crawl cleanly.
pub type ProgressFn<'f> = &'f mut dyn FnMut(usize, usize) -> bool;

/// Ensure fresh cached metadata for a collection.
///
/// Enumerates recordings page-by-page, picks the best recording per show
/// date (soundboard > rating > reviews > downloads, first seen wins ties),
/// and caches each selected show's metadata. Already-cached identifiers
/// are skipped unless forced, which is what makes an interrupted crawl
/// resumable: re-running downloads only what is missing.
pub fn download(
    client: &dyn ArchiveApi,
    cache: &MetadataCache,
    collection: &str,
    opts: &CrawlOptions,
    mut on_progress: Option<ProgressFn<'_>>,
) -> Result<CrawlResult> {
    let mut progress = cache.load_progress(collection);

    let since = if opts.incremental {
        opts.since
            .clone()
            .or_else(|| progress.last_sync().map(|s| s.to_string()))
    } else {
        None
    };
    if let Some(ref s) = since {
        log::info!("Incremental crawl of {collection} since {s}");
    }

    let docs = enumerate(client, collection, since.as_deref(), opts.limit)?;
    let total_recordings = docs.len();

    let stats = batch_stats(client, &docs)?;
    let selected = select_best_per_date(&docs, &stats);
    let unique_shows = selected.len();

    log::info!(
        "{collection}: {total_recordings} recordings, {unique_shows} unique show dates"
    );

    let pb = ProgressBar::new(unique_shows as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} shows ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let mut result = CrawlResult {
        total_recordings,
        unique_shows,
        ..Default::default()
    };
    let mut since_flush = 0usize;

    for (processed, doc) in selected.iter().enumerate() {
        pb.set_message(doc.identifier.clone());

        // A corrupted cache file reads as None and gets re-downloaded
        if !opts.force && cache.load_show(&doc.identifier).is_some() {
            result.cached += 1;
            progress.downloaded.insert(doc.identifier.clone());
        } else {
            match fetch_and_store(client, cache, doc, &stats) {
                Ok(()) => {
                    result.downloaded += 1;
                    progress.downloaded.insert(doc.identifier.clone());
                    progress.failed.remove(&doc.identifier);
                }
                Err(CrawlError::Api(e)) if e.is_connectivity() => {
                    // The API is down, not this one item — persist what we
                    // have and abort the run
                    cache.store_progress(collection, &progress)?;
                    pb.abandon_with_message("aborted");
                    return Err(CrawlError::Api(e));
                }
                Err(e) => {
                    log::warn!("Failed to fetch {}: {e}", doc.identifier);
                    result.failed += 1;
                    result.failed_identifiers.push(doc.identifier.clone());
                    progress.failed.insert(doc.identifier.clone());
                }
            }
        }

        pb.inc(1);
        since_flush += 1;
        if since_flush >= PROGRESS_BATCH {
            cache.store_progress(collection, &progress)?;
            since_flush = 0;
        }

        if let Some(cb) = on_progress.as_deref_mut() {
            if !cb(processed + 1, unique_shows) {
                log::info!("Crawl of {collection} stopped by caller");
                result.stopped_early = true;
                break;
            }
        }
    }

    // Record the sync watermark only for complete runs
    if !result.stopped_early {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if opts.incremental {
            progress.last_incremental_sync = Some(now);
        } else if opts.limit.is_none() {
            progress.last_full_sync = Some(now);
        }
    }
    cache.store_progress(collection, &progress)?;
    pb.finish_with_message("done");

    Ok(result)
}

/// Re-attempt every identifier recorded as failed in the progress state.
pub fn retry_failed(
    client: &dyn ArchiveApi,
    cache: &MetadataCache,
    collection: &str,
) -> Result<CrawlResult> {
    let mut progress = cache.load_progress(collection);
    let failed: Vec<String> = progress.failed.iter().cloned().collect();

    let mut result = CrawlResult {
        total_recordings: failed.len(),
        unique_shows: failed.len(),
        ..Default::default()
    };

    for identifier in failed {
        let doc = SearchDoc {
            identifier: identifier.clone(),
            date: None,
        };
        match fetch_and_store(client, cache, &doc, &HashMap::new()) {
            Ok(()) => {
                result.downloaded += 1;
                progress.failed.remove(&identifier);
                progress.downloaded.insert(identifier);
            }
            Err(CrawlError::Api(e)) if e.is_connectivity() => {
                cache.store_progress(collection, &progress)?;
                return Err(CrawlError::Api(e));
            }
            Err(e) => {
                log::warn!("Retry failed for {identifier}: {e}");
                result.failed += 1;
                result.failed_identifiers.push(identifier);
            }
        }
    }

    cache.store_progress(collection, &progress)?;
    Ok(result)
}

/// Enumerate (identifier, date) docs page by page, in the order the API
/// returns them.
fn enumerate(
    client: &dyn ArchiveApi,
    collection: &str,
    since: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<SearchDoc>> {
    let page_size = client.page_size();
    let mut docs = Vec::new();
    let mut offset = 0usize;

    loop {
        let rows = match limit {
            Some(l) if docs.len() + page_size > l => l - docs.len(),
            _ => page_size,
        };
        if rows == 0 {
            break;
        }

        let page = client.search_page(collection, rows, offset, since)?;
        let page_len = page.len();
        docs.extend(page);

        if page_len < rows {
            break; // last page
        }
        offset += page_len;
        if limit.map(|l| docs.len() >= l).unwrap_or(false) {
            break;
        }
    }

    Ok(docs)
}

/// Fetch stats for all enumerated identifiers, 100 at a time.
/// Stats failures are non-fatal — selection falls back to defaults.
fn batch_stats(
    client: &dyn ArchiveApi,
    docs: &[SearchDoc],
) -> Result<HashMap<String, ShowStats>> {
    let mut all = HashMap::new();
    let ids: Vec<String> = docs.iter().map(|d| d.identifier.clone()).collect();
    for chunk in ids.chunks(BATCH_STATS_LIMIT) {
        match client.fetch_batch_stats(chunk) {
            Ok(map) => all.extend(map),
            Err(e) if e.is_connectivity() => return Err(e.into()),
            Err(e) => log::warn!("Batch stats failed for {} ids: {e}", chunk.len()),
        }
    }
    Ok(all)
}

/// Group recordings by show date and keep the best one per date.
/// Precedence: soundboard source, then average rating, then review count,
/// then downloads. Ties keep the first-seen recording, so the result is
/// deterministic for a given enumeration order.
fn select_best_per_date<'d>(
    docs: &'d [SearchDoc],
    stats: &HashMap<String, ShowStats>,
) -> Vec<&'d SearchDoc> {
    let mut best_by_date: HashMap<&str, &SearchDoc> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    let mut dateless: Vec<&SearchDoc> = Vec::new();

    for doc in docs {
        let Some(date) = doc.date.as_deref() else {
            // No date to group on — treat as its own show
            dateless.push(doc);
            continue;
        };
        match best_by_date.get(date) {
            None => {
                best_by_date.insert(date, doc);
                order.push(date);
            }
            Some(current) => {
                if beats(doc, current, stats) {
                    best_by_date.insert(date, doc);
                }
            }
        }
    }

    let mut selected: Vec<&SearchDoc> = order.iter().map(|d| best_by_date[d]).collect();
    selected.extend(dateless);
    selected
}

/// Strict precedence comparison: does `a` beat the incumbent `b`?
fn beats(a: &SearchDoc, b: &SearchDoc, stats: &HashMap<String, ShowStats>) -> bool {
    let (sa, sb) = (
        stats.get(&a.identifier).copied().unwrap_or_default(),
        stats.get(&b.identifier).copied().unwrap_or_default(),
    );
    let (sbd_a, sbd_b) = (is_soundboard(&a.identifier), is_soundboard(&b.identifier));

    if sbd_a != sbd_b {
        return sbd_a;
    }
    if sa.avg_rating != sb.avg_rating {
        return sa.avg_rating > sb.avg_rating;
    }
    if sa.num_reviews != sb.num_reviews {
        return sa.num_reviews > sb.num_reviews;
    }
    sa.downloads > sb.downloads
}

/// Detect a soundboard-sourced recording from its identifier.
pub fn is_soundboard(identifier: &str) -> bool {
    let id_lower = identifier.to_lowercase();
    id_lower.contains(".sbd.")
        || id_lower.contains("_sbd_")
        || id_lower.contains("-sbd-")
        || id_lower.ends_with(".sbd")
        || id_lower.contains("sbeok")
}

fn fetch_and_store(
    client: &dyn ArchiveApi,
    cache: &MetadataCache,
    doc: &SearchDoc,
    stats: &HashMap<String, ShowStats>,
) -> Result<()> {
    let mut show = client.fetch_show_metadata(&doc.identifier)?;
    if let Some(s) = stats.get(&doc.identifier) {
        show.avg_rating = s.avg_rating;
        show.num_reviews = s.num_reviews;
        show.downloads = s.downloads;
    }
    cache.store_show(&show)?;
    Ok(())
}
