pub mod breaker;

use std::cell::Cell;
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{ArchiveConfig, BreakerConfig};
use crate::db::models::{Show, ShowStats, Track};
use crate::db::Database;
use breaker::CircuitBreaker;

/// Maximum identifiers per batch stats call.
pub const BATCH_STATS_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("API error on {endpoint}: HTTP {status}: {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("Rate limited, retry after {wait_secs}s")]
    RateLimited { wait_secs: u64 },
    #[error("Circuit breaker open, request not attempted")]
    CircuitOpen,
    #[error("Transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("Malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
    #[error("State store error: {0}")]
    Store(#[from] crate::db::DbError),
}

impl ApiError {
    /// Errors that indicate the API is unreachable (not a per-item problem).
    /// These abort a batch instead of being collected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::Transport { .. })
    }
}

/// One document from the paginated collection search.
#[derive(Debug, Clone)]
pub struct SearchDoc {
    pub identifier: String,
    pub date: Option<String>,
}

/// Archive advanced search response.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: SearchInner,
}

#[derive(Debug, Deserialize)]
struct SearchInner {
    #[serde(rename = "numFound")]
    num_found: usize,
    docs: Vec<RawSearchDoc>,
}

#[derive(Debug, Deserialize)]
struct RawSearchDoc {
    identifier: String,
    date: Option<String>,
    #[serde(default)]
    avg_rating: Option<f64>,
    #[serde(default)]
    num_reviews: Option<i64>,
    #[serde(default)]
    downloads: Option<i64>,
}

/// Archive metadata API response (partial — the fields the pipeline needs).
#[derive(Debug, Deserialize)]
struct MetadataResponse {
    metadata: Option<ItemMetadata>,
    server: Option<String>,
    dir: Option<String>,
    files: Option<Vec<FileEntry>>,
}

#[derive(Debug, Deserialize)]
struct ItemMetadata {
    title: Option<String>,
    date: Option<String>,
    venue: Option<String>,
    taper: Option<String>,
}

/// A single file entry in archive metadata.
#[derive(Debug, Deserialize)]
struct FileEntry {
    name: Option<String>,
    title: Option<String>,
    track: Option<String>,
    length: Option<String>,
    format: Option<String>,
    sha1: Option<String>,
}

/// The slice of the client the crawler and importer consume. Keeping it
/// a trait lets batch logic run against canned pages in tests instead of
/// a live endpoint.
pub trait ArchiveApi {
    /// Configured search page size.
    fn page_size(&self) -> usize;

    /// One page of (identifier, date) docs for a collection. `since`
    /// restricts to items published after the given date (incremental sync).
    fn search_page(
        &self,
        collection: &str,
        rows: usize,
        start: usize,
        since: Option<&str>,
    ) -> Result<Vec<SearchDoc>, ApiError>;

    /// Rating/review/download stats for up to 100 identifiers in one call.
    fn fetch_batch_stats(
        &self,
        identifiers: &[String],
    ) -> Result<HashMap<String, ShowStats>, ApiError>;

    /// Full show metadata for one identifier.
    fn fetch_show_metadata(&self, identifier: &str) -> Result<Show, ApiError>;
}

/// HTTP facade to the external archive. Every call passes through the
/// shared circuit breaker, a retry-with-backoff policy, and a polite
/// minimum delay between consecutive requests.
pub struct ArchiveClient<'a> {
    db: &'a Database,
    cfg: ArchiveConfig,
    breaker: CircuitBreaker<'a>,
    last_call: Cell<Option<Instant>>,
}

impl<'a> ArchiveClient<'a> {
    pub fn new(db: &'a Database, cfg: ArchiveConfig, breaker_cfg: &BreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(db, breaker_cfg.threshold, breaker_cfg.reset_secs);
        Self {
            db,
            cfg,
            breaker,
            last_call: Cell::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Public contract
    // ------------------------------------------------------------------

    /// Identifiers in a collection, in date order, paginated.
    pub fn list_collection_identifiers(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, ApiError> {
        let docs = self.search_page(collection, limit, offset, None)?;
        Ok(docs.into_iter().map(|d| d.identifier).collect())
    }

    /// Total item count for a collection.
    pub fn collection_item_count(&self, collection: &str) -> Result<usize, ApiError> {
        let url = self.search_url(collection, 0, 0, None);
        let resp: SearchResponse = self.call_json("advancedsearch", &url)?;
        Ok(resp.response.num_found)
    }

    /// Cheap reachability probe (zero-row search).
    pub fn test_connectivity(&self) -> bool {
        match self.collection_item_count("etree") {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Connectivity check failed: {e}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn search_url(
        &self,
        collection: &str,
        rows: usize,
        start: usize,
        since: Option<&str>,
    ) -> String {
        let since_clause = match since {
            Some(date) => format!("+AND+publicdate%3A%5B{date}+TO+9999-12-31%5D"),
            None => String::new(),
        };
        format!(
            "{}/advancedsearch.php?\
             q=collection%3A{}{since_clause}&\
             fl%5B%5D=identifier&fl%5B%5D=date&\
             sort%5B%5D=date+asc&\
             rows={rows}&start={start}&output=json",
            self.cfg.base_url, collection
        )
    }

    /// GET a JSON endpoint through the breaker, rate limiter, and retry
    /// loop. The breaker is consulted before every attempt, so a circuit
    /// that opens partway through the retries stops further traffic.
    fn call_json<T: DeserializeOwned>(&self, endpoint: &str, url: &str) -> Result<T, ApiError> {
        let mut attempt = 0u32;
        loop {
            self.breaker.before_call()?;
            self.throttle();

            log::debug!("GET {url} (attempt {})", attempt + 1);
            match ureq::get(url).call() {
                Ok(mut resp) => match resp.body_mut().read_json::<T>() {
                    Ok(parsed) => {
                        self.breaker.on_success()?;
                        return Ok(parsed);
                    }
                    Err(e) => {
                        self.breaker.on_failure()?;
                        return Err(ApiError::Malformed {
                            endpoint: endpoint.to_string(),
                            message: e.to_string(),
                        });
                    }
                },
                Err(ureq::Error::StatusCode(429)) => {
                    // Not a dependency failure — the server is telling us to
                    // slow down. Surface the configured wait to the caller.
                    return Err(ApiError::RateLimited {
                        wait_secs: (self.cfg.retry_delay_ms / 1000).max(1),
                    });
                }
                Err(ureq::Error::StatusCode(status)) => {
                    self.breaker.on_failure()?;
                    // Server errors are worth retrying; client errors are not
                    if status >= 500 && attempt < self.cfg.max_retries {
                        self.backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Http {
                        endpoint: endpoint.to_string(),
                        status,
                        message: format!("request to {url} failed"),
                    });
                }
                Err(e) => {
                    self.breaker.on_failure()?;
                    if attempt < self.cfg.max_retries {
                        self.backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Transport {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Enforce the minimum delay between consecutive calls.
    fn throttle(&self) {
        if let Some(last) = self.last_call.get() {
            let min_gap = Duration::from_millis(self.cfg.rate_limit_ms);
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                thread::sleep(min_gap - elapsed);
            }
        }
        self.last_call.set(Some(Instant::now()));
    }

    fn backoff(&self, attempt: u32) {
        let delay = self.cfg.retry_delay_ms.saturating_mul(1 << attempt);
        log::debug!("Retrying after {delay}ms");
        thread::sleep(Duration::from_millis(delay));
    }
}

impl ArchiveApi for ArchiveClient<'_> {
    fn page_size(&self) -> usize {
        self.cfg.page_size
    }

    fn search_page(
        &self,
        collection: &str,
        rows: usize,
        start: usize,
        since: Option<&str>,
    ) -> Result<Vec<SearchDoc>, ApiError> {
        let url = self.search_url(collection, rows, start, since);
        let resp: SearchResponse = self.call_json("advancedsearch", &url)?;
        Ok(resp
            .response
            .docs
            .into_iter()
            .map(|d| SearchDoc {
                identifier: d.identifier,
                date: d.date.as_deref().and_then(extract_date),
            })
            .collect())
    }

    fn fetch_batch_stats(
        &self,
        identifiers: &[String],
    ) -> Result<HashMap<String, ShowStats>, ApiError> {
        if identifiers.is_empty() {
            return Ok(Default::default());
        }
        if identifiers.len() > BATCH_STATS_LIMIT {
            return Err(ApiError::Malformed {
                endpoint: "advancedsearch".to_string(),
                message: format!(
                    "batch stats limited to {BATCH_STATS_LIMIT} identifiers, got {}",
                    identifiers.len()
                ),
            });
        }
        let clause = identifiers
            .iter()
            .map(|id| encode_identifier(id))
            .collect::<Vec<_>>()
            .join("+OR+");
        let url = format!(
            "{}/advancedsearch.php?\
             q=identifier%3A%28{clause}%29&\
             fl%5B%5D=identifier&fl%5B%5D=avg_rating&fl%5B%5D=num_reviews&fl%5B%5D=downloads&\
             rows={}&output=json",
            self.cfg.base_url,
            identifiers.len()
        );
        let resp: SearchResponse = self.call_json("advancedsearch", &url)?;
        Ok(resp
            .response
            .docs
            .into_iter()
            .map(|d| {
                (
                    d.identifier,
                    ShowStats {
                        avg_rating: d.avg_rating.unwrap_or(0.0),
                        num_reviews: d.num_reviews.unwrap_or(0),
                        downloads: d.downloads.unwrap_or(0),
                    },
                )
            })
            .collect())
    }

    /// Successful responses are cached in the kv store so repeated calls
    /// within a run stay local.
    fn fetch_show_metadata(&self, identifier: &str) -> Result<Show, ApiError> {
        let cache_key = format!("resp:show:{identifier}");
        if let Some(raw) = self.db.kv_get(&cache_key)? {
            match serde_json::from_str::<Show>(&raw) {
                Ok(show) => {
                    log::debug!("Response cache hit for {identifier}");
                    return Ok(show);
                }
                Err(_) => {
                    // Corrupted cache entry: drop and re-fetch
                    self.db.kv_delete(&cache_key)?;
                }
            }
        }

        let url = format!("{}/metadata/{}", self.cfg.base_url, encode_identifier(identifier));
        let resp: MetadataResponse = self.call_json("metadata", &url)?;
        let show = build_show(identifier, resp).ok_or_else(|| ApiError::Malformed {
            endpoint: "metadata".to_string(),
            message: format!("no usable metadata for {identifier}"),
        })?;

        if let Ok(json) = serde_json::to_string(&show) {
            self.db
                .kv_set(&cache_key, &json, Some(self.cfg.response_cache_ttl_secs))?;
        }
        Ok(show)
    }
}

/// Percent-encode characters that break archive URLs (spaces, parens, etc.)
fn encode_identifier(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '(' => out.push_str("%28"),
            ')' => out.push_str("%29"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            _ => out.push(c),
        }
    }
    out
}

/// Extract YYYY-MM-DD from archive date strings.
/// Handles: "1977-05-08T00:00:00Z", "1977-05-08", "1977-05-08T00:00:00"
fn extract_date(raw: &str) -> Option<String> {
    // get() rejects short strings and index 10 landing inside a multibyte
    // char; these are untrusted API values
    let date_part = raw.trim().get(..10)?;
    let b = date_part.as_bytes();
    if b[4] == b'-' && b[7] == b'-' {
        return Some(date_part.to_string());
    }
    None
}

/// Parse a track length that may be "245.36" seconds or "4:05" mm:ss.
fn parse_length(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some((m, s)) = raw.split_once(':') {
        let mins: f64 = m.parse().ok()?;
        let secs: f64 = s.parse().ok()?;
        return Some(mins * 60.0 + secs);
    }
    raw.parse().ok()
}

/// Assemble a Show from the metadata response. Returns None when the
/// response has no metadata block at all.
fn build_show(identifier: &str, resp: MetadataResponse) -> Option<Show> {
    let meta = resp.metadata?;
    let mut tracks: Vec<Track> = resp
        .files
        .unwrap_or_default()
        .into_iter()
        .filter_map(|f| {
            let name = f.name?;
            let sha1 = f.sha1?;
            let ext = std::path::Path::new(&name)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !crate::AUDIO_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            Some(Track {
                title: f.title,
                track_number: f.track.as_deref().and_then(|t| t.trim().parse().ok()),
                length_secs: f.length.as_deref().and_then(parse_length),
                format: f.format.unwrap_or_else(|| ext.clone()),
                sha1,
                name,
            })
        })
        .collect();

    // Stable playback order: track number when present, then name
    tracks.sort_by(|a, b| match (a.track_number, b.track_number) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });

    Some(Show {
        identifier: identifier.to_string(),
        title: meta.title.unwrap_or_else(|| identifier.to_string()),
        date: meta.date.as_deref().and_then(extract_date).unwrap_or_default(),
        venue: meta.venue,
        taper: meta.taper,
        server: resp.server,
        dir: resp.dir,
        avg_rating: 0.0,
        num_reviews: 0,
        downloads: 0,
        tracks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_date() {
        assert_eq!(extract_date("1977-05-08T00:00:00Z"), Some("1977-05-08".into()));
        assert_eq!(extract_date("1977-05-08"), Some("1977-05-08".into()));
        assert_eq!(extract_date("bad"), None);
        assert_eq!(extract_date(""), None);
    }

    #[test]
    fn test_extract_date_non_ascii() {
        // A multibyte char straddling the cut point must not panic
        assert_eq!(extract_date("123456789é"), None);
        assert_eq!(extract_date("1977-05-08é tour"), Some("1977-05-08".into()));
        assert_eq!(extract_date("日付なし"), None);
    }

    #[test]
    fn test_encode_identifier() {
        assert_eq!(encode_identifier("gd1977-05-08.sbd"), "gd1977-05-08.sbd");
        assert_eq!(encode_identifier("a (b) [c]"), "a%20%28b%29%20%5Bc%5D");
    }

    #[test]
    fn test_parse_length() {
        assert_eq!(parse_length("245.36"), Some(245.36));
        assert_eq!(parse_length("4:05"), Some(245.0));
        assert_eq!(parse_length("garbage"), None);
    }

    #[test]
    fn test_build_show_from_metadata_json() {
        let json = r#"{
            "metadata": {
                "title": "Grateful Dead Live at Barton Hall",
                "date": "1977-05-08T00:00:00Z",
                "venue": "Barton Hall",
                "taper": "Betty Cantor"
            },
            "server": "ia800300.us.archive.org",
            "dir": "/1/items/gd1977-05-08",
            "files": [
                {"name": "gd77-05-08d1t01.flac", "title": "New Minglewood Blues",
                 "track": "01", "length": "278.1", "format": "Flac", "sha1": "aaa"},
                {"name": "gd77-05-08d1t02.flac", "title": "Loser",
                 "track": "02", "length": "7:12", "format": "Flac", "sha1": "bbb"},
                {"name": "gd1977-05-08.txt", "format": "Text", "sha1": "ccc"},
                {"name": "nohash.flac", "title": "No Hash", "track": "03", "format": "Flac"}
            ]
        }"#;
        let resp: MetadataResponse = serde_json::from_str(json).unwrap();
        let show = build_show("gd1977-05-08.sbd", resp).unwrap();

        assert_eq!(show.date, "1977-05-08");
        assert_eq!(show.venue.as_deref(), Some("Barton Hall"));
        // Text file and sha1-less file are excluded
        assert_eq!(show.tracks.len(), 2);
        assert_eq!(show.tracks[0].name, "gd77-05-08d1t01.flac");
        assert_eq!(show.tracks[1].length_secs, Some(432.0));
        assert_eq!(show.tracks[1].sku(), "bbb");
    }

    #[test]
    fn test_build_show_without_metadata_block() {
        let resp: MetadataResponse = serde_json::from_str("{}").unwrap();
        assert!(build_show("x", resp).is_none());
    }

    #[test]
    fn test_batch_stats_limit_enforced() {
        let db = Database::open_in_memory().unwrap();
        let client = ArchiveClient::new(
            &db,
            ArchiveConfig::default(),
            &BreakerConfig::default(),
        );
        let ids: Vec<String> = (0..101).map(|i| format!("id{i}")).collect();
        assert!(matches!(
            client.fetch_batch_stats(&ids),
            Err(ApiError::Malformed { .. })
        ));
    }

    #[test]
    fn test_circuit_opens_during_retries() {
        let db = Database::open_in_memory().unwrap();
        let cfg = ArchiveConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            rate_limit_ms: 0,
            retry_delay_ms: 1,
            max_retries: 5,
            ..Default::default()
        };
        let breaker_cfg = BreakerConfig {
            threshold: 2,
            reset_secs: 60,
        };
        let client = ArchiveClient::new(&db, cfg, &breaker_cfg);

        // Connection refused on every attempt. The second failure opens
        // the circuit, so the next attempt must come back CircuitOpen
        // instead of burning through the remaining retries.
        let err = client.fetch_show_metadata("gd1977-05-08").unwrap_err();
        assert!(matches!(err, ApiError::CircuitOpen));
        assert!(client.breaker.is_open().unwrap());
    }

    #[test]
    fn test_search_response_parse() {
        let json = r#"{"response": {"numFound": 2, "docs": [
            {"identifier": "gd77-05-08.sbd", "date": "1977-05-08T00:00:00Z",
             "avg_rating": 4.9, "num_reviews": 120, "downloads": 500000},
            {"identifier": "gd77-05-09.aud"}
        ]}}"#;
        let resp: SearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.response.num_found, 2);
        assert_eq!(resp.response.docs[0].avg_rating, Some(4.9));
        assert!(resp.response.docs[1].date.is_none());
    }
}
