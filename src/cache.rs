use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::Show;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, CacheError>;

/// Per-collection crawl progress. Mutated incrementally during a crawl and
/// read on every invocation to decide what is already cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub downloaded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub last_full_sync: Option<String>,
    pub last_incremental_sync: Option<String>,
}

impl ProgressState {
    /// Timestamp of the most recent successful sync of either kind,
    /// used as the `since` bound for incremental crawls.
    pub fn last_sync(&self) -> Option<&str> {
        match (&self.last_full_sync, &self.last_incremental_sync) {
            (Some(f), Some(i)) => Some(if i.as_str() > f.as_str() { i } else { f }),
            (Some(f), None) => Some(f),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        }
    }
}

/// Local metadata cache: one JSON document per show plus one progress file
/// per collection. All writes go through write-to-temp-then-rename so
/// concurrent readers never observe a partial file; unreadable files are
/// treated as cache misses, not failures.
pub struct MetadataCache {
    root: PathBuf,
}

impl MetadataCache {
    pub fn open(root: &Path) -> Result<Self> {
        let shows = root.join("shows");
        fs::create_dir_all(&shows).map_err(|e| CacheError::Io {
            path: shows.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn show_path(&self, identifier: &str) -> PathBuf {
        // Identifiers are path-hostile in theory; flatten separators
        let safe = identifier.replace(['/', '\\'], "_");
        self.root.join("shows").join(format!("{safe}.json"))
    }

    fn progress_path(&self, collection: &str) -> PathBuf {
        let safe = collection.replace(['/', '\\'], "_");
        self.root.join(format!("progress-{safe}.json"))
    }

    pub fn has_show(&self, identifier: &str) -> bool {
        self.show_path(identifier).exists()
    }

    /// Load a cached show. Missing or corrupted files both read as None.
    pub fn load_show(&self, identifier: &str) -> Option<Show> {
        let path = self.show_path(identifier);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(show) => Some(show),
            Err(e) => {
                log::warn!(
                    "Corrupted cache file {} ({e}), treating as miss",
                    path.display()
                );
                None
            }
        }
    }

    pub fn store_show(&self, show: &Show) -> Result<()> {
        let json = serde_json::to_string_pretty(show)?;
        atomic_write(&self.show_path(&show.identifier), json.as_bytes())
    }

    pub fn remove_show(&self, identifier: &str) -> Result<()> {
        let path = self.show_path(identifier);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| CacheError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// All cached show identifiers (filename stems under shows/).
    pub fn cached_identifiers(&self) -> Result<Vec<String>> {
        let dir = self.root.join("shows");
        let entries = fs::read_dir(&dir).map_err(|e| CacheError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load progress for a collection. Missing or corrupted files read as
    /// a fresh state (the crawl re-checks per-show files anyway).
    pub fn load_progress(&self, collection: &str) -> ProgressState {
        let path = self.progress_path(collection);
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!(
                        "Corrupted progress file {} ({e}), starting fresh",
                        path.display()
                    );
                    ProgressState::default()
                }
            },
            Err(_) => ProgressState::default(),
        }
    }

    pub fn store_progress(&self, collection: &str, state: &ProgressState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.progress_path(collection), json.as_bytes())
    }
}

/// Write to a sibling temp file, then rename into place.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |e: std::io::Error| CacheError::Io {
        path: path.display().to_string(),
        source: e,
    };
    {
        let mut f = fs::File::create(&tmp).map_err(io_err)?;
        f.write_all(bytes).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Track;

    fn sample_show(identifier: &str) -> Show {
        Show {
            identifier: identifier.to_string(),
            title: "Test Show".to_string(),
            date: "1977-05-08".to_string(),
            venue: Some("Barton Hall".to_string()),
            taper: None,
            server: None,
            dir: None,
            avg_rating: 4.8,
            num_reviews: 12,
            downloads: 1000,
            tracks: vec![Track {
                name: "t01.flac".to_string(),
                title: Some("Loser".to_string()),
                track_number: Some(1),
                length_secs: Some(400.0),
                format: "Flac".to_string(),
                sha1: "deadbeef".to_string(),
            }],
        }
    }

    #[test]
    fn test_show_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();

        assert!(!cache.has_show("gd1977-05-08.sbd"));
        cache.store_show(&sample_show("gd1977-05-08.sbd")).unwrap();
        assert!(cache.has_show("gd1977-05-08.sbd"));

        let loaded = cache.load_show("gd1977-05-08.sbd").unwrap();
        assert_eq!(loaded.tracks.len(), 1);
        assert_eq!(loaded.tracks[0].sha1, "deadbeef");

        assert_eq!(cache.cached_identifiers().unwrap(), vec!["gd1977-05-08.sbd"]);

        cache.remove_show("gd1977-05-08.sbd").unwrap();
        assert!(!cache.has_show("gd1977-05-08.sbd"));
        // Removing a missing show is not an error
        cache.remove_show("gd1977-05-08.sbd").unwrap();
    }

    #[test]
    fn test_corrupted_show_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();
        fs::write(dir.path().join("shows/broken.json"), "{not json").unwrap();
        assert!(cache.load_show("broken").is_none());
    }

    #[test]
    fn test_progress_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();

        let mut p = cache.load_progress("GratefulDead");
        assert!(p.downloaded.is_empty());

        p.downloaded.insert("a".to_string());
        p.failed.insert("b".to_string());
        p.last_full_sync = Some("2026-01-01 00:00:00".to_string());
        cache.store_progress("GratefulDead", &p).unwrap();

        let p2 = cache.load_progress("GratefulDead");
        assert_eq!(p2.downloaded.len(), 1);
        assert_eq!(p2.failed.len(), 1);

        fs::write(dir.path().join("progress-GratefulDead.json"), "garbage").unwrap();
        let p3 = cache.load_progress("GratefulDead");
        assert!(p3.downloaded.is_empty());
    }

    #[test]
    fn test_last_sync_prefers_newest() {
        let mut p = ProgressState::default();
        assert!(p.last_sync().is_none());
        p.last_full_sync = Some("2026-01-01 00:00:00".to_string());
        p.last_incremental_sync = Some("2026-02-01 00:00:00".to_string());
        assert_eq!(p.last_sync(), Some("2026-02-01 00:00:00"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();
        cache.store_show(&sample_show("x")).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("shows"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
