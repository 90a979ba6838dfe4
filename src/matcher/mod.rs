pub mod metaphone;

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::MatchingConfig;
use crate::db::models::{MatchResult, MatchType};
use crate::db::{Database, Result};
use metaphone::metaphone;

/// Confidence assigned per tier. Fuzzy scores are capped just below the
/// alias tier so a configured alias always outranks a lucky fuzzy hit.
const EXACT_CONFIDENCE: f64 = 100.0;
const ALIAS_CONFIDENCE: f64 = 95.0;
const PHONETIC_CONFIDENCE: f64 = 80.0;
const FUZZY_CAP: f64 = 94.0;

struct SongEntry {
    canonical_key: String,
    title: String,
    normalized: String,
    phonetic: String,
}

struct ArtistIndex {
    songs: Vec<SongEntry>,
    /// normalized title → song index
    exact: HashMap<String, usize>,
    /// normalized alias → song index
    alias: HashMap<String, usize>,
}

/// Hybrid track-name matcher. Indexes are built once per artist per run
/// and released explicitly to bound memory during large batch jobs.
pub struct MatchEngine<'a> {
    db: &'a Database,
    cfg: MatchingConfig,
    indexes: HashMap<String, ArtistIndex>,
    record_misses: bool,
}

impl<'a> MatchEngine<'a> {
    pub fn new(db: &'a Database, cfg: MatchingConfig) -> Self {
        Self {
            db,
            cfg,
            indexes: HashMap::new(),
            record_misses: true,
        }
    }

    /// Toggle the unmatched review queue. Dry runs turn this off so they
    /// leave no trace in the database.
    pub fn set_record_misses(&mut self, record: bool) {
        self.record_misses = record;
    }

    /// Build (or reuse) the lookup indexes for an artist from the canonical
    /// song definitions. Returns the number of indexed songs.
    pub fn build_indexes(&mut self, artist: &str) -> Result<usize> {
        if let Some(idx) = self.indexes.get(artist) {
            return Ok(idx.songs.len());
        }

        let rows = self.db.get_songs_for_artist(artist)?;
        let mut songs = Vec::with_capacity(rows.len());
        let mut exact = HashMap::new();
        let mut alias = HashMap::new();

        for song in rows {
            let normalized = normalize(&song.title);
            let entry = SongEntry {
                phonetic: metaphone(&normalized),
                canonical_key: song.canonical_key.clone(),
                title: song.title.clone(),
                normalized: normalized.clone(),
            };
            let idx = songs.len();
            exact.entry(normalized).or_insert(idx);
            for a in &song.aliases {
                alias.entry(normalize(a)).or_insert(idx);
            }
            songs.push(entry);
        }

        log::debug!(
            "Built match indexes for {artist}: {} songs, {} aliases",
            songs.len(),
            alias.len()
        );
        self.indexes
            .insert(artist.to_string(), ArtistIndex { songs, exact, alias });
        Ok(self.indexes[artist].songs.len())
    }

    /// Release indexes for one artist, or all of them.
    pub fn clear_indexes(&mut self, artist: Option<&str>) {
        match artist {
            Some(a) => {
                self.indexes.remove(a);
            }
            None => self.indexes.clear(),
        }
    }

    /// Match a raw track name against the artist's canonical songs.
    /// Tiers are tried in order — exact, alias, phonetic, bounded fuzzy —
    /// and the first hit wins. A miss across all tiers is recorded in the
    /// unmatched review queue with the best sub-threshold candidate,
    /// unless miss recording is switched off.
    pub fn match_track(&mut self, raw_name: &str, artist: &str) -> Result<Option<MatchResult>> {
        self.build_indexes(artist)?;
        let index = &self.indexes[artist];

        let cleaned = clean_track_name(raw_name);
        let normalized = normalize(&cleaned);
        if normalized.is_empty() {
            return Ok(None);
        }

        // Tier 1: exact normalized equality
        if let Some(&i) = index.exact.get(&normalized) {
            return Ok(Some(result(&index.songs[i], MatchType::Exact, EXACT_CONFIDENCE)));
        }

        // Tier 2: configured alternate spellings
        if let Some(&i) = index.alias.get(&normalized) {
            return Ok(Some(result(&index.songs[i], MatchType::Alias, ALIAS_CONFIDENCE)));
        }

        // Tier 3: metaphone equality or bounded substring containment
        let code = metaphone(&normalized);
        if !code.is_empty() {
            for song in &index.songs {
                if song.phonetic.is_empty() {
                    continue;
                }
                let hit = song.phonetic == code
                    || (code.len() >= self.cfg.phonetic_min_len
                        && song.phonetic.len() >= self.cfg.phonetic_min_len
                        && (code.contains(&song.phonetic) || song.phonetic.contains(&code)));
                if hit {
                    return Ok(Some(result(song, MatchType::Phonetic, PHONETIC_CONFIDENCE)));
                }
            }
        }

        // Tier 4: bounded fuzzy similarity
        let mut best: Option<(usize, f64)> = None;
        for (i, song) in index.songs.iter().enumerate() {
            let score = strsim::sorensen_dice(&normalized, &song.normalized) * 100.0;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((i, score));
            }
        }

        if let Some((i, score)) = best {
            if score >= self.cfg.fuzzy_threshold {
                let song = &index.songs[i];
                return Ok(Some(result(song, MatchType::Fuzzy, score.min(FUZZY_CAP))));
            }
            // Miss: keep the best candidate around for human review
            if self.record_misses {
                let song = &index.songs[i];
                self.db
                    .record_unmatched(artist, &cleaned, Some(&song.title), Some(score))?;
            }
        } else if self.record_misses {
            self.db.record_unmatched(artist, &cleaned, None, None)?;
        }

        Ok(None)
    }
}

fn result(song: &SongEntry, match_type: MatchType, confidence: f64) -> MatchResult {
    MatchResult {
        canonical_key: song.canonical_key.clone(),
        canonical_title: song.title.clone(),
        match_type,
        confidence,
    }
}

/// Normalize a name for comparison: fold diacritics to ASCII, unify Unicode
/// dashes, lowercase, collapse whitespace.
pub fn normalize(s: &str) -> String {
    // Unify dashes before ASCII folding (deunicode renders '—' as "--")
    let dashed = s.replace(['–', '—', '‐'], "-");
    deunicode::deunicode(&dashed)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn track_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Leading track numbers ("01 - ", "1. ", "01_") and taper-style
    // position prefixes ("gd77-05-08d1t02", "d2t05")
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:[a-z]{1,8}\d{2,4}[-.]\d{2}[-.]\d{2})?(?:d\d{1,2})?t?\d{1,2}\s*[-._)\s]\s*")
            .unwrap()
    })
}

/// Strip filename artifacts from a raw track name: extension, leading track
/// number patterns, trailing segue markers.
pub fn clean_track_name(raw: &str) -> String {
    let mut name = raw.trim();

    // Extension, only when it looks like an audio file
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if crate::AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            name = stem;
        }
    }

    let stripped = track_prefix_re().replace(name, "");
    strip_segue_marker(stripped.trim())
}

/// Strip trailing segue markers from a song title.
fn strip_segue_marker(title: &str) -> String {
    let t = title.trim_end();
    for marker in &[" -->", "-->", " ->", "->", " >"] {
        if let Some(stripped) = t.strip_suffix(marker) {
            return stripped.trim_end().to_string();
        }
    }
    t.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(db: &Database) -> MatchEngine<'_> {
        MatchEngine::new(db, MatchingConfig::default())
    }

    fn seed(db: &Database) {
        for (title, aliases) in [
            ("Eyes of the World", vec![]),
            ("Estimated Prophet", vec!["estimated".to_string()]),
            ("Morning Dew", vec![]),
            ("Terrapin Station", vec![]),
        ] {
            db.upsert_song("Grateful Dead", title, &normalize(title), &aliases)
                .unwrap();
        }
    }

    #[test]
    fn test_exact_match_after_normalization() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        let r = m
            .match_track("Eyes Of The World", "Grateful Dead")
            .unwrap()
            .unwrap();
        assert_eq!(r.match_type, MatchType::Exact);
        assert_eq!(r.confidence, 100.0);
        assert_eq!(r.canonical_title, "Eyes of the World");
    }

    #[test]
    fn test_alias_match() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        let r = m.match_track("Estimated", "Grateful Dead").unwrap().unwrap();
        assert_eq!(r.match_type, MatchType::Alias);
        assert_eq!(r.confidence, 95.0);
    }

    #[test]
    fn test_phonetic_match() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        // Misspelled but phonetically identical
        let r = m
            .match_track("Terrapin Stashun", "Grateful Dead")
            .unwrap()
            .unwrap();
        assert_eq!(r.match_type, MatchType::Phonetic);
        assert_eq!(r.canonical_title, "Terrapin Station");
    }

    #[test]
    fn test_fuzzy_match_below_alias_cap() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        // Dropped letter changes the metaphone code but similarity stays high
        let r = m.match_track("Mornin Dew", "Grateful Dead").unwrap().unwrap();
        assert_eq!(r.match_type, MatchType::Fuzzy);
        assert!(r.confidence >= 75.0 && r.confidence <= 94.0);
        assert_eq!(r.canonical_title, "Morning Dew");
    }

    #[test]
    fn test_miss_recorded_for_review() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        let r = m
            .match_track("Drums and Space Interlude", "Grateful Dead")
            .unwrap();
        assert!(r.is_none());
        let unmatched = db.list_unmatched("Grateful Dead", 10).unwrap();
        assert_eq!(unmatched.len(), 1);
        assert!(unmatched[0].suggestion.is_some());
        assert!(unmatched[0].confidence.unwrap() < 75.0);
    }

    #[test]
    fn test_miss_not_recorded_when_disabled() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        m.set_record_misses(false);
        let r = m
            .match_track("Drums and Space Interlude", "Grateful Dead")
            .unwrap();
        assert!(r.is_none());
        assert!(db.list_unmatched("Grateful Dead", 10).unwrap().is_empty());

        // Re-enabled, the same miss lands in the queue
        m.set_record_misses(true);
        m.match_track("Drums and Space Interlude", "Grateful Dead")
            .unwrap();
        assert_eq!(db.list_unmatched("Grateful Dead", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_deterministic_for_fixed_index() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        let a = m.match_track("Eyes of the World", "Grateful Dead").unwrap().unwrap();
        let b = m.match_track("Eyes of the World", "Grateful Dead").unwrap().unwrap();
        assert_eq!(a.canonical_key, b.canonical_key);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_clear_indexes() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let mut m = engine(&db);
        m.build_indexes("Grateful Dead").unwrap();
        m.clear_indexes(Some("Grateful Dead"));
        assert!(m.indexes.is_empty());
        m.build_indexes("Grateful Dead").unwrap();
        m.clear_indexes(None);
        assert!(m.indexes.is_empty());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Café   del — Mar "), "cafe del - mar");
        assert_eq!(normalize("Eyes Of The World"), "eyes of the world");
    }

    #[test]
    fn test_clean_track_name() {
        assert_eq!(clean_track_name("01 - Bertha.flac"), "Bertha");
        assert_eq!(clean_track_name("gd77-05-08d1t02 Loser.mp3"), "Loser");
        assert_eq!(clean_track_name("St. Stephen ->"), "St. Stephen");
        assert_eq!(clean_track_name("Dark Star.shn"), "Dark Star");
        // Non-audio extension survives
        assert_eq!(clean_track_name("Mr. Charlie"), "Mr. Charlie");
    }
}
