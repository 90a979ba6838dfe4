use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One external recording event, as cached from the archive metadata API.
/// Immutable once cached, apart from a periodic stats refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Show {
    pub identifier: String,
    pub title: String,
    pub date: String,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub taper: Option<String>,
    /// Streaming server hostname.
    #[serde(default)]
    pub server: Option<String>,
    /// Streaming path on the server.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub avg_rating: f64,
    #[serde(default)]
    pub num_reviews: i64,
    #[serde(default)]
    pub downloads: i64,
    pub tracks: Vec<Track>,
}

/// One playable item within a show. The sha1 content hash is the stable
/// deduplication key: the same physical recording always yields the same SKU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Raw filename-like name from the archive ("gd77-05-08d1t02.flac").
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub track_number: Option<i32>,
    /// Length in seconds.
    #[serde(default)]
    pub length_secs: Option<f64>,
    pub format: String,
    pub sha1: String,
}

impl Track {
    /// Catalog SKU for this track. SKU = content hash, so re-importing
    /// identical content is an update, never a duplicate create.
    pub fn sku(&self) -> &str {
        &self.sha1
    }
}

/// Rating/review/download stats for one identifier, from the batch endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowStats {
    pub avg_rating: f64,
    pub num_reviews: i64,
    pub downloads: i64,
}

/// How a raw track name was resolved to a canonical song.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Alias,
    Phonetic,
    Fuzzy,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Alias => "alias",
            Self::Phonetic => "phonetic",
            Self::Fuzzy => "fuzzy",
        }
    }
}

/// Output of the matching engine for one raw track name.
/// Ephemeral — lives only for the import run that produced it.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub canonical_key: String,
    pub canonical_title: String,
    pub match_type: MatchType,
    /// 0-100.
    pub confidence: f64,
}

/// A canonical song definition for one artist.
#[derive(Debug, Clone)]
pub struct Song {
    pub id: i64,
    pub artist: String,
    pub title: String,
    pub canonical_key: String,
    pub aliases: Vec<String>,
}

/// An unmatched raw track name queued for human review.
#[derive(Debug, Clone)]
pub struct UnmatchedTrack {
    pub artist: String,
    pub raw_title: String,
    pub suggestion: Option<String>,
    pub confidence: Option<f64>,
    pub occurrences: i64,
}

/// Import job lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A persisted unit of asynchronous import work. Mutated only by the worker
/// that owns it; survives process restarts.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub id: i64,
    pub status: JobStatus,
    pub artist: String,
    pub collection: String,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub dry_run: bool,
    pub total_shows: u64,
    pub processed_shows: u64,
    pub tracks_created: u64,
    pub tracks_updated: u64,
    pub tracks_skipped: u64,
    pub error_count: u64,
    /// 0-100.
    pub progress: u8,
    pub message: Option<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_track_sku_is_content_hash() {
        let t = Track {
            name: "gd77-05-08d1t02.flac".into(),
            title: Some("Scarlet Begonias".into()),
            track_number: Some(2),
            length_secs: Some(512.3),
            format: "flac".into(),
            sha1: "abc123".into(),
        };
        assert_eq!(t.sku(), "abc123");
    }
}
