use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use tapersync::archive::ArchiveClient;
use tapersync::cache::MetadataCache;
use tapersync::catalog::SqliteCatalog;
use tapersync::crawler::{self, CrawlOptions, CrawlResult};
use tapersync::importer::{ImportOptions, ImportReport, Importer};
use tapersync::jobs::{JobQueue, Worker};
use tapersync::lock::LockService;
use tapersync::matcher::{normalize, MatchEngine};

#[derive(Parser)]
#[command(name = "tapersync", version, about = "Live-recording archive import pipeline")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Metadata cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download show metadata for an artist's archive collection
    Crawl {
        /// Artist name (must be mapped in config)
        artist: String,

        /// Stop after this many recordings
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Re-download shows that are already cached
        #[arg(long)]
        force: bool,

        /// Only fetch shows published since the last sync
        #[arg(long)]
        incremental: bool,

        /// Explicit lower bound for --incremental (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
    },

    /// Re-attempt downloads that failed in earlier crawls
    RetryFailed {
        /// Artist name (must be mapped in config)
        artist: String,
    },

    /// Import cached shows into the catalog (crawls first if cache is empty)
    Import {
        /// Artist name (must be mapped in config)
        artist: String,

        /// Import at most this many shows
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Skip this many shows first
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Count what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Import a single show by archive identifier
    ImportShow {
        /// Archive identifier (e.g. gd1977-05-08.sbd.hicks.4982)
        identifier: String,

        /// Artist name (must be mapped in config)
        artist: String,

        /// Count what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Queue an import job for the background worker
    Publish {
        /// Artist name (must be mapped in config)
        artist: String,

        /// Import at most this many shows
        #[arg(short = 'n', long)]
        limit: Option<u64>,

        /// Skip this many shows first
        #[arg(long)]
        offset: Option<u64>,

        /// Queue a dry run
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the background worker (polls the job queue until interrupted)
    Worker,

    /// List import jobs, newest first
    Jobs {
        /// Number of jobs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Cancel a queued or running job
    Cancel {
        /// Job id
        id: i64,
    },

    /// Delete old completed/failed/cancelled jobs
    PurgeJobs,

    /// Show track names that failed matching, most frequent first
    Unmatched {
        /// Artist name
        artist: String,

        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Manage canonical song definitions
    Songs {
        #[command(subcommand)]
        action: SongsAction,
    },

    /// Inspect and clean up operation locks
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },

    /// Check archive API reachability
    Ping,

    /// Show pipeline statistics
    Stats,
}

#[derive(Subcommand)]
enum SongsAction {
    /// Load canonical songs from a TOML file
    Load {
        /// Path to the songs file ([[songs]] entries with artist/title/aliases)
        file: PathBuf,
    },

    /// List canonical songs for an artist
    List {
        /// Artist name
        artist: String,
    },
}

#[derive(Subcommand)]
enum LocksAction {
    /// List currently held locks
    List,

    /// Reap locks held by dead or long-gone processes
    Cleanup,

    /// Forcibly release one lock
    Release {
        /// Operation name (e.g. import)
        operation: String,

        /// Resource name (e.g. GratefulDead)
        resource: String,
    },
}

/// On-disk format for `songs load`.
#[derive(Deserialize)]
struct SongsFile {
    #[serde(default)]
    songs: Vec<SongDef>,
}

#[derive(Deserialize)]
struct SongDef {
    artist: String,
    title: String,
    #[serde(default)]
    aliases: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = tapersync::config::AppConfig::load();

    // Resolve paths: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(tapersync::config::default_db_path);
    let cache_dir = cli
        .cache_dir
        .or(config.cache_dir.clone())
        .unwrap_or_else(tapersync::config::default_cache_dir);
    log::info!("Database: {}", db_path.display());
    log::info!("Cache: {}", cache_dir.display());

    let db = tapersync::db::Database::open(&db_path).context("Failed to open database")?;
    let cache = MetadataCache::open(&cache_dir).context("Failed to open metadata cache")?;

    match cli.command {
        Commands::Crawl {
            artist,
            limit,
            force,
            incremental,
            since,
        } => {
            let collection = config.collection_for_artist(&artist)?.to_string();
            let client = ArchiveClient::new(&db, config.archive.clone(), &config.breaker);
            let opts = CrawlOptions {
                limit,
                force,
                incremental,
                since,
            };
            let result = crawler::download(&client, &cache, &collection, &opts, None)
                .context("Crawl failed")?;
            print_crawl_result(&collection, &result);
        }

        Commands::RetryFailed { artist } => {
            let collection = config.collection_for_artist(&artist)?.to_string();
            let client = ArchiveClient::new(&db, config.archive.clone(), &config.breaker);
            let result =
                crawler::retry_failed(&client, &cache, &collection).context("Retry failed")?;
            println!(
                "Retry complete: {} recovered, {} still failing",
                result.downloaded, result.failed
            );
            for id in &result.failed_identifiers {
                println!("  {id}");
            }
        }

        Commands::Import {
            artist,
            limit,
            offset,
            dry_run,
        } => {
            if dry_run {
                println!("DRY RUN — no changes will be written to the catalog");
            }
            let collection = config.collection_for_artist(&artist)?.to_string();
            let locks = LockService::new(&db, config.locks.clone());
            let handle = locks.acquire("import", &collection, 0)?;

            let client = ArchiveClient::new(&db, config.archive.clone(), &config.breaker);
            let store = SqliteCatalog::new(&db);
            let matcher = MatchEngine::new(&db, config.matching.clone());
            let mut importer = Importer::new(&db, &cache, &client, &store, matcher);
            let opts = ImportOptions {
                limit,
                offset,
                dry_run,
            };

            let result = importer.import_collection(&artist, &collection, &opts, None);
            locks.release(handle)?;
            let report = result.context("Import failed")?;
            print_import_report(&report, dry_run);
        }

        Commands::ImportShow {
            identifier,
            artist,
            dry_run,
        } => {
            if dry_run {
                println!("DRY RUN — no changes will be written to the catalog");
            }
            let client = ArchiveClient::new(&db, config.archive.clone(), &config.breaker);
            let store = SqliteCatalog::new(&db);
            let matcher = MatchEngine::new(&db, config.matching.clone());
            let mut importer = Importer::new(&db, &cache, &client, &store, matcher);

            let report = importer
                .import_show(&identifier, &artist, dry_run)
                .context("Import failed")?;
            print_import_report(&report, dry_run);
        }

        Commands::Publish {
            artist,
            limit,
            offset,
            dry_run,
        } => {
            let queue = JobQueue::new(&db, &config);
            let job = queue
                .publish(&artist, limit, offset, dry_run)
                .context("Failed to queue job")?;
            println!(
                "Queued job {} for {} ({}). Run `tapersync worker` to process it.",
                job.id, job.artist, job.collection
            );
        }

        Commands::Worker => {
            let worker = Worker::new(&db, &config, &cache);
            worker.run_forever().context("Worker failed")?;
        }

        Commands::Jobs { limit } => {
            let queue = JobQueue::new(&db, &config);
            let jobs = queue.list(limit)?;
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }

            println!(
                "{:>5} {:<10} {:<20} {:>4} {:>6} {:>6} {:>6} {:>6}  {}",
                "Id", "Status", "Artist", "%", "Shows", "New", "Upd", "Errs", "Message"
            );
            println!("{}", "-".repeat(100));
            for j in &jobs {
                println!(
                    "{:>5} {:<10} {:<20} {:>4} {:>6} {:>6} {:>6} {:>6}  {}",
                    j.id,
                    j.status.as_str(),
                    truncate(&j.artist, 20),
                    j.progress,
                    j.processed_shows,
                    j.tracks_created,
                    j.tracks_updated,
                    j.error_count,
                    j.message.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Cancel { id } => {
            let queue = JobQueue::new(&db, &config);
            if queue.cancel(id)? {
                println!("Job {id} cancelled.");
            } else {
                println!("Job {id} is already finished (or does not exist).");
            }
        }

        Commands::PurgeJobs => {
            let queue = JobQueue::new(&db, &config);
            let purged = queue.purge()?;
            let swept = db.kv_sweep_expired()?;
            println!(
                "Purged {purged} jobs older than {} days ({swept} expired cache entries swept).",
                config.jobs.retention_days
            );
        }

        Commands::Unmatched { artist, limit } => {
            let rows = db.list_unmatched(&artist, limit)?;
            if rows.is_empty() {
                println!("No unmatched tracks for {artist}.");
                return Ok(());
            }

            println!(
                "{:<40} {:>5}  {:>5}  {}",
                "Raw title", "Seen", "Conf", "Best candidate"
            );
            println!("{}", "-".repeat(90));
            for u in &rows {
                println!(
                    "{:<40} {:>5}  {:>5}  {}",
                    truncate(&u.raw_title, 40),
                    u.occurrences,
                    u.confidence
                        .map(|c| format!("{c:.0}"))
                        .unwrap_or_else(|| "-".to_string()),
                    u.suggestion.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("Add aliases via `tapersync songs load` to resolve recurring misses.");
        }

        Commands::Songs { action } => match action {
            SongsAction::Load { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let parsed: SongsFile = toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse {}", file.display()))?;

                let mut loaded = 0usize;
                for s in &parsed.songs {
                    db.upsert_song(&s.artist, &s.title, &normalize(&s.title), &s.aliases)?;
                    loaded += 1;
                }
                println!("Loaded {loaded} songs from {}.", file.display());
            }

            SongsAction::List { artist } => {
                let songs = db.get_songs_for_artist(&artist)?;
                if songs.is_empty() {
                    println!("No songs for {artist}.");
                    return Ok(());
                }
                println!("{} songs for {artist}:", songs.len());
                for s in &songs {
                    if s.aliases.is_empty() {
                        println!("  {}", s.title);
                    } else {
                        println!("  {} (aka {})", s.title, s.aliases.join(", "));
                    }
                }
            }
        },

        Commands::Locks { action } => {
            let locks = LockService::new(&db, config.locks.clone());
            match action {
                LocksAction::List => {
                    let held = locks.list()?;
                    if held.is_empty() {
                        println!("No locks held.");
                    } else {
                        for (key, holder) in &held {
                            println!("{key}  {holder}");
                        }
                    }
                }
                LocksAction::Cleanup => {
                    let reaped = locks.cleanup_stale(config.locks.stale_after_hours)?;
                    println!("Reaped {reaped} stale locks.");
                }
                LocksAction::Release {
                    operation,
                    resource,
                } => {
                    if locks.force_release(&operation, &resource)? {
                        println!("Released lock {operation}:{resource}.");
                    } else {
                        println!("Lock {operation}:{resource} was not held.");
                    }
                }
            }
        }

        Commands::Ping => {
            let client = ArchiveClient::new(&db, config.archive.clone(), &config.breaker);
            if client.test_connectivity() {
                println!("Archive API is reachable.");
            } else {
                anyhow::bail!("Archive API is unreachable (see warnings above)");
            }
        }

        Commands::Stats => {
            let store = SqliteCatalog::new(&db);
            let cached = cache.cached_identifiers()?.len();

            println!("Pipeline Statistics");
            println!("===================");
            println!("Cached shows:     {cached}");
            println!("Catalog items:    {}", store.item_count()?);
            println!();

            if config.artists.is_empty() {
                println!("No artists configured. Add [[artists]] entries to config.toml.");
            } else {
                println!("{:<25} {:>6} {:>10}", "Artist", "Songs", "Unmatched");
                println!("{}", "-".repeat(45));
                for mapping in &config.artists {
                    let songs = db.count_songs(&mapping.name)?;
                    let unmatched = db.list_unmatched(&mapping.name, usize::MAX)?.len();
                    println!("{:<25} {:>6} {:>10}", truncate(&mapping.name, 25), songs, unmatched);
                }
            }
        }
    }

    Ok(())
}

fn print_crawl_result(collection: &str, r: &CrawlResult) {
    println!(
        "Crawl of {collection} complete: {} recordings, {} unique shows",
        r.total_recordings, r.unique_shows
    );
    println!(
        "  {} downloaded, {} already cached, {} failed",
        r.downloaded, r.cached, r.failed
    );
    if !r.failed_identifiers.is_empty() {
        println!("Failed identifiers (re-run with `retry-failed`):");
        for id in &r.failed_identifiers {
            println!("  {id}");
        }
    }
    if r.stopped_early {
        println!("(stopped early — re-run to continue)");
    }
}

fn print_import_report(r: &ImportReport, dry_run: bool) {
    println!(
        "Import complete: {} of {} shows processed",
        r.shows_processed, r.shows_total
    );
    println!(
        "  Tracks: {} created, {} updated, {} unchanged",
        r.tracks_created, r.tracks_updated, r.tracks_skipped
    );
    println!(
        "  Matching: {} matched, {} queued for review",
        r.tracks_matched, r.tracks_unmatched
    );
    if !r.errors.is_empty() {
        println!("  {} errors:", r.errors.len());
        for e in &r.errors {
            println!("    {e}");
        }
    }
    if dry_run {
        println!("(dry run — re-run without --dry-run to write changes)");
    }
}

/// Shorten a value for table display. Cuts on a char boundary so
/// non-ASCII artist names never split mid-character.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(3);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
