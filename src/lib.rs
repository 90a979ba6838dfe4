pub mod archive;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod crawler;
pub mod db;
pub mod importer;
pub mod jobs;
pub mod lock;
pub mod matcher;

/// Audio file extensions considered playable tracks in archive metadata.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "shn", "wav"];

/// Application name for XDG paths
pub const APP_NAME: &str = "tapersync";
