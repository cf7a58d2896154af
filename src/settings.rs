//! Validation limits for loaded songs.
//!
//! Each player takes its settings at construction; there are no
//! process-wide defaults. All fields are public so callers can override
//! individual limits.

use std::time::Duration;

/// Limits applied while loading MML source.
#[derive(Debug, Clone)]
pub struct MmlSettings {
    /// Maximum source size in bytes.
    pub max_size: usize,
    /// Maximum total song duration, enforced during the load-time dry-run.
    pub max_duration: Duration,
    /// Minimum beats per minute a tempo command can set.
    pub min_tempo: u32,
    /// Maximum beats per minute a tempo command can set.
    pub max_tempo: u32,
    pub min_octave: i32,
    pub max_octave: i32,
    /// Minimum stored volume, in the internal 1 to 15 range.
    pub min_volume: u32,
    /// Maximum stored volume, in the internal 1 to 15 range.
    pub max_volume: u32,
    /// Maximum number of comma-separated voices, or `None` for no limit.
    pub max_tracks: Option<usize>,
}

impl Default for MmlSettings {
    fn default() -> Self {
        MmlSettings {
            max_size: 1024 * 12,
            max_duration: Duration::from_secs(5 * 60),
            min_tempo: 32,
            max_tempo: 255,
            min_octave: 1,
            max_octave: 8,
            min_volume: 1,
            max_volume: 15,
            max_tracks: None,
        }
    }
}

/// Limits applied while loading ABC source.
#[derive(Debug, Clone)]
pub struct AbcSettings {
    /// Maximum source size in bytes.
    pub max_size: usize,
    /// Maximum duration of any single tune in the source.
    pub max_duration: Duration,
    pub min_tempo: u32,
    pub max_tempo: u32,
    pub min_octave: i32,
    pub max_octave: i32,
    /// Chords are truncated to this many sounding notes.
    pub max_chord_notes: usize,
    /// Shortest note length as a fraction of a measure.
    pub shortest_note: f64,
    /// Longest note length in measures.
    pub longest_note: f64,
}

impl Default for AbcSettings {
    fn default() -> Self {
        AbcSettings {
            max_size: 1024 * 12,
            max_duration: Duration::from_secs(5 * 60),
            min_tempo: 32,
            max_tempo: 255,
            min_octave: 0,
            max_octave: 10,
            max_chord_notes: 6,
            shortest_note: 1.0 / 64.0,
            longest_note: 4.0,
        }
    }
}
