//! Interpreters and a real-time sequencer for text music notation.
//!
//! Two dialects are supported: MML, a measure-oriented macro language
//! with comma-separated voices, and ABC, a line-oriented folk notation
//! format with header-driven key, meter and tempo. Either player
//! tokenizes its source at load time, precomputes the total duration
//! with a silent dry-run, and then emits note events through a
//! [`NoteSink`] as the caller feeds it timestamps:
//!
//! ```rust
//! use std::time::Duration;
//! use notaplay::{EventLog, MmlPlayer};
//!
//! let mut player = MmlPlayer::new(EventLog::default());
//! player.load("MML@t120l4cdec;")?;
//! assert_eq!(player.duration(), Duration::from_secs(2));
//!
//! player.play(Duration::ZERO);
//! player.update(player.duration());
//! assert_eq!(player.sink().events.len(), 4);
//! # Ok::<(), notaplay::PlayerError>(())
//! ```
//!
//! The core never blocks, sleeps or spawns: all advancement happens
//! inside `update`, driven by caller-supplied, non-decreasing
//! timestamps.

pub mod abc;
pub mod error;
pub mod mml;
pub mod note;
pub mod settings;
pub mod sink;

pub use abc::{AbcConfig, AbcPlayer, AccidentalPropagation};
pub use error::PlayerError;
pub use mml::{MmlCommand, MmlConfig, MmlLength, MmlMode, MmlPlayer};
pub use note::{Accidental, Note, Tone};
pub use settings::{AbcSettings, MmlSettings};
pub use sink::{EventLog, NoteEvent, NoteSink};
