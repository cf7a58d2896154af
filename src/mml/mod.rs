//! The MML dialect: a measure-oriented macro language.
//!
//! Source is a flat stream of single-letter commands (`t120l8cdefg`...),
//! optionally wrapped in the `MML@`...`;` markers, with `,` separating
//! simultaneous voices. See [`MmlPlayer`] for the playable surface.

pub mod command;
pub mod player;
pub mod track;

pub use command::{MmlCommand, MmlLength};
pub use player::{MmlConfig, MmlPlayer};
pub use track::{MmlMode, MmlTrack, TrackEvent};
