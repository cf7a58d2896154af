//! # Error Types
//!
//! This module defines all error types raised while loading notation.
//!
//! Every variant is raised synchronously from `load` (which includes the
//! duration precomputation pass) and is fatal to that load attempt. Errors
//! are never raised once playback has started; lenient parsing substitutes
//! defaults instead, and malformed key fields fall back to the key with no
//! accidentals.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// The source text exceeds the configured maximum size in bytes.
    #[error("source length {size} exceeds the maximum of {max} bytes")]
    SourceTooLarge { size: usize, max: usize },

    /// The song would play longer than the configured maximum duration.
    ///
    /// Detected during the muted dry-run that precomputes total duration,
    /// before any real playback happens.
    #[error("song exceeds the maximum duration of {max:?}")]
    DurationExceeded { max: Duration },

    /// The source lacks the markers the chosen dialect requires, for
    /// example the `MML@` prefix or the `;` terminator.
    #[error("malformed source: {0}")]
    MalformedSource(String),

    /// A rule that only applies under strict parsing was violated, such as
    /// an unsupported ABC version, wrong header field ordering, or a tempo
    /// field that is not in the `x/x=nnn` form.
    #[error("strict mode violation: {0}")]
    StrictModeViolation(String),
}
