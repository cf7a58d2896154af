//! Recognizing ABC files produced by the Lord of the Rings Online
//! toolchain.
//!
//! Those files expect octave-scoped accidental propagation, so a caller
//! that spots one of the known transcriber signatures can pick
//! [`AccidentalPropagation::Octave`](super::AccidentalPropagation::Octave)
//! before loading. Markers are compared with whitespace removed and case
//! folded, and any future Maestro version matches by prefix.

use once_cell::sync::Lazy;

const LOTRO_MARKERS: &[&str] = &[
    "%%lotro-compatible",
    "% using Firefern's ABC converter",
    "Z: Transcribed by Firefern's ABC sequencer",
    "%%abc-creator Maestro v2.3.0",
    "%%abc-creator Maestro v2.2.1",
    "%%abc-creator Maestro v2.2.0",
    "%%abc-creator Maestro v2.1.1",
    "%%abc-creator Maestro v2.1.0",
    "%%abc-creator Maestro v2.0.0",
    "%%abc-creator Maestro v1.4.1",
    "%%abc-creator Maestro v1.4.0",
    "%%abc-creator Maestro v1.0.0",
    "% Produced with Bruzo's Transcoding Environment",
    "Z: Transcribed by LotRO MIDI Player: http://lotro.acasylum.com/midi",
];

const MAESTRO_PREFIX: &str = "%%abc-creator Maestro";

static NORMALIZED_MARKERS: Lazy<Vec<String>> =
    Lazy::new(|| LOTRO_MARKERS.iter().map(|m| normalize(m)).collect());
static NORMALIZED_MAESTRO: Lazy<String> = Lazy::new(|| normalize(MAESTRO_PREFIX));

fn normalize(marker: &str) -> String {
    marker.trim().replace(' ', "").to_lowercase()
}

/// Whether one line is a known LOTRO transcriber signature.
pub fn is_lotro_marker(line: &str) -> bool {
    let normalized = normalize(line);
    normalized.starts_with(NORMALIZED_MAESTRO.as_str())
        || NORMALIZED_MARKERS.contains(&normalized)
}

/// Whether any line of a source carries a LOTRO transcriber signature.
pub fn is_lotro_source(source: &str) -> bool {
    source.lines().any(is_lotro_marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_markers_match() {
        assert!(is_lotro_marker("%%lotro-compatible"));
        assert!(is_lotro_marker("% Produced with Bruzo's Transcoding Environment"));
    }

    #[test]
    fn matching_ignores_case_and_spacing() {
        assert!(is_lotro_marker("  %% LOTRO-Compatible  "));
        assert!(is_lotro_marker("Z:Transcribed by firefern's ABC Sequencer"));
    }

    #[test]
    fn future_maestro_versions_match_by_prefix() {
        assert!(is_lotro_marker("%%abc-creator Maestro v9.9.9"));
    }

    #[test]
    fn ordinary_lines_do_not_match() {
        assert!(!is_lotro_marker("X:1"));
        assert!(!is_lotro_marker("% just a comment"));
    }

    #[test]
    fn sources_are_scanned_line_by_line() {
        let source = "%abc-2.1\n%%abc-creator Maestro v2.3.0\nX:1\nK:C\nCDE\n";
        assert!(is_lotro_source(source));
        assert!(!is_lotro_source("%abc-2.1\nX:1\nK:C\nCDE\n"));
    }
}
