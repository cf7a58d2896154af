//! Tokenizing MML source into typed commands.
//!
//! MML is a flat macro language: single-letter commands with optional
//! numeric arguments, no nesting. A compound pattern recognizes every
//! command form in one pass over the newline-stripped source; anything the
//! pattern does not recognize is preserved as [`MmlCommand::Unknown`] so a
//! caller can diagnose it, but unknown text never makes sound.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::note::{Accidental, Tone};

/// An MML note length: a denominator of a measure (1, 2, 4, 8, 16, 32 or
/// 64) plus a dot which makes it half again as long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MmlLength {
    pub base: u32,
    pub dotted: bool,
}

impl MmlLength {
    pub fn new(base: u32, dotted: bool) -> Self {
        MmlLength { base, dotted }
    }

    /// The fraction of a measure this length spans.
    pub fn measure_fraction(&self) -> f64 {
        let mut fraction = 1.0 / self.base as f64;
        if self.dotted {
            fraction *= 1.5;
        }
        fraction
    }

    /// Converts the length to wall-clock time given the current seconds
    /// per measure.
    pub fn to_duration(&self, seconds_per_measure: f64) -> Duration {
        Duration::from_secs_f64(seconds_per_measure * self.measure_fraction())
    }
}

/// One parsed MML command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MmlCommand {
    /// `t` plus up to three digits: beats per minute.
    Tempo(u32),
    /// `l` plus a length: the default length for notes that carry none.
    Length(MmlLength),
    /// `v` plus digits: channel volume.
    Volume(u32),
    /// `o` plus one digit: absolute octave.
    Octave(i32),
    /// `>`: octave up one.
    OctaveUp,
    /// `<`: octave down one.
    OctaveDown,
    /// A note letter with optional accidental, length and dot.
    Note {
        tone: Tone,
        accidental: Option<Accidental>,
        length: Option<u32>,
        dotted: bool,
    },
    /// `r` with optional length and dot.
    Rest { length: Option<u32>, dotted: bool },
    /// `n` plus digits: an absolute note number, where 12 is C1.
    NoteNumber { number: i32, dotted: bool },
    /// `&`: ties the surrounding notes together.
    Tie,
    /// Source text no pattern recognized. Never emitted as sound.
    Unknown(String),
}

const MML_PATTERNS: &[&str] = &[
    r"[tT]\d{1,3}",
    r"[lL](16|2|4|8|1|32|64)\.?",
    r"[vV]\d+",
    r"[oO]\d",
    r"<",
    r">",
    r"[a-gA-G](\+|#|-)?(16|2|4|8|1|32|64)?\.?",
    r"[rR](16|2|4|8|1|32|64)?\.?",
    r"[nN]\d+\.?",
    r"&",
];

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&MML_PATTERNS.join("|")).expect("command pattern compiles"));
static NOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-gA-G])(\+|#|-)?(16|2|4|8|1|32|64)?(\.)?$").expect("note pattern compiles")
});
static REST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[rR](16|2|4|8|1|32|64)?(\.)?$").expect("rest pattern compiles"));
static LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[lL](16|2|4|8|1|32|64)(\.)?$").expect("length pattern compiles"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[nN](\d+)(\.)?$").expect("note number pattern compiles"));

/// Tokenizes a single track's worth of MML. Newlines are stripped first;
/// tokenizing is total and never fails.
pub fn tokenize(code: &str) -> Vec<MmlCommand> {
    let code: String = code.chars().filter(|c| *c != '\n' && *c != '\r').collect();

    let mut commands = Vec::new();
    let mut last_end = 0;
    for m in TOKEN_RE.find_iter(&code) {
        push_gap(&mut commands, &code[last_end..m.start()]);
        commands.push(parse_command(m.as_str()));
        last_end = m.end();
    }
    push_gap(&mut commands, &code[last_end..]);
    commands
}

fn push_gap(commands: &mut Vec<MmlCommand>, gap: &str) {
    let gap = gap.trim();
    if !gap.is_empty() {
        commands.push(MmlCommand::Unknown(gap.to_string()));
    }
}

/// Parses one matched token into a command. A numeric field that does not
/// fit its integer type degrades the token to `Unknown` instead of failing.
pub fn parse_command(token: &str) -> MmlCommand {
    let first = match token.chars().next() {
        Some(c) => c.to_ascii_lowercase(),
        None => return MmlCommand::Unknown(String::new()),
    };

    let unknown = || MmlCommand::Unknown(token.to_string());

    match first {
        't' => match token[1..].parse::<u32>() {
            Ok(bpm) => MmlCommand::Tempo(bpm),
            Err(_) => unknown(),
        },
        'l' => match LENGTH_RE.captures(token) {
            Some(caps) => {
                let base = caps[1].parse::<u32>().unwrap_or(4);
                MmlCommand::Length(MmlLength::new(base, caps.get(2).is_some()))
            }
            None => unknown(),
        },
        'v' => match token[1..].parse::<u32>() {
            Ok(volume) => MmlCommand::Volume(volume),
            Err(_) => unknown(),
        },
        'o' => match token[1..].parse::<i32>() {
            Ok(octave) => MmlCommand::Octave(octave),
            Err(_) => unknown(),
        },
        '<' => MmlCommand::OctaveDown,
        '>' => MmlCommand::OctaveUp,
        'a'..='g' => match NOTE_RE.captures(token) {
            Some(caps) => {
                let tone = caps[1]
                    .chars()
                    .next()
                    .and_then(Tone::from_char)
                    .unwrap_or(Tone::C);
                let accidental = caps.get(2).map(|m| match m.as_str() {
                    "-" => Accidental::Flat,
                    _ => Accidental::Sharp,
                });
                let length = caps.get(3).and_then(|m| m.as_str().parse().ok());
                MmlCommand::Note {
                    tone,
                    accidental,
                    length,
                    dotted: caps.get(4).is_some(),
                }
            }
            None => unknown(),
        },
        'r' => match REST_RE.captures(token) {
            Some(caps) => MmlCommand::Rest {
                length: caps.get(1).and_then(|m| m.as_str().parse().ok()),
                dotted: caps.get(2).is_some(),
            },
            None => unknown(),
        },
        'n' => match NUMBER_RE.captures(token) {
            Some(caps) => match caps[1].parse::<i32>() {
                Ok(number) => MmlCommand::NoteNumber {
                    number,
                    dotted: caps.get(2).is_some(),
                },
                Err(_) => unknown(),
            },
            None => unknown(),
        },
        '&' => MmlCommand::Tie,
        _ => unknown(),
    }
}
