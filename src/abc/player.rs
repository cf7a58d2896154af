//! The ABC tune player.
//!
//! Loads a whole ABC file (which may be a tune book holding several
//! tunes), tokenizes each tune body, and steps one selected tune through
//! time as the caller supplies timestamps. Header fields drive the key,
//! meter, default note length and tempo; explicit accidentals override
//! the key until the next measure boundary according to the configured
//! propagation policy.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::PlayerError;
use crate::note::{Note, Tone};
use crate::settings::AbcSettings;
use crate::sink::NoteSink;

use super::header::{FieldInfo, Tune};
use super::keys;
use super::keys::AccidentalMap;
use super::tokenizer::tokenize;

/// How long and broadly an explicit accidental stays in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccidentalPropagation {
    /// Until the end of the measure, per octave. What Lord of the Rings
    /// Online expects.
    #[default]
    Octave,
    /// Until the end of the measure, across all octaves. The ABC v2.1
    /// default.
    Pitch,
    /// Only the decorated note itself.
    Not,
}

/// Construction-time configuration for an [`AbcPlayer`].
#[derive(Debug, Clone)]
pub struct AbcConfig {
    /// When strict, the `%abc` version line, field ordering and tempo
    /// syntax are enforced. Lenient parsing substitutes defaults instead.
    pub strict: bool,
    /// Octave an upper-case note letter lands in. 4 puts `C` on middle C.
    pub default_octave: i32,
    pub accidental_propagation: AccidentalPropagation,
}

impl Default for AbcConfig {
    fn default() -> Self {
        AbcConfig {
            strict: true,
            default_octave: 4,
            accidental_propagation: AccidentalPropagation::Octave,
        }
    }
}

impl AbcConfig {
    pub fn lenient() -> Self {
        AbcConfig {
            strict: false,
            ..AbcConfig::default()
        }
    }
}

static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("int pattern compiles"));
static FRACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+/\d+").expect("fraction pattern compiles"));
static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*""#).expect("quoted pattern compiles"));
static CARET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\^+").expect("caret pattern compiles"));
static UNDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("underscore pattern compiles"));

/// An ABC player feeding a [`NoteSink`]. Loads multiple tunes but plays
/// one at a time.
pub struct AbcPlayer<S: NoteSink> {
    sink: S,
    config: AbcConfig,
    settings: AbcSettings,
    tunes: Vec<Tune>,
    selected: usize,
    in_tune: bool,
    token_index: usize,
    /// Song time at which the next token falls due.
    next_note: Duration,
    default_accidentals: AccidentalMap,
    accidentals: HashMap<(char, Option<i32>), i32>,
    note_length: f64,
    meter: f64,
    /// Seconds per measure, from the tempo field.
    spm: f64,
    /// Current dynamics volume, 0 to 1.
    volume: f64,
    playing: bool,
    muted: bool,
    paused: bool,
    looping: bool,
    normalize: bool,
    normalize_scalar: f64,
    elapsed: Duration,
    cur_time: Duration,
    started: bool,
}

impl<S: NoteSink> AbcPlayer<S> {
    /// A strict player with default limits and octave-scoped accidentals.
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, AbcConfig::default(), AbcSettings::default())
    }

    pub fn with_config(sink: S, config: AbcConfig, settings: AbcSettings) -> Self {
        AbcPlayer {
            sink,
            config,
            settings,
            tunes: Vec::new(),
            selected: 1,
            in_tune: false,
            token_index: 0,
            next_note: Duration::ZERO,
            default_accidentals: AccidentalMap::new(),
            accidentals: HashMap::new(),
            note_length: 0.0,
            meter: 1.0,
            spm: 2.0,
            volume: 90.0 / 127.0,
            playing: false,
            muted: false,
            paused: false,
            looping: false,
            normalize: false,
            normalize_scalar: 1.0,
            elapsed: Duration::ZERO,
            cur_time: Duration::ZERO,
            started: false,
        }
    }

    /// Loads an ABC source, tokenizing every tune and precomputing each
    /// tune's duration with a silent pass. On error the player is left
    /// without tunes until the next successful load.
    pub fn load(&mut self, source: &str) -> Result<(), PlayerError> {
        let result = self.load_inner(source);
        if result.is_err() {
            self.tunes.clear();
        }
        result
    }

    fn load_inner(&mut self, source: &str) -> Result<(), PlayerError> {
        if source.len() > self.settings.max_size {
            return Err(PlayerError::SourceTooLarge {
                size: source.len(),
                max: self.settings.max_size,
            });
        }

        self.tunes = vec![Tune::default()];
        self.in_tune = false;
        self.playing = false;
        self.started = false;

        let mut lines = source.lines();
        let first = match lines.next() {
            Some(line) => line,
            None => return Ok(()),
        };
        self.check_version_line(first)?;
        self.interpret(first)?;
        for line in lines {
            self.interpret(line)?;
        }
        // A missing trailing blank line must still end the last tune.
        self.interpret("")?;

        for index in 1..self.tunes.len() {
            if !self.tunes[index].tokens.is_empty() {
                self.selected = index;
                self.precompute_duration()?;
            }
        }

        self.selected = 1;
        self.set_default_values();
        log::debug!(
            "loaded {} ABC tune(s)",
            self.tunes.len().saturating_sub(1)
        );
        Ok(())
    }

    fn check_version_line(&self, first: &str) -> Result<(), PlayerError> {
        if !first.starts_with("%abc") {
            if self.config.strict {
                return Err(PlayerError::StrictModeViolation(
                    "source does not start with '%abc'".into(),
                ));
            }
            return Ok(());
        }
        if first.len() < 6 {
            if self.config.strict {
                return Err(PlayerError::StrictModeViolation(
                    "version information is missing".into(),
                ));
            }
            return Ok(());
        }
        match first.get(5..).and_then(parse_version) {
            Some((major, minor)) => {
                if (major < 2 || (major == 2 && minor < 1)) && self.config.strict {
                    return Err(PlayerError::StrictModeViolation(format!(
                        "strict mode requires version 2.1 or newer, found {}.{}",
                        major, minor
                    )));
                }
            }
            None => {
                if self.config.strict {
                    return Err(PlayerError::StrictModeViolation(
                        "version information is malformed".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn interpret(&mut self, raw_line: &str) -> Result<(), PlayerError> {
        let line = raw_line.split('%').next().unwrap_or("").trim().to_string();

        if !self.in_tune {
            return self.parse_header_line(&line);
        }

        // A line that is only a comment must not end the tune.
        if line.is_empty() && raw_line != line {
            return Ok(());
        }
        // Lenient sources may leave blank lines before the body starts.
        if !self.config.strict && line.is_empty() {
            if let Some(tune) = self.tunes.last() {
                if tune.raw_code.is_empty() {
                    return Ok(());
                }
            }
        }
        self.parse_tune_line(&line);
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), PlayerError> {
        let info = match FieldInfo::parse(line) {
            Some(info) => info,
            None => return Ok(()),
        };

        if info.id == 'T' && self.config.strict {
            let ok = self
                .tunes
                .last()
                .map(|t| t.header.field_count() == 1 && t.header.contains('X'))
                .unwrap_or(false);
            if !ok {
                return Err(PlayerError::StrictModeViolation(
                    "'T:' is only allowed directly after 'X:'".into(),
                ));
            }
        }

        if info.id == 'X' {
            self.tunes.push(Tune::default());
        } else if info.id == 'K' {
            self.in_tune = true;
        }
        if let Some(tune) = self.tunes.last_mut() {
            tune.header.add(info);
        }
        Ok(())
    }

    fn parse_tune_line(&mut self, line: &str) {
        if line.is_empty() {
            self.in_tune = false;
        }
        let tune = match self.tunes.last_mut() {
            Some(tune) => tune,
            None => return,
        };

        if let Some(first) = line.chars().next() {
            match first {
                // Mid-tune fields become inline pseudo-tokens.
                'K' | 'L' | 'Q' => {
                    tune.raw_code.push('[');
                    tune.raw_code.push_str(line);
                    tune.raw_code.push(']');
                }
                // Other field lines carry nothing playable.
                'I' | 'M' | 'm' | 'N' | 'O' | 'P' | 'R' | 'r' | 's' | 'T' | 'U' | 'V' | 'W'
                | 'w' => {}
                _ => tune.raw_code.push_str(line),
            }
        } else {
            // Blank line: the tune body ends here.
            if tune.raw_code.trim().is_empty() {
                tune.tokens = Vec::new();
                return;
            }
            let filtered: String = tune
                .raw_code
                .chars()
                .filter(|c| !matches!(c, '\\' | '\n' | '\r' | '\t'))
                .collect();
            tune.tokens = tokenize(&filtered);
        }
    }

    fn set_default_values(&mut self) {
        self.token_index = 0;
        // Unset meter sits below the inference threshold, so a tune with
        // no meter field gets sixteenth-note defaults.
        self.meter = 0.0;
        self.volume = 90.0 / 127.0;
        self.note_length = 0.0;
        // 120 quarter-note beats per minute unless a tempo field says
        // otherwise.
        self.spm = 2.0;
        self.accidentals.clear();
        self.default_accidentals.clear();
    }

    /// Applies the last-seen header fields of one tune: key, meter,
    /// default note length (inferred from the meter when absent), tempo.
    fn apply_header_values(&mut self, index: usize, infer_length: bool) -> Result<(), PlayerError> {
        let header = match self.tunes.get(index) {
            Some(tune) => tune.header.clone(),
            None => return Ok(()),
        };

        if let Some(key) = header.last('K') {
            self.apply_key(key);
        }
        if let Some(meter) = header.last('M') {
            self.meter = self.parse_note_length(meter);
        }
        if let Some(length) = header.last('L') {
            self.note_length = self.parse_note_length(length);
        }
        if infer_length && self.note_length == 0.0 {
            self.note_length = if self.meter >= 0.75 {
                1.0 / 8.0
            } else {
                1.0 / 16.0
            };
        }
        if let Some(tempo) = header.last('Q') {
            self.apply_tempo(tempo)?;
        }
        Ok(())
    }

    fn apply_key(&mut self, text: &str) {
        self.default_accidentals = keys::get_accidentals(text);
    }

    /// Parses a tempo field. Three syntaxes are accepted: a bare beats
    /// per minute count (quarter-note beats), `C=nnn`, and one or more
    /// note fractions with the bpm on either side of `=`. Strict mode
    /// only accepts the fraction form.
    fn apply_tempo(&mut self, text: &str) -> Result<(), PlayerError> {
        let text = text.trim();

        if (!text.contains('=') || text.starts_with('C')) && self.config.strict {
            return Err(PlayerError::StrictModeViolation(
                "tempo must be in the form 'x/x=nnn' in strict mode".into(),
            ));
        }

        let bpm: f64;
        let mut length = 0.0;

        if !text.contains('=') {
            match INT_RE.find(text) {
                Some(m) => bpm = m.as_str().parse().unwrap_or(0.0),
                None => return Ok(()),
            }
            length = 0.25;
        } else if text.starts_with('C') {
            let eq = text.find('=').unwrap_or(0);
            match INT_RE.find(&text[eq..]) {
                Some(m) => bpm = m.as_str().parse().unwrap_or(0.0),
                None => return Ok(()),
            }
            length = 0.25;
        } else {
            let stripped = QUOTED_RE.replace_all(text, "").to_string();
            let eq = match stripped.find('=') {
                Some(eq) => eq,
                None => return Ok(()),
            };

            let mut bpm_on_left = false;
            for m in FRACTION_RE.find_iter(&stripped) {
                length += self.parse_note_length(m.as_str());
                if m.start() > eq {
                    bpm_on_left = true;
                }
            }

            let bpm_text = if bpm_on_left {
                &stripped[..eq]
            } else {
                &stripped[eq..]
            };
            match INT_RE.find(bpm_text) {
                Some(m) => bpm = m.as_str().parse().unwrap_or(0.0),
                None => return Ok(()),
            }
        }

        let divisor = (bpm * length).clamp(
            self.settings.min_tempo as f64 * 0.25,
            self.settings.max_tempo as f64 * 0.25,
        );
        self.spm = 60.0 / divisor;
        Ok(())
    }

    /// Parses a note fraction like `3/4`. Returns -1 when no fraction is
    /// present, mirroring how an unparsable meter disables length
    /// inference.
    fn parse_note_length(&self, text: &str) -> f64 {
        let m = match FRACTION_RE.find(text) {
            Some(m) => m,
            None => return -1.0,
        };
        let mut parts = m.as_str().split('/');
        let numerator: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
        let denominator: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
        let length = if denominator != 0.0 {
            numerator / denominator
        } else {
            1.0
        };
        length.clamp(self.settings.shortest_note, self.settings.longest_note)
    }

    /// Starts the first tune at the given wall-clock time. When paused
    /// this resumes instead.
    pub fn play(&mut self, time: Duration) {
        self.play_tune(time, 1);
    }

    /// Starts the given tune (1-based, as numbered by `X:` fields).
    pub fn play_tune(&mut self, time: Duration, tune: usize) {
        if self.paused {
            self.unpause();
            return;
        }
        if self.tunes.len() < 2 {
            return;
        }
        self.selected = tune.clamp(1, self.tunes.len() - 1);

        self.playing = true;
        self.started = true;
        self.cur_time = time;
        self.elapsed = Duration::ZERO;
        self.set_default_values();
        self.next_note = Duration::ZERO;
        let _ = self.apply_header_values(0, false);
        let _ = self.apply_header_values(self.selected, true);
        self.start_measure();
    }

    /// Advances playback to the given wall-clock time, emitting every note
    /// that has fallen due. A timestamp that moves backwards is a no-op.
    pub fn update(&mut self, time: Duration) {
        if !self.started {
            return;
        }
        if self.paused {
            self.cur_time = time;
            return;
        }
        self.elapsed += time.saturating_sub(self.cur_time);
        self.cur_time = time;
        self.advance(self.elapsed);

        if !self.playing && self.looping && self.token_count() > 0 {
            self.stop();
            self.play_tune(time, self.selected);
            self.advance(Duration::ZERO);
        }
    }

    fn advance(&mut self, song_time: Duration) {
        if !self.playing {
            return;
        }
        while song_time >= self.next_note && self.token_index < self.token_count() {
            self.read_next_note();
        }
        if song_time >= self.next_note && self.token_index >= self.token_count() {
            self.stop();
        }
    }

    /// Interprets tokens until one note, chord or rest has advanced time.
    fn read_next_note(&mut self) {
        let mut note_found = false;
        let mut chord = false;
        let mut chord_notes: Vec<Note> = Vec::new();
        let mut held: Option<Note> = None;

        while !note_found && self.token_index < self.token_count() {
            let token = match self.token_at(self.token_index) {
                Some(token) => token,
                None => break,
            };
            let mut advance_token = true;

            let mut c = token.chars().next().unwrap_or(' ');
            if token == "[" {
                // A lone open bracket opens a chord.
                c = '!';
            }

            match c {
                ']' => {
                    if chord {
                        note_found = true;
                        chord = false;
                        let advance = self.chord_advance(&mut chord_notes);
                        self.emit_chord(&chord_notes);
                        self.next_note += advance;
                    }
                }
                '!' => {
                    chord = true;
                    chord_notes.clear();
                }
                '|' | ':' | '[' => {
                    if is_inline_field(&token) {
                        let _ = self.inline_field(&token);
                    } else {
                        self.start_measure();
                    }
                }
                '+' => self.apply_dynamics(&token),
                'z' | 'Z' | 'x' => {
                    let rest = self.resolve_rest(&token);
                    if !chord {
                        self.next_note += rest.length;
                        note_found = true;
                    } else {
                        chord_notes.push(rest);
                    }
                }
                'a'..='g' | 'A'..='G' | '^' | '=' | '_' => {
                    let note = self.resolve_note(&token);
                    match held.take() {
                        None => {
                            if chord {
                                chord_notes.push(note);
                            } else if self.next_token_starts_tie() {
                                held = Some(note);
                            } else {
                                note_found = true;
                                self.validate_and_play(note, 0);
                                self.next_note += note.length;
                            }
                        }
                        Some(mut held_note) => {
                            if held_note.tone == note.tone
                                && held_note.sharp == note.sharp
                                && held_note.octave == note.octave
                            {
                                held_note.length += note.length;
                                if self.next_token_starts_tie() {
                                    held = Some(held_note);
                                } else {
                                    note_found = true;
                                    self.validate_and_play(held_note, 0);
                                    self.next_note += held_note.length;
                                }
                            } else {
                                // Pitch changed: the held note ends and the
                                // current token is read again as a fresh
                                // note.
                                self.validate_and_play(held_note, 0);
                                self.next_note += held_note.length;
                                note_found = true;
                                advance_token = false;
                            }
                        }
                    }
                }
                _ => {}
            }

            if advance_token {
                self.token_index += 1;
            }
        }
    }

    /// Silent twin of the playback loop: sums every advance the tokens
    /// make and stores it as the tune's duration.
    fn precompute_duration(&mut self) -> Result<(), PlayerError> {
        self.set_default_values();
        self.apply_header_values(0, false)?;
        self.apply_header_values(self.selected, true)?;

        let mut duration = Duration::ZERO;
        let mut chord = false;
        let mut chord_notes: Vec<Note> = Vec::new();

        while self.token_index < self.token_count() {
            let token = match self.token_at(self.token_index) {
                Some(token) => token,
                None => break,
            };

            let mut c = token.chars().next().unwrap_or(' ');
            if token == "[" {
                c = '!';
            }

            match c {
                ']' => {
                    if chord {
                        chord = false;
                        duration += self.chord_advance(&mut chord_notes);
                    }
                }
                '!' => {
                    chord = true;
                    chord_notes.clear();
                }
                '|' | ':' | '[' => {
                    if is_inline_field(&token) {
                        self.inline_field(&token)?;
                    }
                }
                'z' | 'Z' | 'x' => {
                    let rest = self.resolve_rest(&token);
                    if !chord {
                        duration += rest.length;
                    } else {
                        chord_notes.push(rest);
                    }
                }
                'a'..='g' | 'A'..='G' | '^' | '=' | '_' => {
                    let note = self.resolve_note(&token);
                    if !chord {
                        duration += note.length;
                    } else {
                        chord_notes.push(note);
                    }
                }
                _ => {}
            }

            self.token_index += 1;

            if duration > self.settings.max_duration {
                return Err(PlayerError::DurationExceeded {
                    max: self.settings.max_duration,
                });
            }
        }

        self.tunes[self.selected].duration = duration;
        Ok(())
    }

    fn inline_field(&mut self, token: &str) -> Result<(), PlayerError> {
        let inner = token[1..token.len() - 1].trim();
        let info = match FieldInfo::parse(inner) {
            Some(info) => info,
            None => return Ok(()),
        };
        match info.id {
            'Q' => self.apply_tempo(&info.text)?,
            'L' => self.note_length = self.parse_note_length(&info.text),
            'K' => self.apply_key(&info.text),
            _ => {}
        }
        Ok(())
    }

    fn start_measure(&mut self) {
        self.accidentals.clear();
    }

    fn apply_dynamics(&mut self, token: &str) {
        if token.len() <= 1 {
            return;
        }
        self.volume = match &token[1..] {
            "ppp" | "pppp" => 30.0 / 127.0,
            "pp" => 45.0 / 127.0,
            "p" => 60.0 / 127.0,
            "mp" => 75.0 / 127.0,
            "mf" => 90.0 / 127.0,
            "f" => 105.0 / 127.0,
            "ff" => 120.0 / 127.0,
            "fff" | "ffff" => 127.0 / 127.0,
            _ => self.volume,
        };
    }

    fn next_token_starts_tie(&self) -> bool {
        self.token_at(self.token_index + 1)
            .map(|t| t.starts_with('-'))
            .unwrap_or(false)
    }

    /// Resolves one note token: explicit accidental, measure override or
    /// key default, octave marks, then the length suffix.
    fn resolve_note(&mut self, token: &str) -> Note {
        let s = token.trim();

        let mut explicit: Option<i32> = None;
        if let Some(m) = CARET_RE.find(s) {
            explicit = Some(m.as_str().len() as i32);
        }
        if let Some(m) = UNDER_RE.find(s) {
            explicit = Some(-(m.as_str().len() as i32));
        }
        if s.contains('=') {
            explicit = Some(0);
        }

        let mut octave = self.config.default_octave;
        for c in s.chars() {
            if c == ',' {
                octave -= 1;
            } else if c == '\'' {
                octave += 1;
            }
        }

        let tone_char = s
            .chars()
            .find(|c| matches!(c.to_ascii_lowercase(), 'a'..='g'))
            .unwrap_or('c');
        if tone_char.is_ascii_lowercase() {
            octave += 1;
        }
        let letter = tone_char.to_ascii_uppercase();

        let scope = match self.config.accidental_propagation {
            AccidentalPropagation::Octave => Some(octave),
            _ => None,
        };
        let steps = match explicit {
            Some(offset) => {
                if self.config.accidental_propagation != AccidentalPropagation::Not {
                    self.accidentals.insert((letter, scope), offset);
                }
                offset
            }
            None => self
                .accidentals
                .get(&(letter, scope))
                .copied()
                .unwrap_or_else(|| {
                    self.default_accidentals
                        .get(&letter)
                        .copied()
                        .unwrap_or(0)
                }),
        };

        let mut note = Note {
            tone: Tone::from_char(letter).unwrap_or(Tone::C),
            sharp: false,
            octave,
            length: Duration::ZERO,
            volume: self.volume as f32,
        };
        note = note.step(steps);
        note.octave = note
            .octave
            .clamp(self.settings.min_octave, self.settings.max_octave);
        note.length = secs(self.spm * self.modified_note_length(s));
        note
    }

    /// Applies a token's length suffix (`3`, `/2`, `3/2`, `//`...) to the
    /// default note length.
    fn modified_note_length(&self, s: &str) -> f64 {
        let mut dividing = false;
        let mut digits = String::new();
        let mut length = 1.0;

        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
            } else if c == '/' {
                if !dividing && !digits.is_empty() {
                    length = digits.parse().unwrap_or(1.0);
                } else if dividing && !digits.is_empty() {
                    length /= digits.parse::<f64>().unwrap_or(1.0);
                } else if dividing {
                    length /= 2.0;
                }
                digits.clear();
                dividing = true;
            }
        }

        if length == 0.0 {
            length = 1.0;
        }

        if !digits.is_empty() {
            let n: f64 = digits.parse().unwrap_or(0.0);
            if n > 0.0 {
                if dividing {
                    length /= n;
                } else {
                    length *= n;
                }
            } else {
                length = 1.0;
            }
        }

        self.note_length * length
    }

    fn resolve_rest(&self, token: &str) -> Note {
        let s = token.trim();
        let mut note = Note {
            tone: Tone::Rest,
            sharp: false,
            octave: 0,
            length: Duration::ZERO,
            volume: 0.0,
        };

        if !s.starts_with('Z') {
            note.length = secs(self.spm * self.modified_note_length(s));
        } else {
            // A capital Z rests for whole measures.
            let mut measures = INT_RE
                .find(s)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(1.0);
            if measures <= 0.0 {
                measures = 1.0;
            }
            note.length = secs(self.spm * measures);
        }
        note
    }

    /// The time a chord advances playback by: the shortest member,
    /// counting rests, except that a chord of only rests advances
    /// nothing. Rests are then dropped and the chord trimmed to the
    /// configured maximum width.
    fn chord_advance(&self, notes: &mut Vec<Note>) -> Duration {
        if notes.is_empty() {
            return Duration::ZERO;
        }
        let min_length = notes
            .iter()
            .map(|n| n.length)
            .min()
            .unwrap_or(Duration::ZERO);
        let advance = if notes.iter().any(|n| !n.is_rest()) {
            min_length
        } else {
            Duration::ZERO
        };
        notes.retain(|n| !n.is_rest());
        notes.truncate(self.settings.max_chord_notes);
        advance
    }

    fn validated(&self, mut note: Note) -> Note {
        note.octave = note
            .octave
            .clamp(self.settings.min_octave, self.settings.max_octave);
        if self.normalize {
            note.volume = (note.volume as f64 * self.normalize_scalar) as f32;
        }
        note.volume = note.volume.clamp(0.0, 1.0);
        note
    }

    fn validate_and_play(&mut self, note: Note, channel: usize) {
        let note = self.validated(note);
        if !self.muted {
            log::trace!("note {} on channel {} at {:?}", note, channel, self.next_note);
            self.sink.play_note(note, channel, self.next_note);
        }
    }

    fn emit_chord(&mut self, notes: &[Note]) {
        if notes.is_empty() {
            return;
        }
        let validated: Vec<Note> = notes.iter().map(|n| self.validated(*n)).collect();
        if !self.muted {
            self.sink.play_chord(&validated, self.next_note);
        }
    }

    /// Stops playback and rewinds. Sounding notes are silenced.
    pub fn stop(&mut self) {
        self.playing = false;
        self.started = false;
        self.paused = false;
        self.elapsed = Duration::ZERO;
        self.silence();
    }

    /// Seeks so the selected tune continues from `position`, emitting
    /// nothing while skipping.
    pub fn seek(&mut self, current_time: Duration, position: Duration) {
        let stored_mute = self.muted;
        let stored_pause = self.paused;
        let tune = self.selected;

        self.stop();
        self.mute();
        self.play_tune(current_time, tune);
        self.advance(position);
        self.elapsed = position;

        if !stored_mute {
            self.unmute();
        }
        if stored_pause {
            self.pause();
        }
    }

    /// Pauses playback, freezing the song position.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.silence();
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    pub fn mute(&mut self) {
        self.muted = true;
        self.sink.mute();
    }

    pub fn unmute(&mut self) {
        self.muted = false;
        self.sink.unmute();
    }

    fn silence(&mut self) {
        self.sink.mute();
        if !self.muted {
            self.sink.unmute();
        }
    }

    /// Runs the selected tune muted in 100 ms steps, recording the
    /// loudest dynamics level it reaches, and derives the scalar that
    /// maps that level to full volume.
    pub fn calculate_normalization(&mut self) {
        let stored_mute = self.muted;
        let stored_loop = self.looping;
        let tune = self.selected;
        self.looping = false;
        self.stop();
        self.mute();

        let mut max_volume: f64 = 0.0;
        let mut t = Duration::ZERO;
        self.play_tune(Duration::ZERO, tune);
        while self.playing {
            t += Duration::from_millis(100);
            self.update(t);
            max_volume = max_volume.max(self.volume);
        }

        self.looping = stored_loop;
        if !stored_mute {
            self.unmute();
        }
        if max_volume == 0.0 {
            max_volume = 90.0 / 127.0;
        }
        self.normalize_scalar = 1.0 / max_volume;
    }

    pub fn set_normalize(&mut self, normalize: bool) {
        self.normalize = normalize;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// The current dynamics volume, 0 to 1.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Duration of the selected tune, known since load time.
    pub fn duration(&self) -> Duration {
        self.tunes
            .get(self.selected)
            .map(|t| t.duration)
            .unwrap_or(Duration::ZERO)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of tunes in the loaded source.
    pub fn tune_count(&self) -> usize {
        self.tunes.len().saturating_sub(1)
    }

    /// Tokens of the selected tune.
    pub fn tokens(&self) -> &[String] {
        self.tunes
            .get(self.selected)
            .map(|t| t.tokens.as_slice())
            .unwrap_or(&[])
    }

    fn token_count(&self) -> usize {
        self.tokens().len()
    }

    fn token_at(&self, index: usize) -> Option<String> {
        self.tokens().get(index).cloned()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Releases the sink, calling its teardown hook first.
    pub fn close(mut self) -> S {
        self.sink.close();
        self.sink
    }
}

fn is_inline_field(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.first() == Some(&b'[')
        && token.ends_with(']')
        && bytes.len() > 2
        && bytes[2] == b':'
        && bytes[1] != b'|'
        && bytes[1] != b':'
}

fn parse_version(text: &str) -> Option<(u32, u32)> {
    let mut parts = text.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::EventLog;

    fn strict_player(body: &str) -> AbcPlayer<EventLog> {
        let mut player = AbcPlayer::new(EventLog::default());
        player
            .load(&format!("%abc-2.1\nX:1\n{}\n", body))
            .unwrap();
        player
    }

    fn run_to_end(player: &mut AbcPlayer<EventLog>) {
        player.play(Duration::ZERO);
        let mut t = Duration::ZERO;
        while player.playing() {
            t += Duration::from_millis(25);
            player.update(t);
        }
    }

    #[test]
    fn eight_note_scale_tokenizes_and_plays() {
        let mut player = strict_player("K:C\nCDEFGABc");
        assert_eq!(player.tokens().len(), 8);
        // No length field and a short meter: sixteenths at the default
        // tempo of 120 quarter-note bpm.
        assert_eq!(player.duration(), Duration::from_secs(1));

        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].note.tone, Tone::C);
        assert_eq!(events[0].note.octave, 4);
        assert!(!events[0].note.sharp);
        // The final lower-case c sits an octave up.
        assert_eq!(events[7].note.octave, 5);
        assert_eq!(events[1].time, Duration::from_millis(125));
    }

    #[test]
    fn meter_of_three_quarters_infers_eighths() {
        let player = strict_player("M:6/8\nK:C\nCDE");
        // 3 eighths at spm 2.0 is 0.75 seconds.
        assert_eq!(player.duration(), Duration::from_millis(750));
    }

    #[test]
    fn explicit_length_field_wins() {
        let player = strict_player("L:1/4\nK:C\nCD");
        assert_eq!(player.duration(), Duration::from_secs(1));
    }

    #[test]
    fn tempo_field_fraction_form() {
        let player = strict_player("L:1/4\nQ:1/4=240\nK:C\nCD");
        // 240 quarter-note bpm halves the default rate.
        assert_eq!(player.duration(), Duration::from_millis(500));
    }

    #[test]
    fn tempo_with_bpm_on_the_left() {
        let player = strict_player("L:1/4\nQ:240=1/4\nK:C\nCD");
        assert_eq!(player.duration(), Duration::from_millis(500));
    }

    #[test]
    fn bare_tempo_is_rejected_in_strict_mode() {
        let mut player = AbcPlayer::new(EventLog::default());
        let err = player.load("%abc-2.1\nX:1\nQ:120\nK:C\nC\n");
        assert!(matches!(err, Err(PlayerError::StrictModeViolation(_))));
    }

    #[test]
    fn bare_tempo_is_accepted_leniently() {
        let mut player = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig::lenient(),
            AbcSettings::default(),
        );
        player.load("X:1\nL:1/4\nQ:240\nK:C\nCD\n").unwrap();
        assert_eq!(player.duration(), Duration::from_millis(500));
    }

    #[test]
    fn version_checks_only_bind_in_strict_mode() {
        let mut strict = AbcPlayer::new(EventLog::default());
        assert!(matches!(
            strict.load("X:1\nK:C\nC\n"),
            Err(PlayerError::StrictModeViolation(_))
        ));
        assert!(matches!(
            strict.load("%abc-1.6\nX:1\nK:C\nC\n"),
            Err(PlayerError::StrictModeViolation(_))
        ));

        let mut lenient = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig::lenient(),
            AbcSettings::default(),
        );
        lenient.load("X:1\nK:C\nC\n").unwrap();
        lenient.load("%abc-1.6\nX:1\nK:C\nC\n").unwrap();
    }

    #[test]
    fn title_must_follow_tune_number_in_strict_mode() {
        let mut player = AbcPlayer::new(EventLog::default());
        assert!(matches!(
            player.load("%abc-2.1\nT:Too Early\nX:1\nK:C\nC\n"),
            Err(PlayerError::StrictModeViolation(_))
        ));
        player.load("%abc-2.1\nX:1\nT:Fine Here\nK:C\nC\n").unwrap();
    }

    #[test]
    fn key_signature_flattens_b_in_f_major() {
        let mut player = strict_player("K:F\nB");
        run_to_end(&mut player);
        let note = player.sink().events[0].note;
        // B flat is spelled as A sharp.
        assert_eq!(note.tone, Tone::A);
        assert!(note.sharp);
    }

    #[test]
    fn explicit_accidental_overrides_until_the_barline() {
        let mut player = strict_player("K:F\n^BB|B");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 3);
        // B sharp is spelled as C in the next octave.
        assert_eq!(events[0].note.tone, Tone::C);
        assert_eq!(events[0].note.octave, 5);
        // The override holds for the bare B in the same measure.
        assert_eq!(events[1].note.tone, Tone::C);
        // The barline clears it back to the key's B flat.
        assert_eq!(events[2].note.tone, Tone::A);
        assert!(events[2].note.sharp);
    }

    #[test]
    fn octave_scoped_override_leaves_other_octaves_alone() {
        let mut player = strict_player("K:C\n^Bb");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.tone, Tone::C);
        // The lower-case b lives an octave up, outside the override's
        // scope, so it stays natural.
        assert_eq!(events[1].note.tone, Tone::B);
        assert!(!events[1].note.sharp);
    }

    #[test]
    fn pitch_scoped_override_crosses_octaves() {
        let mut player = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig {
                accidental_propagation: AccidentalPropagation::Pitch,
                ..AbcConfig::default()
            },
            AbcSettings::default(),
        );
        player.load("%abc-2.1\nX:1\nK:C\n^Bb\n").unwrap();
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events[1].note.tone, Tone::C);
        assert_eq!(events[1].note.octave, 6);
    }

    #[test]
    fn unpropagated_accidentals_touch_only_their_note() {
        let mut player = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig {
                accidental_propagation: AccidentalPropagation::Not,
                ..AbcConfig::default()
            },
            AbcSettings::default(),
        );
        player.load("%abc-2.1\nX:1\nK:C\n^CC\n").unwrap();
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert!(events[0].note.sharp);
        assert!(!events[1].note.sharp);
    }

    #[test]
    fn note_length_suffixes() {
        let mut player = strict_player("L:1/8\nK:C\nC2C/2C3/2C//");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events[0].note.length, Duration::from_millis(500));
        assert_eq!(events[1].note.length, Duration::from_millis(125));
        assert_eq!(events[2].note.length, Duration::from_millis(375));
        // A doubled slash with no digits halves once.
        assert_eq!(events[3].note.length, Duration::from_millis(125));
    }

    #[test]
    fn rests_advance_without_sounding() {
        let mut player = strict_player("L:1/8\nK:C\nCzC");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].time, Duration::from_millis(500));
    }

    #[test]
    fn capital_z_rests_whole_measures() {
        let player = strict_player("L:1/8\nK:C\nZ2");
        assert_eq!(player.duration(), Duration::from_secs(4));
    }

    #[test]
    fn chord_advances_by_its_shortest_member() {
        let mut player = strict_player("L:1/8\nK:C\n[CEG]C");
        run_to_end(&mut player);
        let events = &player.sink().events;
        // Three chord members on channels 1..3, then the melody note.
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].channel, 1);
        assert_eq!(events[2].channel, 3);
        assert_eq!(events[3].channel, 0);
        assert_eq!(events[3].time, Duration::from_millis(250));
    }

    #[test]
    fn chord_rests_count_toward_length_but_do_not_sound() {
        let mut player = strict_player("L:1/8\nK:C\n[C2z]C");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        // The rest was the shortest member.
        assert_eq!(events[1].time, Duration::from_millis(250));
    }

    #[test]
    fn chord_of_rests_advances_nothing() {
        let mut player = strict_player("L:1/8\nK:C\n[zz]C");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, Duration::ZERO);
    }

    #[test]
    fn wide_chords_are_trimmed() {
        let mut player = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig::default(),
            AbcSettings {
                max_chord_notes: 2,
                ..AbcSettings::default()
            },
        );
        player.load("%abc-2.1\nX:1\nK:C\n[CEGB]\n").unwrap();
        run_to_end(&mut player);
        assert_eq!(player.sink().events.len(), 2);
    }

    #[test]
    fn ties_merge_equal_pitches() {
        let mut player = strict_player("L:1/8\nK:C\nC-CD");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.length, Duration::from_millis(500));
        assert_eq!(events[1].note.tone, Tone::D);
        assert_eq!(events[1].time, Duration::from_millis(500));
    }

    #[test]
    fn tie_to_a_different_pitch_splits() {
        let mut player = strict_player("L:1/8\nK:C\nC-D");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.length, Duration::from_millis(250));
        assert_eq!(events[1].note.tone, Tone::D);
    }

    #[test]
    fn dynamics_ladder_sets_volume() {
        let mut player = strict_player("L:1/8\nK:C\n+ppp+C+fff+D");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert!((events[0].note.volume - 30.0 / 127.0).abs() < 1e-6);
        assert!((events[1].note.volume - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inline_key_change_takes_effect() {
        let mut player = strict_player("K:C\nB[K:F]B");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events[0].note.tone, Tone::B);
        assert_eq!(events[1].note.tone, Tone::A);
        assert!(events[1].note.sharp);
    }

    #[test]
    fn mid_tune_field_lines_become_inline_tokens() {
        let mut player = strict_player("K:C\nB\nK:F\nB");
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 2);
        assert!(events[1].note.sharp);
    }

    #[test]
    fn book_with_two_tunes_selects_either() {
        let source = "%abc-2.1\nX:1\nK:C\nL:1/4\nCC\n\nX:2\nK:C\nL:1/4\nCCCC\n";
        let mut player = AbcPlayer::new(EventLog::default());
        player.load(source).unwrap();
        assert_eq!(player.tune_count(), 2);
        assert_eq!(player.duration(), Duration::from_secs(1));

        player.play_tune(Duration::ZERO, 2);
        assert_eq!(player.duration(), Duration::from_secs(2));
        let mut t = Duration::ZERO;
        while player.playing() {
            t += Duration::from_millis(25);
            player.update(t);
        }
        assert_eq!(player.sink().events.len(), 4);
    }

    #[test]
    fn duration_limit_is_enforced() {
        let mut player = AbcPlayer::with_config(
            EventLog::default(),
            AbcConfig::default(),
            AbcSettings {
                max_duration: Duration::from_millis(900),
                ..AbcSettings::default()
            },
        );
        assert!(matches!(
            player.load("%abc-2.1\nX:1\nL:1/1\nK:C\nC\n"),
            Err(PlayerError::DurationExceeded { .. })
        ));
    }

    #[test]
    fn seek_matches_fresh_playback() {
        let source = "%abc-2.1\nX:1\nL:1/8\nK:C\nCDEFGABc\n";
        let mut fresh = AbcPlayer::new(EventLog::default());
        fresh.load(source).unwrap();
        fresh.play(Duration::ZERO);
        fresh.update(Duration::from_secs(2));
        let all_events = fresh.sink().events.clone();

        let mut seeked = AbcPlayer::new(EventLog::default());
        seeked.load(source).unwrap();
        seeked.play(Duration::ZERO);
        seeked.seek(Duration::from_secs(1), Duration::from_millis(600));
        seeked.update(Duration::from_millis(2400));

        let expected: Vec<_> = all_events
            .iter()
            .filter(|e| e.time >= Duration::from_millis(600))
            .collect();
        let replayed: Vec<_> = seeked.sink().events.iter().collect();
        assert_eq!(replayed, expected);
    }

    #[test]
    fn pause_freezes_playback() {
        let mut player = strict_player("L:1/4\nK:C\nCDEF");
        player.play(Duration::ZERO);
        player.update(Duration::from_millis(100));
        let emitted = player.sink().events.len();
        player.pause();
        player.update(Duration::from_secs(30));
        assert_eq!(player.sink().events.len(), emitted);
        assert_eq!(player.elapsed(), Duration::from_millis(100));

        player.unpause();
        player.update(Duration::from_secs(30));
        player.update(Duration::from_secs(33));
        assert!(player.sink().events.len() > emitted);
    }

    #[test]
    fn looping_restarts_from_the_top() {
        let mut player = strict_player("L:1/4\nK:C\nC");
        player.set_looping(true);
        player.play(Duration::ZERO);
        player.update(Duration::from_millis(100));
        assert_eq!(player.sink().events.len(), 1);
        player.update(Duration::from_millis(600));
        assert!(player.playing());
        assert_eq!(player.sink().events.len(), 2);
    }

    #[test]
    fn normalization_rescales_quiet_tunes() {
        let mut player = strict_player("L:1/4\nK:C\n+pp+C");
        player.calculate_normalization();
        player.set_normalize(true);
        run_to_end(&mut player);
        let events = &player.sink().events;
        assert_eq!(events.len(), 1);
        assert!((events[0].note.volume - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalization_defaults_without_dynamics() {
        let mut player = strict_player("L:1/4\nK:C\nC");
        player.calculate_normalization();
        // The default volume normalizes against itself.
        assert!((player.normalize_scalar - 127.0 / 90.0).abs() < 1e-9);
    }

    #[test]
    fn comments_are_stripped() {
        let mut player = strict_player("K:C\nCD % trailing comment\n% full comment line\nEF");
        assert_eq!(player.tokens().len(), 4);
        run_to_end(&mut player);
        assert_eq!(player.sink().events.len(), 4);
    }

    #[test]
    fn muted_playback_emits_nothing() {
        let mut player = strict_player("L:1/4\nK:C\nCD");
        player.mute();
        run_to_end(&mut player);
        assert!(player.sink().events.is_empty());
    }
}
