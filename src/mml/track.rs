//! A single MML voice stepped through measure-time on a fixed tick clock.
//!
//! The track is driven by its owner: `update(time)` consumes every tick
//! that has fallen due, processing state commands and resolving the next
//! note or rest whenever the measure position reaches the scheduled spot.
//! Emitted notes are pushed into a caller-provided buffer together with
//! the tick time they fell due; the owner decides what channel they play
//! on and whether they are audible at all.

use std::time::Duration;

use crate::error::PlayerError;
use crate::note::{Accidental, Note, Tone};
use crate::settings::MmlSettings;

use super::command::{tokenize, MmlCommand, MmlLength};

/// The smallest slice of a measure the clock advances by. The shortest
/// length indicator is 64, and a dotted 64 adds half its length again, so
/// the resolution has to be finer than 1/64.
pub const TICK: f64 = 1.0 / 128.0;

/// Which MML rule set is in force. The two dialects differ only in their
/// volume command range and in how tempo commands propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MmlMode {
    /// Volume commands range 1 to 15; a tempo command retunes every track.
    #[default]
    Mabinogi,
    /// Volume commands range 0 to 127; tempo commands stay local.
    ArcheAge,
}

/// One note emitted by a track, stamped with the tick time it fell due.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackEvent {
    pub note: Note,
    pub time: Duration,
}

/// The mutable interpreter state a track carries between commands. Tie
/// lookahead clones this to simulate ahead without touching the track.
#[derive(Debug, Clone, Copy)]
struct TrackState {
    octave: i32,
    length: MmlLength,
    tempo: u32,
    /// Seconds per measure, derived from the tempo.
    spm: f64,
    volume: u32,
}

impl TrackState {
    fn new(settings: &MmlSettings) -> Self {
        let mut state = TrackState {
            octave: 4,
            length: MmlLength::new(4, false),
            tempo: 0,
            spm: 0.0,
            volume: 8,
        };
        state.set_tempo(120, settings);
        state
    }

    fn set_tempo(&mut self, bpm: u32, settings: &MmlSettings) {
        self.tempo = bpm.clamp(settings.min_tempo, settings.max_tempo);
        // A tempo counts quarter-note beats, so a measure is four of them.
        self.spm = 60.0 / (self.tempo as f64 / 4.0);
    }

    fn set_octave(&mut self, octave: i32, settings: &MmlSettings) {
        self.octave = octave.clamp(settings.min_octave, settings.max_octave);
    }

    fn set_volume(&mut self, volume: u32, settings: &MmlSettings, mode: MmlMode) {
        let volume = scale_volume(volume, mode);
        self.volume = volume.clamp(settings.min_volume, settings.max_volume);
    }

    /// Applies a non-sounding command. Returns false when the command is a
    /// note, rest or tie, which the caller handles itself.
    fn apply(&mut self, cmd: &MmlCommand, settings: &MmlSettings, mode: MmlMode) -> bool {
        match *cmd {
            MmlCommand::Length(length) => self.length = length,
            MmlCommand::Octave(octave) => self.set_octave(octave, settings),
            MmlCommand::OctaveUp => self.set_octave(self.octave + 1, settings),
            MmlCommand::OctaveDown => self.set_octave(self.octave - 1, settings),
            MmlCommand::Tempo(bpm) => self.set_tempo(bpm, settings),
            MmlCommand::Volume(volume) => self.set_volume(volume, settings, mode),
            MmlCommand::Unknown(_) => {}
            MmlCommand::Note { .. }
            | MmlCommand::NoteNumber { .. }
            | MmlCommand::Rest { .. }
            | MmlCommand::Tie => return false,
        }
        true
    }

    /// The effective length for a note or rest: an explicit length wins,
    /// a bare dot applies to the default length.
    fn effective_length(&self, length: Option<u32>, dotted: bool) -> MmlLength {
        match length {
            Some(base) => MmlLength::new(base, dotted),
            None if dotted => MmlLength::new(self.length.base, true),
            None => self.length,
        }
    }

    /// Resolves a note or note-number command against this state. Returns
    /// the note and the fraction of a measure it advances the schedule by.
    fn resolve_note(&self, cmd: &MmlCommand) -> Option<(Note, f64)> {
        match *cmd {
            MmlCommand::Note {
                tone,
                accidental,
                length,
                dotted,
            } => {
                let mut note = Note {
                    tone,
                    sharp: false,
                    octave: self.octave,
                    length: Duration::ZERO,
                    volume: self.volume as f32 / 15.0,
                };
                note = match accidental {
                    Some(Accidental::Sharp) => note.step(1),
                    Some(Accidental::Flat) => note.step(-1),
                    None => note,
                };
                let len = self.effective_length(length, dotted);
                note.length = len.to_duration(self.spm);
                Some((note, len.measure_fraction()))
            }
            MmlCommand::NoteNumber { number, dotted } => {
                let mut note = Note {
                    tone: Tone::C,
                    sharp: false,
                    octave: 1,
                    length: Duration::ZERO,
                    volume: self.volume as f32 / 15.0,
                };
                // Note number 12 is C1.
                let offset = number - 12;
                let octaves_up = offset / 12;
                let steps = if octaves_up != 0 {
                    offset % (octaves_up * 12)
                } else {
                    offset
                };
                note.octave += octaves_up;
                note = note.step(steps);
                let len = self.effective_length(None, dotted);
                note.length = len.to_duration(self.spm);
                Some((note, len.measure_fraction()))
            }
            _ => None,
        }
    }
}

/// Rescales a raw volume command into the internal 1 to 15 range.
pub(crate) fn scale_volume(volume: u32, mode: MmlMode) -> u32 {
    match mode {
        MmlMode::Mabinogi => volume,
        MmlMode::ArcheAge => ((volume as f64 / 127.0).clamp(0.0, 1.0) * 15.0).round() as u32,
    }
}

/// A single-voice MML player.
pub struct MmlTrack {
    commands: Vec<MmlCommand>,
    cursor: usize,
    state: TrackState,
    settings: MmlSettings,
    mode: MmlMode,
    playing: bool,
    /// Time at which the next tick falls due.
    next_tick: Duration,
    /// Measure position the next note is scheduled at.
    next_note: f64,
    /// Current measure position.
    cur_measure: f64,
    /// Tempo change waiting to be broadcast by the owner in shared mode.
    pending_tempo: Option<u32>,
}

impl MmlTrack {
    pub fn new(settings: MmlSettings, mode: MmlMode) -> Self {
        let state = TrackState::new(&settings);
        MmlTrack {
            commands: Vec::new(),
            cursor: 0,
            state,
            settings,
            mode,
            playing: false,
            next_tick: Duration::ZERO,
            next_note: 0.0,
            cur_measure: 0.0,
            pending_tempo: None,
        }
    }

    /// Tokenizes one voice's worth of code into this track.
    pub fn load(&mut self, code: &str) -> Result<(), PlayerError> {
        if code.len() > self.settings.max_size {
            return Err(PlayerError::SourceTooLarge {
                size: code.len(),
                max: self.settings.max_size,
            });
        }
        self.commands = tokenize(code);
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.state = TrackState::new(&self.settings);
        self.cursor = 0;
        self.pending_tempo = None;
    }

    /// Starts playback with the given origin time.
    pub fn play(&mut self, time: Duration) {
        self.playing = true;
        self.next_tick = time;
        self.next_note = 0.0;
        self.cur_measure = 0.0;
    }

    /// Stops playback and restores default interpreter state. The final
    /// tick time survives so an owner can read how far the track got.
    pub fn stop(&mut self) {
        self.playing = false;
        self.reset();
    }

    /// Consumes every tick due at `time`, pushing emitted notes into
    /// `events`. Notes are always reported; audibility is the owner's
    /// concern.
    pub fn update(&mut self, time: Duration, events: &mut Vec<TrackEvent>) {
        while self.playing && time >= self.next_tick {
            self.process_commands();

            if self.cur_measure >= self.next_note {
                if self.cursor < self.commands.len() {
                    self.advance_note(events);
                } else {
                    // Out of commands with the last note done: the track
                    // ends here, leaving next_tick at the exact duration
                    // consumed.
                    self.stop();
                    break;
                }
            }

            self.next_tick += Duration::from_secs_f64(TICK * self.state.spm);
            self.cur_measure += TICK;
        }
    }

    /// Applies every non-sounding command at the cursor, stopping at the
    /// next note, rest or tie.
    fn process_commands(&mut self) {
        while self.cursor < self.commands.len() {
            let cmd = self.commands[self.cursor].clone();
            if !self.apply_command(&cmd) {
                return;
            }
            self.cursor += 1;
        }
    }

    fn apply_command(&mut self, cmd: &MmlCommand) -> bool {
        if let MmlCommand::Tempo(bpm) = *cmd {
            if self.mode == MmlMode::Mabinogi {
                self.pending_tempo = Some(bpm);
            }
        }
        self.state.apply(cmd, &self.settings, self.mode)
    }

    /// Resolves and emits the next note, or advances over the next rest.
    fn advance_note(&mut self, events: &mut Vec<TrackEvent>) {
        while self.cursor < self.commands.len() {
            let cmd = self.commands[self.cursor].clone();
            match cmd {
                MmlCommand::Note { .. } | MmlCommand::NoteNumber { .. } => {
                    if let Some((note, fraction)) = self.state.resolve_note(&cmd) {
                        let (note, fraction) = self.merge_ties(note, fraction);
                        self.next_note += fraction;
                        self.emit(note, events);
                    }
                    self.cursor += 1;
                    return;
                }
                MmlCommand::Rest { length, dotted } => {
                    let len = self.state.effective_length(length, dotted);
                    self.next_note += len.measure_fraction();
                    self.cursor += 1;
                    return;
                }
                MmlCommand::Tie => {
                    // A tie that did not merge anything is skipped.
                    self.cursor += 1;
                }
                other => {
                    self.apply_command(&other);
                    self.cursor += 1;
                }
            }
        }
    }

    /// Merges any chain of tied notes of the same pitch behind the note at
    /// the cursor.
    ///
    /// The lookahead simulates state commands between the tie and the tied
    /// note on a cloned state, so a failed merge leaves the track's real
    /// state untouched. When a merge succeeds the simulated state is
    /// committed, which is the same outcome as if the commands had been
    /// processed normally between two separate notes.
    fn merge_ties(&mut self, mut note: Note, mut fraction: f64) -> (Note, f64) {
        let mut committed = self.state;
        let mut committed_tempo: Option<u32> = None;
        let mut scan = self.cursor + 1;

        while matches!(self.commands.get(scan), Some(MmlCommand::Tie)) {
            let mut trial = committed;
            let mut trial_tempo = committed_tempo;
            let mut k = scan + 1;
            while let Some(between) = self.commands.get(k) {
                match between {
                    MmlCommand::Note { .. }
                    | MmlCommand::NoteNumber { .. }
                    | MmlCommand::Rest { .. }
                    | MmlCommand::Tie => break,
                    other => {
                        if let MmlCommand::Tempo(bpm) = *other {
                            trial_tempo = Some(bpm);
                        }
                        trial.apply(other, &self.settings, self.mode);
                        k += 1;
                    }
                }
            }

            let tied_cmd = match self.commands.get(k) {
                Some(c @ (MmlCommand::Note { .. } | MmlCommand::NoteNumber { .. })) => c.clone(),
                _ => break,
            };
            let (tied, tied_fraction) = match trial.resolve_note(&tied_cmd) {
                Some(resolved) => resolved,
                None => break,
            };
            if tied.tone != note.tone || tied.sharp != note.sharp || tied.octave != note.octave {
                break;
            }

            note.length += tied.length;
            fraction += tied_fraction;
            committed = trial;
            committed_tempo = trial_tempo;
            self.cursor = k;
            scan = k + 1;
        }

        self.state = committed;
        if let Some(bpm) = committed_tempo {
            if self.mode == MmlMode::Mabinogi {
                self.pending_tempo = Some(bpm);
            }
        }
        (note, fraction)
    }

    fn emit(&mut self, mut note: Note, events: &mut Vec<TrackEvent>) {
        note.octave = note
            .octave
            .clamp(self.settings.min_octave, self.settings.max_octave);
        note.volume = note.volume.clamp(0.0, 1.0);
        events.push(TrackEvent {
            note,
            time: self.next_tick,
        });
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn next_tick(&self) -> Duration {
        self.next_tick
    }

    pub fn commands(&self) -> &[MmlCommand] {
        &self.commands
    }

    /// Sets the tempo directly, as a coordinator broadcast does.
    pub fn set_tempo(&mut self, bpm: u32) {
        let settings = self.settings.clone();
        self.state.set_tempo(bpm, &settings);
    }

    /// Takes the tempo change this track wants broadcast, if any.
    pub fn take_pending_tempo(&mut self) -> Option<u32> {
        self.pending_tempo.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(track: &mut MmlTrack) -> Vec<TrackEvent> {
        let mut events = Vec::new();
        track.play(Duration::ZERO);
        while track.playing() {
            let next = track.next_tick();
            track.update(next, &mut events);
        }
        events
    }

    fn load(code: &str) -> MmlTrack {
        let mut track = MmlTrack::new(MmlSettings::default(), MmlMode::Mabinogi);
        track.load(code).unwrap();
        track
    }

    #[test]
    fn quarter_note_at_default_tempo() {
        let mut track = load("c4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].note.tone, Tone::C);
        assert_eq!(events[0].note.octave, 4);
        assert_eq!(events[0].note.length, Duration::from_millis(500));
        assert_eq!(events[0].time, Duration::ZERO);
        // The track consumed exactly one quarter of a two second measure.
        assert_eq!(track.next_tick(), Duration::from_millis(500));
    }

    #[test]
    fn default_length_and_dots() {
        let mut track = load("l8c c4. c.");
        let events = drive(&mut track);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].note.length, Duration::from_millis(250));
        assert_eq!(events[1].note.length, Duration::from_millis(750));
        // A bare dot lengthens the default eighth by half.
        assert_eq!(events[2].note.length, Duration::from_millis(375));
    }

    #[test]
    fn octave_shifts_clamp() {
        let mut track = load("o8>>c o1<<c");
        let events = drive(&mut track);
        assert_eq!(events[0].note.octave, 8);
        assert_eq!(events[1].note.octave, 1);
    }

    #[test]
    fn note_numbers_resolve_from_c1() {
        // 12 is C1, 49 is C sharp 4.
        let mut track = load("n12n49");
        let events = drive(&mut track);
        assert_eq!(events[0].note.tone, Tone::C);
        assert_eq!(events[0].note.octave, 1);
        assert!(!events[0].note.sharp);
        assert_eq!(events[1].note.tone, Tone::C);
        assert!(events[1].note.sharp);
        assert_eq!(events[1].note.octave, 4);
    }

    #[test]
    fn tie_merges_identical_pitch() {
        let mut track = load("c4&c4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].note.length, Duration::from_secs(1));
    }

    #[test]
    fn tie_is_associative_over_three_notes() {
        let mut track = load("c4&c4&c4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].note.length, Duration::from_millis(1500));
    }

    #[test]
    fn tie_merges_across_state_commands() {
        // The length command between the tied notes must be honored by the
        // lookahead and stay in force afterwards.
        let mut track = load("c4&l8c c");
        let events = drive(&mut track);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.length, Duration::from_millis(750));
        assert_eq!(events[1].note.length, Duration::from_millis(250));
    }

    #[test]
    fn tie_stops_at_pitch_mismatch() {
        let mut track = load("c4&d4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.length, Duration::from_millis(500));
        assert_eq!(events[1].note.tone, Tone::D);
    }

    #[test]
    fn tie_respects_octave_changes_in_lookahead() {
        // The octave shift makes the second c a different pitch, so no
        // merge happens and the shift still applies to the second note.
        let mut track = load("c4&>c4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note.octave, 4);
        assert_eq!(events[1].note.octave, 5);
    }

    #[test]
    fn rest_advances_time_without_emitting() {
        let mut track = load("c4r4c4");
        let events = drive(&mut track);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].time, Duration::ZERO);
        assert_eq!(events[1].time, Duration::from_secs(1));
    }

    #[test]
    fn volume_scales_into_unit_range() {
        let mut track = load("v15c v1c");
        let events = drive(&mut track);
        assert!((events[0].note.volume - 1.0).abs() < 1e-6);
        assert!((events[1].note.volume - 1.0 / 15.0).abs() < 1e-6);
    }

    #[test]
    fn archeage_volume_rescales() {
        let mut track = MmlTrack::new(MmlSettings::default(), MmlMode::ArcheAge);
        track.load("v127c v64c").unwrap();
        let events = drive(&mut track);
        assert!((events[0].note.volume - 1.0).abs() < 1e-6);
        assert!((events[1].note.volume - 8.0 / 15.0).abs() < 1e-6);
    }

    #[test]
    fn tempo_change_speeds_up_following_notes() {
        let mut track = load("c4t240c4");
        let events = drive(&mut track);
        assert_eq!(events[0].note.length, Duration::from_millis(500));
        assert_eq!(events[1].note.length, Duration::from_millis(250));
    }

    #[test]
    fn shared_mode_reports_tempo_changes() {
        let mut track = load("t90c4");
        let mut events = Vec::new();
        track.play(Duration::ZERO);
        track.update(Duration::ZERO, &mut events);
        assert_eq!(track.take_pending_tempo(), Some(90));
        assert_eq!(track.take_pending_tempo(), None);
    }

    #[test]
    fn per_track_mode_keeps_tempo_local() {
        let mut track = MmlTrack::new(MmlSettings::default(), MmlMode::ArcheAge);
        track.load("t90c4").unwrap();
        let mut events = Vec::new();
        track.play(Duration::ZERO);
        track.update(Duration::ZERO, &mut events);
        assert_eq!(track.take_pending_tempo(), None);
    }
}
