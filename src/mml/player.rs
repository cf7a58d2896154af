//! The multi-track MML player.
//!
//! Owns one [`MmlTrack`] per comma-separated voice plus the sink the
//! resolved notes go to. Total duration is computed at load time by a
//! muted dry-run of the whole song, so it is known before the first real
//! `update`. All timekeeping is internal: the caller supplies wall-clock
//! timestamps and the player accumulates elapsed song time from them,
//! which is what makes pausing and seeking work.

use std::time::Duration;

use crate::error::PlayerError;
use crate::note::Note;
use crate::settings::MmlSettings;
use crate::sink::NoteSink;

use super::command::MmlCommand;
use super::track::{scale_volume, MmlMode, MmlTrack, TrackEvent};

/// Construction-time configuration for an [`MmlPlayer`].
#[derive(Debug, Clone, Default)]
pub struct MmlConfig {
    pub settings: MmlSettings,
    pub mode: MmlMode,
    /// When strict, the source must carry the `MML@` prefix and the `;`
    /// terminator. Lenient mode accepts bare code and strips the markers
    /// when present.
    pub strict: bool,
}

impl MmlConfig {
    pub fn strict() -> Self {
        MmlConfig {
            strict: true,
            ..MmlConfig::default()
        }
    }
}

/// A multi-track MML player feeding a [`NoteSink`].
pub struct MmlPlayer<S: NoteSink> {
    sink: S,
    tracks: Vec<MmlTrack>,
    settings: MmlSettings,
    mode: MmlMode,
    strict: bool,
    duration: Duration,
    muted: bool,
    paused: bool,
    looping: bool,
    normalize: bool,
    normalize_scalar: f32,
    elapsed: Duration,
    cur_time: Duration,
    started: bool,
    scratch: Vec<TrackEvent>,
}

impl<S: NoteSink> MmlPlayer<S> {
    /// A strict Mabinogi-dialect player with default limits.
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, MmlConfig::strict())
    }

    pub fn with_config(sink: S, config: MmlConfig) -> Self {
        MmlPlayer {
            sink,
            tracks: Vec::new(),
            settings: config.settings,
            mode: config.mode,
            strict: config.strict,
            duration: Duration::ZERO,
            muted: false,
            paused: false,
            looping: false,
            normalize: false,
            normalize_scalar: 1.0,
            elapsed: Duration::ZERO,
            cur_time: Duration::ZERO,
            started: false,
            scratch: Vec::new(),
        }
    }

    /// Loads a song, one track per comma-separated voice, then runs the
    /// muted dry-run that computes total duration. On error the player is
    /// left without a song until the next successful load.
    pub fn load(&mut self, code: &str) -> Result<(), PlayerError> {
        let result = self.load_inner(code);
        if result.is_err() {
            self.tracks.clear();
            self.duration = Duration::ZERO;
        }
        result
    }

    fn load_inner(&mut self, code: &str) -> Result<(), PlayerError> {
        if code.len() > self.settings.max_size {
            return Err(PlayerError::SourceTooLarge {
                size: code.len(),
                max: self.settings.max_size,
            });
        }

        let trimmed = code.trim();
        let has_prefix =
            trimmed.len() >= 4 && trimmed.as_bytes()[..4].eq_ignore_ascii_case(b"MML@");
        let body = if self.strict {
            if !has_prefix {
                return Err(PlayerError::MalformedSource(
                    "MML code should start with 'MML@'".into(),
                ));
            }
            if !trimmed.ends_with(';') {
                return Err(PlayerError::MalformedSource(
                    "MML code should end with ';'".into(),
                ));
            }
            &trimmed[4..trimmed.len() - 1]
        } else {
            let body = if has_prefix { &trimmed[4..] } else { trimmed };
            body.strip_suffix(';').unwrap_or(body)
        };

        let voices: Vec<&str> = body.split(',').collect();
        if let Some(max) = self.settings.max_tracks {
            if voices.len() > max {
                return Err(PlayerError::MalformedSource(format!(
                    "track count {} exceeds the maximum of {}",
                    voices.len(),
                    max
                )));
            }
        }

        self.tracks = Vec::with_capacity(voices.len());
        for voice in voices {
            let mut track = MmlTrack::new(self.settings.clone(), self.mode);
            track.load(voice)?;
            self.tracks.push(track);
        }

        self.duration = self.calculate_duration()?;
        self.elapsed = Duration::ZERO;
        self.started = false;
        self.normalize_scalar = 1.0;
        log::debug!(
            "loaded {} MML track(s), duration {:?}",
            self.tracks.len(),
            self.duration
        );
        Ok(())
    }

    /// Runs the whole song muted, stepping every track on its own tick
    /// clock, and reports the furthest tick any track reached.
    fn calculate_duration(&mut self) -> Result<Duration, PlayerError> {
        let stored_mute = self.muted;
        self.muted = true;

        for track in &mut self.tracks {
            track.play(Duration::ZERO);
        }

        let mut result = Ok(());
        'run: while self.playing() {
            for i in 0..self.tracks.len() {
                if !self.tracks[i].playing() {
                    continue;
                }
                let next = self.tracks[i].next_tick();
                self.scratch.clear();
                self.tracks[i].update(next, &mut self.scratch);
                self.broadcast_pending(i);
            }

            if self.max_tick() > self.settings.max_duration {
                result = Err(PlayerError::DurationExceeded {
                    max: self.settings.max_duration,
                });
                break 'run;
            }
        }

        let duration = self.max_tick();
        for track in &mut self.tracks {
            track.stop();
        }
        self.scratch.clear();
        self.muted = stored_mute;
        result.map(|_| duration)
    }

    fn max_tick(&self) -> Duration {
        self.tracks
            .iter()
            .map(|t| t.next_tick())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn min_playing_tick(&self) -> Option<Duration> {
        self.tracks
            .iter()
            .filter(|t| t.playing())
            .map(|t| t.next_tick())
            .min()
    }

    fn broadcast_pending(&mut self, index: usize) {
        if let Some(bpm) = self.tracks[index].take_pending_tempo() {
            for track in &mut self.tracks {
                track.set_tempo(bpm);
            }
        }
    }

    /// Starts playback at the given wall-clock time. When paused this
    /// resumes instead; when already playing it restarts from the top.
    pub fn play(&mut self, time: Duration) {
        if self.paused {
            self.unpause();
            return;
        }
        self.cur_time = time;
        self.elapsed = Duration::ZERO;
        self.started = true;
        for track in &mut self.tracks {
            track.stop();
            track.play(Duration::ZERO);
        }
        // The first tick falls due immediately.
        self.advance(Duration::ZERO);
    }

    /// Advances playback to the given wall-clock time, emitting every note
    /// that has fallen due. Timestamps must be non-decreasing; a timestamp
    /// that moves backwards is a no-op.
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

        if !self.playing() && self.looping && !self.tracks.is_empty() {
            self.stop();
            self.play(time);
        }
    }

    /// Steps tracks up to the given song time, policy depending on mode.
    fn advance(&mut self, song_time: Duration) {
        match self.mode {
            MmlMode::Mabinogi => loop {
                match self.min_playing_tick() {
                    Some(min_tick) if song_time >= min_tick => {}
                    _ => break,
                }
                for i in 0..self.tracks.len() {
                    if !self.tracks[i].playing() {
                        continue;
                    }
                    let next = self.tracks[i].next_tick();
                    self.step_track(i, next);
                }
            },
            MmlMode::ArcheAge => {
                for i in 0..self.tracks.len() {
                    self.step_track(i, song_time);
                }
            }
        }
    }

    fn step_track(&mut self, index: usize, up_to: Duration) {
        let mut events = std::mem::take(&mut self.scratch);
        events.clear();
        self.tracks[index].update(up_to, &mut events);
        self.broadcast_pending(index);
        for event in events.drain(..) {
            self.emit(event, index);
        }
        self.scratch = events;
    }

    fn emit(&mut self, event: TrackEvent, channel: usize) {
        if self.muted {
            return;
        }
        let mut note = event.note;
        if self.normalize {
            note.volume = (note.volume * self.normalize_scalar).clamp(0.0, 1.0);
        }
        log::trace!("note {} on channel {} at {:?}", note, channel, event.time);
        self.sink.play_note(note, channel, event.time);
    }

    /// Stops playback and rewinds. Sounding notes are silenced.
    pub fn stop(&mut self) {
        self.elapsed = Duration::ZERO;
        self.paused = false;
        self.started = false;
        for track in &mut self.tracks {
            track.stop();
        }
        self.silence();
    }

    /// Seeks so the song continues from `position`, emitting nothing while
    /// skipping. Equivalent to a fresh play followed by one update that
    /// covers `position`.
    pub fn seek(&mut self, current_time: Duration, position: Duration) {
        let stored_mute = self.muted;
        let stored_pause = self.paused;

        self.stop();
        self.mute();
        self.play(current_time);
        self.advance(position);
        self.elapsed = position;

        if !stored_mute {
            self.unmute();
        }
        if stored_pause {
            self.pause();
        }
    }

    /// Pauses playback, freezing the song position. Sounding notes stop.
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

    /// Stops sounding notes without changing the mute state.
    fn silence(&mut self) {
        self.sink.mute();
        if !self.muted {
            self.sink.unmute();
        }
    }

    /// Sets the tempo of every track. Under the per-track dialect tempo is
    /// owned by each voice's own command stream, so this does nothing.
    pub fn set_tempo(&mut self, bpm: u32) {
        if self.mode == MmlMode::Mabinogi {
            for track in &mut self.tracks {
                track.set_tempo(bpm);
            }
        }
    }

    /// Scans the loaded commands for the loudest volume any track reaches
    /// and derives the scalar that maps it to full volume. A track with
    /// notes but no volume command counts as the default volume of 8.
    pub fn calculate_normalization(&mut self) {
        let mut max_volume: u32 = 0;
        for track in &self.tracks {
            let mut track_volume: u32 = 0;
            for cmd in track.commands() {
                match *cmd {
                    MmlCommand::Volume(v) => {
                        let v = scale_volume(v, self.mode)
                            .clamp(self.settings.min_volume, self.settings.max_volume);
                        track_volume = track_volume.max(v);
                    }
                    MmlCommand::Note { .. } | MmlCommand::NoteNumber { .. } => {
                        if track_volume == 0 {
                            track_volume = 8;
                        }
                    }
                    _ => {}
                }
            }
            max_volume = max_volume.max(track_volume);
        }
        if max_volume == 0 {
            max_volume = 8;
        }
        self.normalize_scalar = 15.0 / max_volume as f32;
    }

    pub fn set_normalize(&mut self, normalize: bool) {
        self.normalize = normalize;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn playing(&self) -> bool {
        self.tracks.iter().any(|t| t.playing())
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Total duration of the loaded song, known since load time.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Song time elapsed since playback started.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
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
