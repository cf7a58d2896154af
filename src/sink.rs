//! The boundary between the sequencer core and whatever makes sound.
//!
//! Players own a [`NoteSink`] and push resolved note events into it as the
//! caller advances time. A sink might drive a MIDI device, mix pitched
//! samples, or just record events; the core never blocks on it.

use std::time::Duration;

use serde::Serialize;

use crate::note::Note;

/// Receives note events from a player.
pub trait NoteSink {
    /// Play a single note. `channel` is the zero-based channel the note
    /// belongs to (its track index for multi-track MML, 0 for an ABC
    /// melody line). `time` is the song time at which the note fell due.
    fn play_note(&mut self, note: Note, channel: usize, time: Duration);

    /// Play the members of a chord together. The default forwards each
    /// member through [`play_note`](Self::play_note) on channels 1, 2, ...
    /// so simultaneous notes do not collide on one channel.
    fn play_chord(&mut self, notes: &[Note], time: Duration) {
        for (i, note) in notes.iter().enumerate() {
            self.play_note(*note, i + 1, time);
        }
    }

    /// Stop anything currently sounding and suppress output. Players also
    /// toggle mute and unmute together to silence the device on stop and
    /// pause, so this must take effect immediately.
    fn mute(&mut self) {}

    /// Resume output after [`mute`](Self::mute).
    fn unmute(&mut self) {}

    /// Teardown hook, called once when the owner is done with the device.
    fn close(&mut self) {}
}

/// One recorded note event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoteEvent {
    pub note: Note,
    pub channel: usize,
    pub time: Duration,
}

/// A sink that records every event it receives. Useful for tests and for
/// rendering a song without audio hardware.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<NoteEvent>,
}

impl EventLog {
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl NoteSink for EventLog {
    fn play_note(&mut self, note: Note, channel: usize, time: Duration) {
        self.events.push(NoteEvent {
            note,
            channel,
            time,
        });
    }
}
