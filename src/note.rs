//! The note value type shared by every dialect.
//!
//! A [`Note`] is the resolved form of one sounding or silent event: a tone
//! letter, a sharp flag, an octave, a duration and a volume. Players build
//! these while stepping through their token streams and hand them to the
//! sink; a note is never mutated after it has been emitted.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Base letter of a note, or a rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    /// A silent event. Rests carry a length but no pitch.
    Rest,
}

impl Tone {
    /// Maps a letter to a tone, case-insensitively. `r` maps to [`Tone::Rest`].
    pub fn from_char(c: char) -> Option<Tone> {
        match c.to_ascii_lowercase() {
            'a' => Some(Tone::A),
            'b' => Some(Tone::B),
            'c' => Some(Tone::C),
            'd' => Some(Tone::D),
            'e' => Some(Tone::E),
            'f' => Some(Tone::F),
            'g' => Some(Tone::G),
            'r' => Some(Tone::Rest),
            _ => None,
        }
    }

    /// The lower-case letter of this tone; `r` for a rest.
    pub fn letter(self) -> char {
        match self {
            Tone::A => 'a',
            Tone::B => 'b',
            Tone::C => 'c',
            Tone::D => 'd',
            Tone::E => 'e',
            Tone::F => 'f',
            Tone::G => 'g',
            Tone::Rest => 'r',
        }
    }
}

/// An explicit accidental on an MML note token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accidental {
    Sharp,
    Flat,
}

/// A resolved note event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Note {
    /// Base tone letter, or rest.
    pub tone: Tone,
    /// Whether the tone is raised a semitone. Flats are spelled as the
    /// sharp of the letter below, so this flag plus `tone` covers the
    /// whole chromatic scale.
    pub sharp: bool,
    /// Octave number; octave 4 contains middle C.
    pub octave: i32,
    /// How long the note sounds.
    pub length: Duration,
    /// Volume in `[0.0, 1.0]`.
    pub volume: f32,
}

impl Note {
    /// A natural, octave 4. The usual tuning reference for frequencies.
    pub const A4: Note = Note {
        tone: Tone::A,
        sharp: false,
        octave: 4,
        length: Duration::ZERO,
        volume: 0.0,
    };

    pub fn is_rest(&self) -> bool {
        self.tone == Tone::Rest
    }

    /// Moves the note up or down by `steps` semitones, walking the
    /// chromatic scale with its conventional sharp spellings: stepping up
    /// from A gives A sharp, then B; B steps straight to C and increments
    /// the octave, and E steps straight to F. The downward walk mirrors
    /// this, so stepping down from B gives A sharp. Rests are unchanged.
    pub fn step(mut self, steps: i32) -> Note {
        if self.tone == Tone::Rest {
            return self;
        }
        if steps > 0 {
            for _ in 0..steps {
                match (self.tone, self.sharp) {
                    (Tone::A, false) => self.sharp = true,
                    (Tone::A, true) => {
                        self.tone = Tone::B;
                        self.sharp = false;
                    }
                    (Tone::B, _) => {
                        self.tone = Tone::C;
                        self.sharp = false;
                        self.octave += 1;
                    }
                    (Tone::C, false) => self.sharp = true,
                    (Tone::C, true) => {
                        self.tone = Tone::D;
                        self.sharp = false;
                    }
                    (Tone::D, false) => self.sharp = true,
                    (Tone::D, true) => {
                        self.tone = Tone::E;
                        self.sharp = false;
                    }
                    (Tone::E, _) => {
                        self.tone = Tone::F;
                        self.sharp = false;
                    }
                    (Tone::F, false) => self.sharp = true,
                    (Tone::F, true) => {
                        self.tone = Tone::G;
                        self.sharp = false;
                    }
                    (Tone::G, false) => self.sharp = true,
                    (Tone::G, true) => {
                        self.tone = Tone::A;
                        self.sharp = false;
                    }
                    (Tone::Rest, _) => unreachable!(),
                }
            }
        } else {
            for _ in 0..steps.abs() {
                match (self.tone, self.sharp) {
                    (Tone::A, true) => self.sharp = false,
                    (Tone::A, false) => {
                        self.tone = Tone::G;
                        self.sharp = true;
                    }
                    (Tone::B, _) => {
                        self.tone = Tone::A;
                        self.sharp = true;
                    }
                    (Tone::C, true) => self.sharp = false,
                    (Tone::C, false) => {
                        self.tone = Tone::B;
                        self.octave -= 1;
                    }
                    (Tone::D, true) => self.sharp = false,
                    (Tone::D, false) => {
                        self.tone = Tone::C;
                        self.sharp = true;
                    }
                    (Tone::E, _) => {
                        self.tone = Tone::D;
                        self.sharp = true;
                    }
                    (Tone::F, true) => self.sharp = false,
                    (Tone::F, false) => {
                        self.tone = Tone::E;
                        self.sharp = false;
                    }
                    (Tone::G, true) => self.sharp = false,
                    (Tone::G, false) => {
                        self.tone = Tone::F;
                        self.sharp = true;
                    }
                    (Tone::Rest, _) => unreachable!(),
                }
            }
        }
        self
    }

    /// The absolute semitone index of this note: C is 0 within an octave,
    /// B is 11, plus twelve per octave. A4 has index 57.
    pub fn semitone_index(&self) -> i32 {
        let step = match (self.tone, self.sharp) {
            (Tone::C, false) => 0,
            (Tone::C, true) => 1,
            (Tone::D, false) => 2,
            (Tone::D, true) => 3,
            (Tone::E, _) => 4,
            (Tone::F, false) => 5,
            (Tone::F, true) => 6,
            (Tone::G, false) => 7,
            (Tone::G, true) => 8,
            (Tone::A, false) => 9,
            (Tone::A, true) => 10,
            (Tone::B, _) => 11,
            (Tone::Rest, _) => 0,
        };
        step + self.octave * 12
    }

    /// The note's frequency in Hz, tuned against A4 at 440 Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency_from(Note::A4)
    }

    /// The note's frequency in Hz with a custom tuning note, where the
    /// tuning note sounds at 440 Hz.
    pub fn frequency_from(&self, tuning: Note) -> f64 {
        let dist = self.semitone_index() - tuning.semitone_index();
        440.0 * 2f64.powf(dist as f64 / 12.0)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_rest() {
            write!(f, "r")
        } else {
            write!(
                f,
                "{}{}{}",
                self.tone.letter(),
                if self.sharp { "#" } else { "" },
                self.octave
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nat(tone: Tone, octave: i32) -> Note {
        Note {
            tone,
            sharp: false,
            octave,
            length: Duration::ZERO,
            volume: 1.0,
        }
    }

    #[test]
    fn step_up_spells_sharps() {
        let a = nat(Tone::A, 4);
        let a_sharp = a.step(1);
        assert_eq!(a_sharp.tone, Tone::A);
        assert!(a_sharp.sharp);

        let b = a.step(2);
        assert_eq!(b.tone, Tone::B);
        assert!(!b.sharp);
    }

    #[test]
    fn step_up_crosses_octave_at_b() {
        let b = nat(Tone::B, 4);
        let c = b.step(1);
        assert_eq!(c.tone, Tone::C);
        assert!(!c.sharp);
        assert_eq!(c.octave, 5);
    }

    #[test]
    fn step_up_has_no_e_sharp() {
        let e = nat(Tone::E, 4);
        let f = e.step(1);
        assert_eq!(f.tone, Tone::F);
        assert!(!f.sharp);
        assert_eq!(f.octave, 4);
    }

    #[test]
    fn step_down_crosses_octave_at_c() {
        let c = nat(Tone::C, 4);
        let b = c.step(-1);
        assert_eq!(b.tone, Tone::B);
        assert!(!b.sharp);
        assert_eq!(b.octave, 3);
    }

    #[test]
    fn step_down_spells_flats_as_sharps() {
        let b = nat(Tone::B, 4);
        let b_flat = b.step(-1);
        assert_eq!(b_flat.tone, Tone::A);
        assert!(b_flat.sharp);
    }

    #[test]
    fn step_round_trip() {
        let start = nat(Tone::D, 4);
        let there_and_back = start.step(7).step(-7);
        assert_eq!(there_and_back.tone, start.tone);
        assert_eq!(there_and_back.sharp, start.sharp);
        assert_eq!(there_and_back.octave, start.octave);
    }

    #[test]
    fn semitone_indices() {
        assert_eq!(nat(Tone::C, 4).semitone_index(), 48);
        assert_eq!(Note::A4.semitone_index(), 57);
        assert_eq!(nat(Tone::B, 4).semitone_index(), 59);
    }

    #[test]
    fn frequencies() {
        assert!((Note::A4.frequency() - 440.0).abs() < 1e-9);
        assert!((nat(Tone::A, 5).frequency() - 880.0).abs() < 1e-9);
        // Middle C
        assert!((nat(Tone::C, 4).frequency() - 261.625).abs() < 0.01);
    }
}
