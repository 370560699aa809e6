//! Music theory primitives
//!
//! Minimal contract consumed by craft and dub: parse a key or chord name to its
//! root pitch class, transpose it, and render its colloquial form. Notes carry an
//! octave so voicings can be compared by absolute pitch.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tone name used by pattern events that take their pitch from context
pub const ATONAL: &str = "X";

/// Preferred spelling when rendering a pitch class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Accidental {
    #[default]
    Sharp,
    Flat,
}

/// One of the twelve pitch classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PitchClass(u8);

const SHARP_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
const FLAT_NAMES: [&str; 12] = ["C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B"];

impl PitchClass {
    /// Pitch class for a semitone count, wrapping into 0..12
    pub fn from_semitone(semitone: i32) -> Self {
        Self(semitone.rem_euclid(12) as u8)
    }

    /// Semitones above C (0..12)
    pub fn semitone(self) -> i32 {
        self.0 as i32
    }

    pub fn transpose(self, semitones: i32) -> Self {
        Self::from_semitone(self.semitone() + semitones)
    }

    pub fn name(self, accidental: Accidental) -> &'static str {
        match accidental {
            Accidental::Sharp => SHARP_NAMES[self.0 as usize],
            Accidental::Flat => FLAT_NAMES[self.0 as usize],
        }
    }

    /// Parse a leading pitch class name, returning the remainder of the input
    ///
    /// Accepts a letter A-G (either case) followed by any number of `#`/`♯` or
    /// `b`/`♭` modifiers.
    pub fn parse_prefix(input: &str) -> Option<(Self, Accidental, &str)> {
        let mut chars = input.char_indices();
        let (_, letter) = chars.next()?;
        let base = match letter.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let mut offset = 0;
        let mut accidental = Accidental::Sharp;
        let mut rest = &input[letter.len_utf8()..];
        loop {
            if let Some(stripped) = rest.strip_prefix('#').or_else(|| rest.strip_prefix('♯')) {
                offset += 1;
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('♭') {
                offset -= 1;
                accidental = Accidental::Flat;
                rest = stripped;
            } else if rest.starts_with('b') && !rest.starts_with("b5") {
                // lowercase "b" directly after the letter is a flat
                offset -= 1;
                accidental = Accidental::Flat;
                rest = &rest[1..];
            } else {
                break;
            }
        }
        Some((Self::from_semitone(base + offset), accidental, rest))
    }
}

/// A pitch class in a specific octave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    pub pitch_class: PitchClass,
    pub octave: i32,
}

impl Note {
    pub fn new(pitch_class: PitchClass, octave: i32) -> Self {
        Self { pitch_class, octave }
    }

    /// Parse a note such as `C4`, `F#3` or `Bb2`; a missing octave means octave 4
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let (pitch_class, _, rest) = PitchClass::parse_prefix(trimmed)
            .ok_or_else(|| Error::Music(format!("not a note: {:?}", name)))?;
        let octave = if rest.is_empty() {
            4
        } else {
            rest.parse::<i32>()
                .map_err(|_| Error::Music(format!("bad octave in note {:?}", name)))?
        };
        Ok(Self::new(pitch_class, octave))
    }

    /// Whether a tone name is the atonal placeholder
    pub fn is_atonal(name: &str) -> bool {
        name.trim().eq_ignore_ascii_case(ATONAL)
    }

    /// Absolute pitch in semitones (C0 = 0)
    pub fn pitch(&self) -> i32 {
        self.octave * 12 + self.pitch_class.semitone()
    }

    pub fn from_pitch(pitch: i32) -> Self {
        Self::new(PitchClass::from_semitone(pitch), pitch.div_euclid(12))
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self::from_pitch(self.pitch() + semitones)
    }

    pub fn to_string_with(&self, accidental: Accidental) -> String {
        format!("{}{}", self.pitch_class.name(accidental), self.octave)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_with(Accidental::Sharp))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Major,
    Minor,
}

/// Musical key: a root pitch class and a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub root: PitchClass,
    pub mode: Mode,
    pub accidental: Accidental,
}

impl Key {
    /// Parse names like `C minor`, `Cm`, `F# Major`, `Bb`
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let (root, accidental, rest) = PitchClass::parse_prefix(trimmed)
            .ok_or_else(|| Error::Music(format!("not a key: {:?}", name)))?;
        let rest = rest.trim();
        let lower = rest.to_ascii_lowercase();
        let mode = if rest.starts_with('m') && !lower.starts_with("maj")
            || lower.starts_with("min")
            || rest.starts_with('-')
        {
            Mode::Minor
        } else {
            Mode::Major
        };
        Ok(Self { root, mode, accidental })
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self {
            root: self.root.transpose(semitones),
            ..*self
        }
    }

    /// Colloquial form, e.g. `C Minor`
    pub fn full_description(&self) -> String {
        let mode = match self.mode {
            Mode::Major => "Major",
            Mode::Minor => "Minor",
        };
        format!("{} {}", self.root.name(self.accidental), mode)
    }

    /// Semitones needed to move `from` to `to`, plus `adjust`, folded into -5..=6
    pub fn delta(from: &str, to: &str, adjust: i32) -> Result<i32> {
        let from = Self::parse(from)?;
        let to = Self::parse(to)?;
        Ok(fold_semitones(to.root.semitone() - from.root.semitone() + adjust))
    }
}

/// Fold any semitone offset into the nearest equivalent in -5..=6
pub fn fold_semitones(semitones: i32) -> i32 {
    let wrapped = semitones.rem_euclid(12);
    if wrapped > 6 {
        wrapped - 12
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChordQuality {
    Major,
    Minor,
    Diminished,
    Augmented,
    Suspended2,
    Suspended4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seventh {
    None,
    Minor,
    Major,
}

/// Parsed chord name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chord {
    pub root: PitchClass,
    pub quality: ChordQuality,
    pub seventh: Seventh,
    pub accidental: Accidental,
}

impl Chord {
    /// Parse chord names like `C`, `Cm7`, `F#maj7`, `Bb/D`, `G minor`
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let (root, accidental, rest) = PitchClass::parse_prefix(trimmed)
            .ok_or_else(|| Error::Music(format!("not a chord: {:?}", name)))?;
        let rest = rest.split('/').next().unwrap_or("").trim();
        let lower = rest.to_ascii_lowercase();

        let (quality, tail) = if lower.starts_with("major") {
            (ChordQuality::Major, &lower[5..])
        } else if lower.starts_with("maj") {
            (ChordQuality::Major, &lower[3..])
        } else if lower.starts_with("minor") {
            (ChordQuality::Minor, &lower[5..])
        } else if lower.starts_with("min") {
            (ChordQuality::Minor, &lower[3..])
        } else if rest.starts_with('M') {
            (ChordQuality::Major, &lower[1..])
        } else if rest.starts_with('m') || rest.starts_with('-') {
            (ChordQuality::Minor, &lower[1..])
        } else if lower.starts_with("diminished") {
            (ChordQuality::Diminished, &lower[10..])
        } else if lower.starts_with("dim") {
            (ChordQuality::Diminished, &lower[3..])
        } else if lower.starts_with("augmented") {
            (ChordQuality::Augmented, &lower[9..])
        } else if lower.starts_with("aug") {
            (ChordQuality::Augmented, &lower[3..])
        } else if rest.starts_with('+') {
            (ChordQuality::Augmented, &lower[1..])
        } else if lower.starts_with("sus2") {
            (ChordQuality::Suspended2, &lower[4..])
        } else if lower.starts_with("sus4") || lower.starts_with("sus") {
            (ChordQuality::Suspended4, lower.trim_start_matches("sus4").trim_start_matches("sus"))
        } else {
            (ChordQuality::Major, lower.as_str())
        };

        let major_prefixed = lower.starts_with("maj") || rest.starts_with('M');
        let seventh = if tail.contains("major 7") || (major_prefixed && tail.trim_start().starts_with('7')) {
            Seventh::Major
        } else if tail.contains('7') {
            Seventh::Minor
        } else {
            Seventh::None
        };

        Ok(Self {
            root,
            quality,
            seventh,
            accidental,
        })
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self {
            root: self.root.transpose(semitones),
            ..self.clone()
        }
    }

    /// Colloquial form, e.g. `C minor 7`
    pub fn full_description(&self) -> String {
        let quality = match self.quality {
            ChordQuality::Major => "major",
            ChordQuality::Minor => "minor",
            ChordQuality::Diminished => "diminished",
            ChordQuality::Augmented => "augmented",
            ChordQuality::Suspended2 => "sus2",
            ChordQuality::Suspended4 => "sus4",
        };
        let root = self.root.name(self.accidental);
        match (self.quality, self.seventh) {
            (_, Seventh::None) => format!("{} {}", root, quality),
            (ChordQuality::Major, Seventh::Minor) => format!("{} dominant 7", root),
            (ChordQuality::Major, Seventh::Major) => format!("{} major 7", root),
            (_, Seventh::Major) => format!("{} {} major 7", root, quality),
            (_, Seventh::Minor) => format!("{} {} 7", root, quality),
        }
    }

    /// Chord tones as semitone intervals above the root
    pub fn intervals(&self) -> Vec<i32> {
        let mut intervals = match self.quality {
            ChordQuality::Major => vec![0, 4, 7],
            ChordQuality::Minor => vec![0, 3, 7],
            ChordQuality::Diminished => vec![0, 3, 6],
            ChordQuality::Augmented => vec![0, 4, 8],
            ChordQuality::Suspended2 => vec![0, 2, 7],
            ChordQuality::Suspended4 => vec![0, 5, 7],
        };
        match self.seventh {
            Seventh::None => {}
            Seventh::Minor => intervals.push(10),
            Seventh::Major => intervals.push(11),
        }
        intervals
    }

    /// Close-position voicing rooted in the given octave
    pub fn voicing(&self, octave: i32) -> Vec<Note> {
        let root = Note::new(self.root, octave);
        self.intervals().into_iter().map(|i| root.transpose(i)).collect()
    }
}
