//! Content snapshot: read-only view of the programs and instruments bound to a chain
//!
//! A snapshot is resolved once per chain (see the engine's ingest cycle) and
//! shared immutably by every segment fabricated from it. Memes are embedded on
//! the entities that carry them rather than stored as separate rows.

use crate::models::entities::normalize_meme;
use crate::{uuid_utils, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Musical role of a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramType {
    Macro,
    Main,
    Rhythm,
    Detail,
}

impl ProgramType {
    /// At most one choice of this type per segment
    pub fn is_singleton(self) -> bool {
        matches!(self, ProgramType::Macro | ProgramType::Main)
    }
}

/// Role of an instrument (and of the program voice it realizes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentType {
    Drum,
    Bass,
    Pad,
    Stab,
    Lead,
    Transition,
}

impl InstrumentType {
    /// Unpitched; audio is selected by event name only
    pub fn is_percussive(self) -> bool {
        matches!(self, InstrumentType::Drum | InstrumentType::Transition)
    }

    /// Octave in which chord voicings are derived for this type
    pub fn voicing_octave(self) -> i32 {
        match self {
            InstrumentType::Bass => 2,
            InstrumentType::Lead => 5,
            _ => 4,
        }
    }
}

/// Entities that carry descriptive meme tags
pub trait HasMemes {
    fn memes(&self) -> &[String];
}

macro_rules! has_memes {
    ($($ty:ty),*) => {
        $(impl HasMemes for $ty {
            fn memes(&self) -> &[String] {
                &self.memes
            }
        })*
    };
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub program_type: ProgramType,
    pub key: String,
    pub tempo: f64,
    pub density: f64,
    /// Whether choices of this program may be transposed
    #[serde(default = "default_true")]
    pub do_transpose: bool,
    /// Explicitly bound to the chain, strongly preferred by the score picker
    #[serde(default)]
    pub directly_bound: bool,
    #[serde(default)]
    pub memes: Vec<String>,
}

impl Program {
    pub fn new(program_type: ProgramType, name: &str, key: &str, tempo: f64, density: f64) -> Self {
        Self {
            id: uuid_utils::generate(),
            name: name.to_string(),
            program_type,
            key: key.to_string(),
            tempo,
            density,
            do_transpose: true,
            directly_bound: false,
            memes: Vec::new(),
        }
    }

    pub fn with_memes(mut self, memes: &[&str]) -> Self {
        self.memes = memes.iter().map(|m| m.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequence {
    pub id: Uuid,
    pub program_id: Uuid,
    pub name: String,
    /// Falls back to the program's key
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub tempo: Option<f64>,
    #[serde(default)]
    pub density: Option<f64>,
    /// Length in beats
    pub total: u32,
}

impl ProgramSequence {
    pub fn new(program: &Program, name: &str, total: u32) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_id: program.id,
            name: name.to_string(),
            key: None,
            tempo: None,
            density: None,
            total,
        }
    }
}

/// Places a sequence at an offset within its program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceBinding {
    pub id: Uuid,
    pub program_id: Uuid,
    pub program_sequence_id: Uuid,
    pub offset: u32,
    #[serde(default)]
    pub memes: Vec<String>,
}

impl ProgramSequenceBinding {
    pub fn new(sequence: &ProgramSequence, offset: u32) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_id: sequence.program_id,
            program_sequence_id: sequence.id,
            offset,
            memes: Vec::new(),
        }
    }

    pub fn with_memes(mut self, memes: &[&str]) -> Self {
        self.memes = memes.iter().map(|m| m.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceChord {
    pub id: Uuid,
    pub program_sequence_id: Uuid,
    pub position: f64,
    pub name: String,
}

impl ProgramSequenceChord {
    pub fn new(sequence: &ProgramSequence, position: f64, name: &str) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_sequence_id: sequence.id,
            position,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceChordVoicing {
    pub id: Uuid,
    pub program_sequence_chord_id: Uuid,
    pub instrument_type: InstrumentType,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramVoice {
    pub id: Uuid,
    pub program_id: Uuid,
    pub name: String,
    pub instrument_type: InstrumentType,
}

impl ProgramVoice {
    pub fn new(program: &Program, name: &str, instrument_type: InstrumentType) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_id: program.id,
            name: name.to_string(),
            instrument_type,
        }
    }
}

/// Named lane within a voice; events on a track play audio of the same event name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramVoiceTrack {
    pub id: Uuid,
    pub program_voice_id: Uuid,
    pub name: String,
}

impl ProgramVoiceTrack {
    pub fn new(voice: &ProgramVoice, name: &str) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_voice_id: voice.id,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequencePattern {
    pub id: Uuid,
    pub program_sequence_id: Uuid,
    pub program_voice_id: Uuid,
    pub name: String,
    /// Length in beats; repeated by dub to fill a longer segment
    pub total: u32,
}

impl ProgramSequencePattern {
    pub fn new(sequence: &ProgramSequence, voice: &ProgramVoice, name: &str, total: u32) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_sequence_id: sequence.id,
            program_voice_id: voice.id,
            name: name.to_string(),
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequencePatternEvent {
    pub id: Uuid,
    pub program_sequence_pattern_id: Uuid,
    pub program_voice_track_id: Uuid,
    /// Beats from the start of the pattern
    pub position: f64,
    /// Beats
    pub duration: f64,
    pub velocity: f64,
    /// Note names; `X` takes its pitch from the chord voicing
    #[serde(default)]
    pub tones: Vec<String>,
    /// Repeat the same randomly-chosen notes on every repetition
    #[serde(default)]
    pub sticky: bool,
}

impl ProgramSequencePatternEvent {
    pub fn new(
        pattern: &ProgramSequencePattern,
        track: &ProgramVoiceTrack,
        position: f64,
        duration: f64,
        velocity: f64,
        tones: &[&str],
    ) -> Self {
        Self {
            id: uuid_utils::generate(),
            program_sequence_pattern_id: pattern.id,
            program_voice_track_id: track.id,
            position,
            duration,
            velocity,
            tones: tones.iter().map(|t| t.to_string()).collect(),
            sticky: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: Uuid,
    pub name: String,
    pub instrument_type: InstrumentType,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub memes: Vec<String>,
}

impl Instrument {
    pub fn new(instrument_type: InstrumentType, name: &str) -> Self {
        Self {
            id: uuid_utils::generate(),
            name: name.to_string(),
            instrument_type,
            volume: 1.0,
            memes: Vec::new(),
        }
    }

    pub fn with_memes(mut self, memes: &[&str]) -> Self {
        self.memes = memes.iter().map(|m| m.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentAudio {
    pub id: Uuid,
    pub instrument_id: Uuid,
    pub name: String,
    /// Event (track) name this audio answers to
    pub event: String,
    /// Note names for pitched audio
    #[serde(default)]
    pub tones: Vec<String>,
    pub waveform_key: String,
    pub length_seconds: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
}

impl InstrumentAudio {
    pub fn new(instrument: &Instrument, event: &str, tones: &[&str], length_seconds: f64) -> Self {
        let name = if tones.is_empty() {
            event.to_string()
        } else {
            format!("{} {}", event, tones.join(","))
        };
        Self {
            id: uuid_utils::generate(),
            instrument_id: instrument.id,
            waveform_key: format!("{}-{}.wav", instrument.name, name).replace(' ', "_"),
            name,
            event: event.to_string(),
            tones: tones.iter().map(|t| t.to_string()).collect(),
            length_seconds,
            volume: 1.0,
        }
    }
}

has_memes!(Program, ProgramSequenceBinding, Instrument);

/// Immutable, pre-resolved content for one chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSnapshot {
    pub programs: Vec<Program>,
    pub program_sequences: Vec<ProgramSequence>,
    pub program_sequence_bindings: Vec<ProgramSequenceBinding>,
    pub program_sequence_chords: Vec<ProgramSequenceChord>,
    pub program_sequence_chord_voicings: Vec<ProgramSequenceChordVoicing>,
    pub program_voices: Vec<ProgramVoice>,
    pub program_voice_tracks: Vec<ProgramVoiceTrack>,
    pub program_sequence_patterns: Vec<ProgramSequencePattern>,
    pub program_sequence_pattern_events: Vec<ProgramSequencePatternEvent>,
    pub instruments: Vec<Instrument>,
    pub instrument_audios: Vec<InstrumentAudio>,
}

impl ContentSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check referential integrity between content entities
    pub fn validate(&self) -> Result<()> {
        let program_ids: HashSet<Uuid> = self.programs.iter().map(|p| p.id).collect();
        let sequence_ids: HashSet<Uuid> = self.program_sequences.iter().map(|s| s.id).collect();
        let voice_ids: HashSet<Uuid> = self.program_voices.iter().map(|v| v.id).collect();
        let track_ids: HashSet<Uuid> = self.program_voice_tracks.iter().map(|t| t.id).collect();
        let pattern_ids: HashSet<Uuid> = self.program_sequence_patterns.iter().map(|p| p.id).collect();
        let chord_ids: HashSet<Uuid> = self.program_sequence_chords.iter().map(|c| c.id).collect();
        let instrument_ids: HashSet<Uuid> = self.instruments.iter().map(|i| i.id).collect();

        let missing = |what: &str, id: Uuid, owner: &str| {
            Err(Error::Validation(format!("{} {} references missing {}", what, id, owner)))
        };

        for program in &self.programs {
            if !program.tempo.is_finite() || program.tempo <= 0.0 {
                return Err(Error::Validation(format!(
                    "Program {:?} has invalid tempo {}",
                    program.name, program.tempo
                )));
            }
        }
        for sequence in &self.program_sequences {
            if !program_ids.contains(&sequence.program_id) {
                return missing("Sequence", sequence.id, "program");
            }
            if sequence.total == 0 {
                return Err(Error::Validation(format!(
                    "Sequence {:?} has zero total beats",
                    sequence.name
                )));
            }
        }
        for binding in &self.program_sequence_bindings {
            if !sequence_ids.contains(&binding.program_sequence_id) {
                return missing("Sequence binding", binding.id, "sequence");
            }
        }
        for chord in &self.program_sequence_chords {
            if !sequence_ids.contains(&chord.program_sequence_id) {
                return missing("Chord", chord.id, "sequence");
            }
        }
        for voicing in &self.program_sequence_chord_voicings {
            if !chord_ids.contains(&voicing.program_sequence_chord_id) {
                return missing("Chord voicing", voicing.id, "chord");
            }
        }
        for voice in &self.program_voices {
            if !program_ids.contains(&voice.program_id) {
                return missing("Voice", voice.id, "program");
            }
        }
        for track in &self.program_voice_tracks {
            if !voice_ids.contains(&track.program_voice_id) {
                return missing("Track", track.id, "voice");
            }
        }
        for pattern in &self.program_sequence_patterns {
            if !sequence_ids.contains(&pattern.program_sequence_id) {
                return missing("Pattern", pattern.id, "sequence");
            }
            if !voice_ids.contains(&pattern.program_voice_id) {
                return missing("Pattern", pattern.id, "voice");
            }
        }
        for event in &self.program_sequence_pattern_events {
            if !pattern_ids.contains(&event.program_sequence_pattern_id) {
                return missing("Event", event.id, "pattern");
            }
            if !track_ids.contains(&event.program_voice_track_id) {
                return missing("Event", event.id, "track");
            }
        }
        for audio in &self.instrument_audios {
            if !instrument_ids.contains(&audio.instrument_id) {
                return missing("Audio", audio.id, "instrument");
            }
        }
        Ok(())
    }

    pub fn programs_of_type(&self, program_type: ProgramType) -> Vec<&Program> {
        self.programs
            .iter()
            .filter(|p| p.program_type == program_type)
            .collect()
    }

    pub fn instruments_of_type(&self, instrument_type: InstrumentType) -> Vec<&Instrument> {
        self.instruments
            .iter()
            .filter(|i| i.instrument_type == instrument_type)
            .collect()
    }

    pub fn program(&self, id: Uuid) -> Option<&Program> {
        self.programs.iter().find(|p| p.id == id)
    }

    pub fn sequence(&self, id: Uuid) -> Option<&ProgramSequence> {
        self.program_sequences.iter().find(|s| s.id == id)
    }

    pub fn binding(&self, id: Uuid) -> Option<&ProgramSequenceBinding> {
        self.program_sequence_bindings.iter().find(|b| b.id == id)
    }

    pub fn voice(&self, id: Uuid) -> Option<&ProgramVoice> {
        self.program_voices.iter().find(|v| v.id == id)
    }

    pub fn track(&self, id: Uuid) -> Option<&ProgramVoiceTrack> {
        self.program_voice_tracks.iter().find(|t| t.id == id)
    }

    pub fn pattern(&self, id: Uuid) -> Option<&ProgramSequencePattern> {
        self.program_sequence_patterns.iter().find(|p| p.id == id)
    }

    pub fn instrument(&self, id: Uuid) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn audio(&self, id: Uuid) -> Option<&InstrumentAudio> {
        self.instrument_audios.iter().find(|a| a.id == id)
    }

    /// Sequence placed by a binding
    pub fn sequence_of_binding(&self, binding: &ProgramSequenceBinding) -> Option<&ProgramSequence> {
        self.sequence(binding.program_sequence_id)
    }

    /// Effective key of a sequence, falling back to its program
    pub fn sequence_key(&self, sequence: &ProgramSequence) -> String {
        match &sequence.key {
            Some(key) if !key.trim().is_empty() => key.clone(),
            _ => self
                .program(sequence.program_id)
                .map(|p| p.key.clone())
                .unwrap_or_default(),
        }
    }

    pub fn sequence_tempo(&self, sequence: &ProgramSequence) -> f64 {
        sequence
            .tempo
            .or_else(|| self.program(sequence.program_id).map(|p| p.tempo))
            .unwrap_or(0.0)
    }

    pub fn sequence_density(&self, sequence: &ProgramSequence) -> f64 {
        sequence
            .density
            .or_else(|| self.program(sequence.program_id).map(|p| p.density))
            .unwrap_or(0.0)
    }

    /// All bindings of a program ordered by offset
    pub fn bindings_of_program(&self, program_id: Uuid) -> Vec<&ProgramSequenceBinding> {
        let mut bindings: Vec<_> = self
            .program_sequence_bindings
            .iter()
            .filter(|b| b.program_id == program_id)
            .collect();
        bindings.sort_by_key(|b| b.offset);
        bindings
    }

    /// Bindings of a program at exactly the given offset
    pub fn bindings_at_offset(&self, program_id: Uuid, offset: u32) -> Vec<&ProgramSequenceBinding> {
        self.program_sequence_bindings
            .iter()
            .filter(|b| b.program_id == program_id && b.offset == offset)
            .collect()
    }

    /// Distinct binding offsets of a program, ascending
    pub fn available_offsets(&self, program_id: Uuid) -> Vec<u32> {
        self.program_sequence_bindings
            .iter()
            .filter(|b| b.program_id == program_id)
            .map(|b| b.offset)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Smallest binding offset of the program strictly after `offset`
    pub fn next_offset(&self, program_id: Uuid, offset: u32) -> Option<u32> {
        self.available_offsets(program_id)
            .into_iter()
            .find(|o| *o > offset)
    }

    /// Chords of a sequence ordered by position
    pub fn chords(&self, sequence_id: Uuid) -> Vec<&ProgramSequenceChord> {
        let mut chords: Vec<_> = self
            .program_sequence_chords
            .iter()
            .filter(|c| c.program_sequence_id == sequence_id)
            .collect();
        chords.sort_by(|a, b| a.position.total_cmp(&b.position));
        chords
    }

    pub fn voicings(&self, chord_id: Uuid) -> Vec<&ProgramSequenceChordVoicing> {
        self.program_sequence_chord_voicings
            .iter()
            .filter(|v| v.program_sequence_chord_id == chord_id)
            .collect()
    }

    pub fn voices(&self, program_id: Uuid) -> Vec<&ProgramVoice> {
        self.program_voices
            .iter()
            .filter(|v| v.program_id == program_id)
            .collect()
    }

    /// Patterns of a sequence for one voice (alternates share a sequence and voice)
    pub fn patterns(&self, sequence_id: Uuid, voice_id: Uuid) -> Vec<&ProgramSequencePattern> {
        self.program_sequence_patterns
            .iter()
            .filter(|p| p.program_sequence_id == sequence_id && p.program_voice_id == voice_id)
            .collect()
    }

    /// Events of a pattern ordered by position
    pub fn events(&self, pattern_id: Uuid) -> Vec<&ProgramSequencePatternEvent> {
        let mut events: Vec<_> = self
            .program_sequence_pattern_events
            .iter()
            .filter(|e| e.program_sequence_pattern_id == pattern_id)
            .collect();
        events.sort_by(|a, b| a.position.total_cmp(&b.position));
        events
    }

    pub fn audios(&self, instrument_id: Uuid) -> Vec<&InstrumentAudio> {
        self.instrument_audios
            .iter()
            .filter(|a| a.instrument_id == instrument_id)
            .collect()
    }

    /// Audios of an instrument answering to an event name (case-insensitive)
    pub fn audios_for_event(&self, instrument_id: Uuid, event: &str) -> Vec<&InstrumentAudio> {
        self.audios(instrument_id)
            .into_iter()
            .filter(|a| a.event.eq_ignore_ascii_case(event))
            .collect()
    }

    /// Normalized memes of any meme-bearing entity
    pub fn memes<E: HasMemes>(&self, entity: &E) -> Vec<String> {
        let mut seen = HashSet::new();
        entity
            .memes()
            .iter()
            .map(|m| normalize_meme(m))
            .filter(|m| !m.is_empty() && seen.insert(m.clone()))
            .collect()
    }

    /// Program memes plus the memes of one of its bindings
    pub fn binding_memes(&self, binding: &ProgramSequenceBinding) -> Vec<String> {
        let mut memes = self
            .program(binding.program_id)
            .map(|p| self.memes(p))
            .unwrap_or_default();
        for meme in self.memes(binding) {
            if !memes.contains(&meme) {
                memes.push(meme);
            }
        }
        memes
    }
}
