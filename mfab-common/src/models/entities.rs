//! Segment sub-entities

use crate::content::{InstrumentType, ProgramType};
use crate::{uuid_utils, Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A segment's binding to a program, sequence binding, voice and/or instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoice {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub program_id: Option<Uuid>,
    pub program_type: Option<ProgramType>,
    pub program_sequence_binding_id: Option<Uuid>,
    pub program_voice_id: Option<Uuid>,
    pub instrument_id: Option<Uuid>,
    pub instrument_type: Option<InstrumentType>,
    /// Semitones applied to everything this choice plays
    pub transpose: i32,
    /// First chain beat governed; `None` means unbounded
    pub delta_in: Option<u64>,
    /// Chain beat after the last governed; `None` means unbounded
    pub delta_out: Option<u64>,
}

impl SegmentChoice {
    /// Choice of a program at a sequence binding (macro, main, rhythm or detail)
    pub fn program(
        segment_id: Uuid,
        program_type: ProgramType,
        program_id: Uuid,
        program_sequence_binding_id: Uuid,
        transpose: i32,
    ) -> Result<Self> {
        let choice = Self {
            id: uuid_utils::generate(),
            segment_id,
            program_id: Some(program_id),
            program_type: Some(program_type),
            program_sequence_binding_id: Some(program_sequence_binding_id),
            program_voice_id: None,
            instrument_id: None,
            instrument_type: None,
            transpose,
            delta_in: None,
            delta_out: None,
        };
        choice.validate()?;
        Ok(choice)
    }

    /// Attach a program voice realized by an instrument
    pub fn with_voice(mut self, voice_id: Uuid, instrument_id: Uuid, instrument_type: InstrumentType) -> Self {
        self.program_voice_id = Some(voice_id);
        self.instrument_id = Some(instrument_id);
        self.instrument_type = Some(instrument_type);
        self
    }

    /// Instrument-only choice, e.g. a one-shot transition
    pub fn instrument(segment_id: Uuid, instrument_id: Uuid, instrument_type: InstrumentType) -> Result<Self> {
        let choice = Self {
            id: uuid_utils::generate(),
            segment_id,
            program_id: None,
            program_type: None,
            program_sequence_binding_id: None,
            program_voice_id: None,
            instrument_id: Some(instrument_id),
            instrument_type: Some(instrument_type),
            transpose: 0,
            delta_in: None,
            delta_out: None,
        };
        choice.validate()?;
        Ok(choice)
    }

    pub fn with_delta(mut self, delta_in: Option<u64>, delta_out: Option<u64>) -> Result<Self> {
        self.delta_in = delta_in;
        self.delta_out = delta_out;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program_id.is_none() && self.instrument_id.is_none() {
            return Err(Error::Validation(
                "Choice requires a program or an instrument".to_string(),
            ));
        }
        if self.program_id.is_some() && self.program_type.is_none() {
            return Err(Error::Validation("Program choice requires a program type".to_string()));
        }
        if matches!(self.program_type, Some(ProgramType::Macro | ProgramType::Main))
            && self.program_sequence_binding_id.is_none()
        {
            return Err(Error::Validation(
                "Macro and Main choices require a sequence binding".to_string(),
            ));
        }
        if let (Some(delta_in), Some(delta_out)) = (self.delta_in, self.delta_out) {
            if delta_out <= delta_in {
                return Err(Error::Validation(format!(
                    "Choice delta range {}..{} is empty",
                    delta_in, delta_out
                )));
            }
        }
        Ok(())
    }

    /// Whether this choice governs the given chain beat
    ///
    /// Chain beats are a segment's `delta` plus the position within it.
    pub fn governs(&self, position: f64) -> bool {
        self.delta_in.map_or(true, |d| position >= d as f64)
            && self.delta_out.map_or(true, |d| position < d as f64)
    }
}

/// A choice realized against a specific pattern (or none, for one-shots)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangement {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub segment_choice_id: Uuid,
    pub program_sequence_pattern_id: Option<Uuid>,
}

impl SegmentChoiceArrangement {
    pub fn new(choice: &SegmentChoice, program_sequence_pattern_id: Option<Uuid>) -> Self {
        Self {
            id: uuid_utils::generate(),
            segment_id: choice.segment_id,
            segment_choice_id: choice.id,
            program_sequence_pattern_id,
        }
    }
}

/// One atomic, precisely-timed audio event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangementPick {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub segment_choice_arrangement_id: Uuid,
    pub program_sequence_pattern_event_id: Option<Uuid>,
    pub instrument_audio_id: Uuid,
    /// Segment-relative start in microseconds
    pub start_micros: u64,
    pub length_micros: u64,
    pub amplitude: f64,
    /// Comma-separated note names, or the event name for unpitched audio
    pub tones: String,
    pub event: String,
}

impl SegmentChoiceArrangementPick {
    pub fn validate(&self) -> Result<()> {
        if !self.amplitude.is_finite() || self.amplitude < 0.0 {
            return Err(Error::Validation(format!(
                "Pick amplitude {} is invalid",
                self.amplitude
            )));
        }
        Ok(())
    }

    pub fn end_micros(&self) -> u64 {
        self.start_micros + self.length_micros
    }
}

/// A chord at a beat position within the segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChord {
    pub id: Uuid,
    pub segment_id: Uuid,
    /// Position in beats
    pub position: f64,
    pub name: String,
}

impl SegmentChord {
    pub fn new(segment_id: Uuid, position: f64, name: &str) -> Result<Self> {
        let chord = Self {
            id: uuid_utils::generate(),
            segment_id,
            position,
            name: name.trim().to_string(),
        };
        chord.validate()?;
        Ok(chord)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.position.is_finite() || self.position < 0.0 {
            return Err(Error::Validation(format!(
                "Chord position {} is invalid",
                self.position
            )));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("Chord name is required".to_string()));
        }
        Ok(())
    }
}

/// Notes voicing a segment chord for one instrument type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChordVoicing {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub segment_chord_id: Uuid,
    pub instrument_type: InstrumentType,
    pub notes: Vec<String>,
}

impl SegmentChordVoicing {
    pub fn new(chord: &SegmentChord, instrument_type: InstrumentType, notes: Vec<String>) -> Result<Self> {
        if notes.is_empty() {
            return Err(Error::Validation(format!(
                "Voicing of chord {:?} requires notes",
                chord.name
            )));
        }
        Ok(Self {
            id: uuid_utils::generate(),
            segment_id: chord.segment_id,
            segment_chord_id: chord.id,
            instrument_type,
            notes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeme {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub name: String,
}

impl SegmentMeme {
    /// Meme names are trimmed and upper-cased
    pub fn new(segment_id: Uuid, name: &str) -> Result<Self> {
        let name = normalize_meme(name);
        if name.is_empty() {
            return Err(Error::Validation("Meme name is required".to_string()));
        }
        Ok(Self {
            id: uuid_utils::generate(),
            segment_id,
            name,
        })
    }
}

/// Canonical form of a meme name
pub fn normalize_meme(name: &str) -> String {
    name.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

/// Diagnostic output attached to a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMessage {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub severity: MessageSeverity,
    pub body: String,
}

impl SegmentMessage {
    pub fn new(segment_id: Uuid, severity: MessageSeverity, body: impl Into<String>) -> Self {
        Self {
            id: uuid_utils::generate(),
            segment_id,
            severity,
            body: body.into(),
        }
    }
}

/// Keyed metadata persisted with a segment (e.g. sticky buns)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub key: String,
    pub value: String,
}

impl SegmentMeta {
    pub fn new(segment_id: Uuid, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: uuid_utils::generate(),
            segment_id,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Choice,
    Arrangement,
    Pick,
    Chord,
    ChordVoicing,
    Meme,
    Message,
    Meta,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Choice => "Choice",
            EntityKind::Arrangement => "Arrangement",
            EntityKind::Pick => "Pick",
            EntityKind::Chord => "Chord",
            EntityKind::ChordVoicing => "ChordVoicing",
            EntityKind::Meme => "Meme",
            EntityKind::Message => "Message",
            EntityKind::Meta => "Meta",
        }
    }
}

/// Any entity owned by a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SegmentEntity {
    Choice(SegmentChoice),
    Arrangement(SegmentChoiceArrangement),
    Pick(SegmentChoiceArrangementPick),
    Chord(SegmentChord),
    ChordVoicing(SegmentChordVoicing),
    Meme(SegmentMeme),
    Message(SegmentMessage),
    Meta(SegmentMeta),
}

impl SegmentEntity {
    pub fn id(&self) -> Uuid {
        match self {
            SegmentEntity::Choice(e) => e.id,
            SegmentEntity::Arrangement(e) => e.id,
            SegmentEntity::Pick(e) => e.id,
            SegmentEntity::Chord(e) => e.id,
            SegmentEntity::ChordVoicing(e) => e.id,
            SegmentEntity::Meme(e) => e.id,
            SegmentEntity::Message(e) => e.id,
            SegmentEntity::Meta(e) => e.id,
        }
    }

    pub fn segment_id(&self) -> Uuid {
        match self {
            SegmentEntity::Choice(e) => e.segment_id,
            SegmentEntity::Arrangement(e) => e.segment_id,
            SegmentEntity::Pick(e) => e.segment_id,
            SegmentEntity::Chord(e) => e.segment_id,
            SegmentEntity::ChordVoicing(e) => e.segment_id,
            SegmentEntity::Meme(e) => e.segment_id,
            SegmentEntity::Message(e) => e.segment_id,
            SegmentEntity::Meta(e) => e.segment_id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SegmentEntity::Choice(_) => EntityKind::Choice,
            SegmentEntity::Arrangement(_) => EntityKind::Arrangement,
            SegmentEntity::Pick(_) => EntityKind::Pick,
            SegmentEntity::Chord(_) => EntityKind::Chord,
            SegmentEntity::ChordVoicing(_) => EntityKind::ChordVoicing,
            SegmentEntity::Meme(_) => EntityKind::Meme,
            SegmentEntity::Message(_) => EntityKind::Message,
            SegmentEntity::Meta(_) => EntityKind::Meta,
        }
    }

    /// Reject malformed entities before they reach a store
    pub fn validate(&self) -> Result<()> {
        if self.segment_id().is_nil() {
            return Err(Error::Validation(format!(
                "{} requires a segment id",
                self.kind().as_str()
            )));
        }
        match self {
            SegmentEntity::Choice(e) => e.validate(),
            SegmentEntity::Pick(e) => e.validate(),
            SegmentEntity::Chord(e) => e.validate(),
            SegmentEntity::Meme(e) if e.name.is_empty() => {
                Err(Error::Validation("Meme name is required".to_string()))
            }
            SegmentEntity::Meta(e) if e.key.is_empty() => {
                Err(Error::Validation("Meta key is required".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Typed access to one variant of [`SegmentEntity`]
pub trait SegmentScoped: Clone + Sized {
    const KIND: EntityKind;

    fn from_entity(entity: &SegmentEntity) -> Option<&Self>;

    fn into_entity(self) -> SegmentEntity;
}

macro_rules! segment_scoped {
    ($ty:ty, $variant:ident) => {
        impl SegmentScoped for $ty {
            const KIND: EntityKind = EntityKind::$variant;

            fn from_entity(entity: &SegmentEntity) -> Option<&Self> {
                match entity {
                    SegmentEntity::$variant(e) => Some(e),
                    _ => None,
                }
            }

            fn into_entity(self) -> SegmentEntity {
                SegmentEntity::$variant(self)
            }
        }
    };
}

segment_scoped!(SegmentChoice, Choice);
segment_scoped!(SegmentChoiceArrangement, Arrangement);
segment_scoped!(SegmentChoiceArrangementPick, Pick);
segment_scoped!(SegmentChord, Chord);
segment_scoped!(SegmentChordVoicing, ChordVoicing);
segment_scoped!(SegmentMeme, Meme);
segment_scoped!(SegmentMessage, Message);
segment_scoped!(SegmentMeta, Meta);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_requires_program_or_instrument() {
        let mut choice = SegmentChoice::instrument(Uuid::new_v4(), Uuid::new_v4(), InstrumentType::Transition).unwrap();
        choice.instrument_id = None;
        assert!(choice.validate().is_err());
    }

    #[test]
    fn test_macro_choice_requires_binding() {
        let mut choice = SegmentChoice::program(
            Uuid::new_v4(),
            ProgramType::Macro,
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
        )
        .unwrap();
        choice.program_sequence_binding_id = None;
        assert!(SegmentEntity::Choice(choice).validate().is_err());
    }

    #[test]
    fn test_choice_delta_range() {
        let choice = SegmentChoice::instrument(Uuid::new_v4(), Uuid::new_v4(), InstrumentType::Pad).unwrap();
        assert!(choice.governs(1000.0));
        let bounded = choice.clone().with_delta(Some(4), Some(8)).unwrap();
        assert!(!bounded.governs(3.5));
        assert!(bounded.governs(4.0));
        assert!(!bounded.governs(8.0));
        assert!(choice.with_delta(Some(8), Some(8)).is_err());
    }

    #[test]
    fn test_meme_normalized() {
        let meme = SegmentMeme::new(Uuid::new_v4(), "  cozy ").unwrap();
        assert_eq!(meme.name, "COZY");
        assert!(SegmentMeme::new(Uuid::new_v4(), " ").is_err());
    }

    #[test]
    fn test_chord_validation() {
        assert!(SegmentChord::new(Uuid::new_v4(), -1.0, "C").is_err());
        assert!(SegmentChord::new(Uuid::new_v4(), 0.0, "").is_err());
        assert!(SegmentChord::new(Uuid::new_v4(), 2.0, "Dm").is_ok());
    }

    #[test]
    fn test_scoped_roundtrip_through_entity() {
        let meta = SegmentMeta::new(Uuid::new_v4(), "k", "v");
        let entity = meta.clone().into_entity();
        assert_eq!(entity.kind(), EntityKind::Meta);
        assert_eq!(SegmentMeta::from_entity(&entity), Some(&meta));
        assert!(SegmentChord::from_entity(&entity).is_none());
    }

    #[test]
    fn test_entity_serde_tagged() {
        let meme = SegmentMeme::new(Uuid::new_v4(), "dark").unwrap().into_entity();
        let json = serde_json::to_string(&meme).unwrap();
        assert!(json.contains("\"kind\":\"Meme\""));
        let back: SegmentEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meme);
    }
}
