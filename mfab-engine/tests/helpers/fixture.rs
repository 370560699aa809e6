//! Content fixture
//!
//! Macro and Main programs have two sequence bindings each, so a chain walks
//! Initial → Continue → NextMain → Continue → NextMacro. The Rhythm program has
//! two alternate patterns for its drum voice; the Detail program has one pad
//! pattern whose event is sticky and takes its tones from the chord voicing.
//! Every program and every instrument but the transition sweep carries memes.

use mfab_common::content::{
    ContentSnapshot, Instrument, InstrumentAudio, InstrumentType, Program, ProgramSequence,
    ProgramSequenceBinding, ProgramSequenceChord, ProgramSequencePattern,
    ProgramSequencePatternEvent, ProgramType, ProgramVoice, ProgramVoiceTrack,
};
use uuid::Uuid;

/// Snapshot plus the ids tests need to look things up
pub struct Library {
    pub content: ContentSnapshot,
    pub macro_program: Uuid,
    pub main_program: Uuid,
    pub rhythm_program: Uuid,
    pub detail_program: Uuid,
    pub pattern_a: Uuid,
    pub pattern_b: Uuid,
    pub sticky_event: Uuid,
    pub drum_kit: Uuid,
    pub pad: Uuid,
    pub sweep: Uuid,
}

pub fn library() -> Library {
    let mut content = ContentSnapshot::default();

    // Macro: two 16-beat sequences at offsets 0 and 1
    let macro_program = Program::new(ProgramType::Macro, "Sunrise", "C major", 120.0, 0.6).with_memes(&["bright"]);
    let macro_a = ProgramSequence::new(&macro_program, "Dawn", 16);
    let macro_b = ProgramSequence::new(&macro_program, "Morning", 16);
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&macro_a, 0));
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&macro_b, 1));

    // Main: verse {0:C, 4:F, 8:G}, chorus {0:Am, 8:G}
    let main_program = Program::new(ProgramType::Main, "Walking", "C major", 120.0, 0.4).with_memes(&["bright"]);
    let verse = ProgramSequence::new(&main_program, "Verse", 16);
    let chorus = ProgramSequence::new(&main_program, "Chorus", 16);
    for (position, name) in [(0.0, "C"), (4.0, "F"), (8.0, "G")] {
        content.program_sequence_chords.push(ProgramSequenceChord::new(&verse, position, name));
    }
    for (position, name) in [(0.0, "Am"), (8.0, "G")] {
        content.program_sequence_chords.push(ProgramSequenceChord::new(&chorus, position, name));
    }
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&verse, 0));
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&chorus, 1));

    // Rhythm: one drum voice, alternates "Four on the Floor" and "Backbeat"
    let rhythm_program = Program::new(ProgramType::Rhythm, "Steady", "C major", 120.0, 0.5).with_memes(&["earthy"]);
    let drums = ProgramVoice::new(&rhythm_program, "Drums", InstrumentType::Drum);
    let kick = ProgramVoiceTrack::new(&drums, "KICK");
    let snare = ProgramVoiceTrack::new(&drums, "SNARE");
    let groove = ProgramSequence::new(&rhythm_program, "Groove", 4);
    let pattern_a = ProgramSequencePattern::new(&groove, &drums, "Four on the Floor", 4);
    let pattern_b = ProgramSequencePattern::new(&groove, &drums, "Backbeat", 4);
    for beat in 0..4 {
        content.program_sequence_pattern_events.push(ProgramSequencePatternEvent::new(
            &pattern_a, &kick, beat as f64, 0.5, 1.0, &[],
        ));
    }
    for (position, track) in [(0.0, &kick), (1.0, &snare), (2.0, &kick), (3.0, &snare)] {
        content.program_sequence_pattern_events.push(ProgramSequencePatternEvent::new(
            &pattern_b, track, position, 0.5, 0.9, &[],
        ));
    }
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&groove, 0));

    // Detail: one sticky three-note pad event per four beats
    let detail_program = Program::new(ProgramType::Detail, "Wash", "C major", 120.0, 0.3).with_memes(&["airy"]);
    let pads = ProgramVoice::new(&detail_program, "Pads", InstrumentType::Pad);
    let pad_track = ProgramVoiceTrack::new(&pads, "PAD");
    let wash = ProgramSequence::new(&detail_program, "Wash", 4);
    let swell = ProgramSequencePattern::new(&wash, &pads, "Swell", 4);
    let mut sticky = ProgramSequencePatternEvent::new(&swell, &pad_track, 0.0, 4.0, 0.7, &["X", "X", "X"]);
    sticky.sticky = true;
    let sticky_event = sticky.id;
    content.program_sequence_pattern_events.push(sticky);
    content.program_sequence_bindings.push(ProgramSequenceBinding::new(&wash, 0));

    // Instruments
    let drum_kit = Instrument::new(InstrumentType::Drum, "Acoustic Kit").with_memes(&["wooden"]);
    content.instrument_audios.push(InstrumentAudio::new(&drum_kit, "KICK", &[], 0.4));
    content.instrument_audios.push(InstrumentAudio::new(&drum_kit, "SNARE", &[], 0.3));
    let pad = Instrument::new(InstrumentType::Pad, "Warm Pad").with_memes(&["warm"]);
    for note in ["C4", "D4", "E4", "F4", "G4", "A4", "B4", "C5"] {
        content.instrument_audios.push(InstrumentAudio::new(&pad, "PAD", &[note], 6.0));
    }
    let sweep = Instrument::new(InstrumentType::Transition, "Noise Sweep");
    content.instrument_audios.push(InstrumentAudio::new(&sweep, "SWEEP", &[], 2.0));

    let library = Library {
        content: ContentSnapshot::default(),
        macro_program: macro_program.id,
        main_program: main_program.id,
        rhythm_program: rhythm_program.id,
        detail_program: detail_program.id,
        pattern_a: pattern_a.id,
        pattern_b: pattern_b.id,
        sticky_event,
        drum_kit: drum_kit.id,
        pad: pad.id,
        sweep: sweep.id,
    };

    content.programs = vec![macro_program, main_program, rhythm_program, detail_program];
    content.program_sequences = vec![macro_a, macro_b, verse, chorus, groove, wash];
    content.program_voices = vec![drums, pads];
    content.program_voice_tracks = vec![kick, snare, pad_track];
    content.program_sequence_patterns = vec![pattern_a, pattern_b, swell];
    content.instruments = vec![drum_kit, pad, sweep];
    content.validate().expect("fixture content is valid");

    Library { content, ..library }
}
