//! Macro and Main phases: the segment's overall form, key, tempo and chords

use super::{binding_at, choose_program, first_binding, transpose_between, CraftPhase};
use crate::fabricator::Fabricator;
use crate::meme_isometry::MemeIsometry;
use crate::{Error, Result};
use mfab_common::content::{ContentSnapshot, Program, ProgramSequence, ProgramSequenceBinding, ProgramType};
use mfab_common::models::{SegmentChoice, SegmentChord, SegmentChordVoicing, SegmentType};
use mfab_common::music::{Chord, Key};
use mfab_common::time;
use std::sync::Arc;
use tracing::debug;

pub struct MacroCraft;

impl CraftPhase for MacroCraft {
    fn name(&self) -> &'static str {
        "Macro"
    }

    fn do_work(&self, fab: &mut Fabricator) -> Result<()> {
        if fab.choice_of_type(ProgramType::Macro).is_some() {
            return Ok(());
        }
        let content = Arc::clone(fab.content());
        let segment_type = fab.segment().segment_type;
        let previous = fab.previous_choice(ProgramType::Macro).cloned();

        let continued = match (segment_type, &previous) {
            (SegmentType::Continue | SegmentType::NextMain, Some(prev)) => {
                continue_macro(fab, &content, prev, segment_type == SegmentType::NextMain)
            }
            _ => None,
        };

        let (program, binding, transpose) = match continued {
            Some(found) => found,
            None if segment_type == SegmentType::Initial => {
                let program = choose_program(fab, &content, ProgramType::Macro, None, &MemeIsometry::none())
                    .ok_or_else(|| Error::Ingest("no Macro program available".to_string()))?;
                let binding = first_binding(fab, &content, program.id)
                    .ok_or_else(|| Error::Ingest(format!("Macro program {} has no sequence bindings", program.name)))?;
                (program, binding, 0)
            }
            None => {
                let isometry = fab.isometry_of_next_macro_binding();
                let avoid = previous.as_ref().and_then(|c| c.program_id);
                let program = choose_program(fab, &content, ProgramType::Macro, avoid, &isometry)
                    .ok_or_else(|| Error::Ingest("no eligible Macro program".to_string()))?;
                let binding = first_binding(fab, &content, program.id)
                    .ok_or_else(|| Error::Ingest(format!("Macro program {} has no sequence bindings", program.name)))?;
                let sequence = sequence_of(&content, &binding)?;
                let previous_key = fab.previous_segment().map(|s| s.key.clone()).unwrap_or_default();
                let transpose = transpose_between(&program, &content.sequence_key(sequence), &previous_key, 0)?;
                (program, binding, transpose)
            }
        };

        let choice = SegmentChoice::program(
            fab.segment().id,
            ProgramType::Macro,
            program.id,
            binding.id,
            transpose,
        )?;
        fab.put(choice)?;
        fab.put_report(
            "macro",
            format!("{} @{} transpose {}", program.name, binding.offset, transpose),
        );
        debug!(
            "{} segment {}: macro {} at offset {}",
            fab.chain().ident(),
            fab.segment().offset,
            program.name,
            binding.offset
        );
        Ok(())
    }
}

/// Same macro program as last segment: same binding on Continue, the next one on NextMain
fn continue_macro(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    previous: &SegmentChoice,
    advance: bool,
) -> Option<(Program, ProgramSequenceBinding, i32)> {
    let program = content.program(previous.program_id?)?.clone();
    let previous_binding = content.binding(previous.program_sequence_binding_id?)?.clone();
    let binding = if advance {
        let offset = content.next_offset(program.id, previous_binding.offset)?;
        binding_at(fab, content, program.id, offset)?
    } else {
        previous_binding
    };
    Some((program, binding, previous.transpose))
}

fn sequence_of<'a>(content: &'a ContentSnapshot, binding: &ProgramSequenceBinding) -> Result<&'a ProgramSequence> {
    content
        .sequence_of_binding(binding)
        .ok_or_else(|| Error::Ingest(format!("sequence {} not found", binding.program_sequence_id)))
}

pub struct MainCraft;

impl CraftPhase for MainCraft {
    fn name(&self) -> &'static str {
        "Main"
    }

    fn do_work(&self, fab: &mut Fabricator) -> Result<()> {
        let content = Arc::clone(fab.content());
        let macro_choice = fab
            .choice_of_type(ProgramType::Macro)
            .ok_or_else(|| Error::Craft("Main phase requires a Macro choice".to_string()))?;
        let macro_binding = macro_choice
            .program_sequence_binding_id
            .and_then(|id| content.binding(id))
            .ok_or_else(|| Error::Ingest("Macro sequence binding not found".to_string()))?;
        let macro_sequence = sequence_of(&content, macro_binding)?;

        let main_choice = match fab.choice_of_type(ProgramType::Main) {
            Some(existing) => existing,
            None => {
                let choice = choose_main(fab, &content, &macro_choice, macro_sequence)?;
                fab.put(choice)?
            }
        };
        let main_program = main_choice
            .program_id
            .and_then(|id| content.program(id))
            .ok_or_else(|| Error::Ingest("Main program not found".to_string()))?;
        let main_binding = main_choice
            .program_sequence_binding_id
            .and_then(|id| content.binding(id))
            .ok_or_else(|| Error::Ingest("Main sequence binding not found".to_string()))?;
        let main_sequence = sequence_of(&content, main_binding)?;
        let transpose = main_choice.transpose;

        let key = transposed_key(&content.sequence_key(main_sequence), transpose)?;
        let tempo = (content.sequence_tempo(macro_sequence) + content.sequence_tempo(main_sequence)) / 2.0;
        let density = (content.sequence_density(macro_sequence) + content.sequence_density(main_sequence)) / 2.0;
        let total = main_sequence.total;
        fab.update_segment(|s| {
            s.key = key;
            s.tempo = tempo;
            s.density = density;
            s.total = total;
        })?;
        let duration_micros = time::seconds_to_micros(fab.total_seconds());
        fab.update_segment(|s| {
            s.duration_micros = Some(duration_micros);
            s.end_at = Some(time::plus_micros(s.begin_at, duration_micros));
        })?;

        put_chords(fab, &content, main_sequence, transpose)?;

        for meme in content.binding_memes(macro_binding) {
            fab.add_meme(&meme)?;
        }
        for meme in content.binding_memes(main_binding) {
            fab.add_meme(&meme)?;
        }

        fab.put_report(
            "main",
            format!("{} @{} transpose {}", main_program.name, main_binding.offset, transpose),
        );
        Ok(())
    }
}

fn choose_main(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    macro_choice: &SegmentChoice,
    macro_sequence: &ProgramSequence,
) -> Result<SegmentChoice> {
    let segment_id = fab.segment().id;
    let previous = fab.previous_choice(ProgramType::Main).cloned();

    if fab.segment().segment_type == SegmentType::Continue {
        if let Some(prev) = &previous {
            let continued = prev
                .program_id
                .zip(prev.program_sequence_binding_id)
                .and_then(|(program_id, binding_id)| {
                    let offset = content.next_offset(program_id, content.binding(binding_id)?.offset)?;
                    binding_at(fab, content, program_id, offset)
                });
            if let Some(binding) = continued {
                return Ok(SegmentChoice::program(
                    segment_id,
                    ProgramType::Main,
                    binding.program_id,
                    binding.id,
                    prev.transpose,
                )?);
            }
        }
    }

    let isometry = fab.isometry_of_macro_binding();
    let avoid = previous.as_ref().and_then(|c| c.program_id);
    let program = choose_program(fab, content, ProgramType::Main, avoid, &isometry)
        .ok_or_else(|| Error::Ingest("no eligible Main program".to_string()))?;
    let binding = first_binding(fab, content, program.id)
        .ok_or_else(|| Error::Ingest(format!("Main program {} has no sequence bindings", program.name)))?;
    let main_sequence = sequence_of(content, &binding)?;
    let transpose = transpose_between(
        &program,
        &content.sequence_key(main_sequence),
        &content.sequence_key(macro_sequence),
        macro_choice.transpose,
    )?;
    Ok(SegmentChoice::program(
        segment_id,
        ProgramType::Main,
        program.id,
        binding.id,
        transpose,
    )?)
}

fn transposed_key(key: &str, transpose: i32) -> Result<String> {
    if key.trim().is_empty() {
        return Err(Error::Ingest("Main sequence has no key".to_string()));
    }
    let parsed = Key::parse(key).map_err(|e| Error::Craft(e.to_string()))?;
    Ok(parsed.transpose(transpose).full_description())
}

/// Copy the main sequence's chords (and their voicings) into the segment
///
/// Positions at or beyond the sequence total are dropped and a position
/// already holding a chord is left alone, so re-running is harmless.
fn put_chords(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    sequence: &ProgramSequence,
    transpose: i32,
) -> Result<()> {
    let segment_id = fab.segment().id;
    for source in content.chords(sequence.id) {
        if source.position >= sequence.total as f64 {
            continue;
        }
        let existing = fab
            .get_all::<SegmentChord>()
            .into_iter()
            .find(|c| c.position == source.position);
        let chord = match existing {
            Some(chord) => chord,
            None => {
                let name = transpose_chord_name(&source.name, transpose)?;
                fab.put(SegmentChord::new(segment_id, source.position, &name)?)?
            }
        };
        for voicing in content.voicings(source.id) {
            if fab.voicing_of(chord.id, voicing.instrument_type).is_some() {
                continue;
            }
            let notes = voicing
                .notes
                .iter()
                .map(|n| transpose_note_name(n, transpose))
                .collect::<Result<Vec<_>>>()?;
            fab.put(SegmentChordVoicing::new(&chord, voicing.instrument_type, notes)?)?;
        }
    }
    Ok(())
}

fn transpose_chord_name(name: &str, transpose: i32) -> Result<String> {
    if transpose == 0 {
        return Ok(name.trim().to_string());
    }
    let chord = Chord::parse(name).map_err(|e| Error::Craft(e.to_string()))?;
    Ok(chord.transpose(transpose).full_description())
}

fn transpose_note_name(name: &str, transpose: i32) -> Result<String> {
    if transpose == 0 {
        return Ok(name.trim().to_string());
    }
    let note = mfab_common::music::Note::parse(name).map_err(|e| Error::Craft(e.to_string()))?;
    Ok(note.transpose(transpose).to_string())
}
