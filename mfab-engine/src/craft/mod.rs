//! Craft engine: chooses the musical structure of a segment
//!
//! Phases run in order (Macro, Main, Rhythm, Detail, Transition), each adding
//! choices, arrangements, chords and memes to the fabricator. A failing phase
//! aborts the attempt before anything is committed.

mod detail;
mod macro_main;
mod rhythm;
mod transition;

pub use detail::DetailCraft;
pub use macro_main::{MacroCraft, MainCraft};
pub use rhythm::RhythmCraft;
pub use transition::TransitionCraft;

use crate::fabricator::score_picker::{SCORE_AVOID, SCORE_DIRECT, SCORE_MATCH};
use crate::fabricator::{Fabricator, ScorePicker};
use crate::meme_isometry::MemeIsometry;
use crate::{Error, Result};
use mfab_common::config::CraftConfig;
use mfab_common::content::{
    ContentSnapshot, Instrument, InstrumentType, Program, ProgramSequenceBinding, ProgramType,
    ProgramVoice,
};
use mfab_common::models::{MessageSeverity, SegmentChoice, SegmentChoiceArrangement, SegmentType};
use mfab_common::music::Key;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One step of crafting
pub trait CraftPhase: Send + Sync {
    fn name(&self) -> &'static str;

    fn do_work(&self, fab: &mut Fabricator) -> Result<()>;
}

pub struct CraftEngine {
    phases: Vec<Box<dyn CraftPhase>>,
}

impl CraftEngine {
    pub fn new(config: &CraftConfig) -> Self {
        let mut phases: Vec<Box<dyn CraftPhase>> = vec![
            Box::new(MacroCraft),
            Box::new(MainCraft),
            Box::new(RhythmCraft),
            Box::new(DetailCraft),
        ];
        if config.transition_enabled {
            phases.push(Box::new(TransitionCraft));
        }
        Self { phases }
    }

    /// Run every phase, then commit
    ///
    /// Cancellation is honored between phases. `progress` is called before each
    /// phase so a supervisor can tell a slow craft from a stalled one.
    pub async fn craft(
        &self,
        fab: &mut Fabricator,
        cancel: &CancellationToken,
        progress: &(dyn Fn(&'static str) + Send + Sync),
    ) -> Result<()> {
        for phase in &self.phases {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("before {} phase", phase.name())));
            }
            progress(phase.name());
            debug!(
                "{} segment {}: {} phase",
                fab.chain().ident(),
                fab.segment().offset,
                phase.name()
            );
            phase.do_work(fab)?;
        }
        fab.commit().await?;
        info!(
            "Crafted {} segment {} ({:?}, key {}, {} beats at {} bpm)",
            fab.chain().ident(),
            fab.segment().offset,
            fab.segment().segment_type,
            fab.segment().key,
            fab.segment().total,
            fab.segment().tempo
        );
        Ok(())
    }
}

/// Instrument for a voice: the one used last segment if still available, else
/// the best meme match (anti-memes excluded)
pub(crate) fn choose_instrument(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    instrument_type: InstrumentType,
    continued: Option<Uuid>,
    isometry: &MemeIsometry,
) -> Option<Instrument> {
    if let Some(previous) = continued.and_then(|id| content.instrument(id)) {
        if previous.instrument_type == instrument_type {
            return Some(previous.clone());
        }
    }
    let mut picker = ScorePicker::new();
    for instrument in content.instruments_of_type(instrument_type) {
        let memes = content.memes(instrument);
        if !isometry.is_allowed(&memes) {
            continue;
        }
        let score = isometry.score(&memes) as f64 * SCORE_MATCH;
        picker.add(instrument.clone(), instrument.name.clone(), score);
    }
    let chosen = picker.pick(fab.rng());
    if let Some(instrument) = &chosen {
        fab.put_report(
            format!("instrument.{:?}", instrument_type),
            format!("{} of [{}]", instrument.name, picker.report()),
        );
    }
    chosen
}

/// Best-scoring program of a type against a meme isometry
///
/// Anti-meme conflicts are excluded, `avoid` is penalized and directly bound
/// programs are strongly preferred.
pub(crate) fn choose_program(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    program_type: ProgramType,
    avoid: Option<Uuid>,
    isometry: &MemeIsometry,
) -> Option<Program> {
    let mut picker = ScorePicker::new();
    for program in content.programs_of_type(program_type) {
        let memes = content.memes(program);
        if !isometry.is_allowed(&memes) {
            continue;
        }
        let mut score = isometry.score(&memes) as f64 * SCORE_MATCH;
        if avoid == Some(program.id) {
            score += SCORE_AVOID;
        }
        if program.directly_bound {
            score += SCORE_DIRECT;
        }
        picker.add(program.clone(), program.name.clone(), score);
    }
    let chosen = picker.pick(fab.rng());
    if chosen.is_some() {
        fab.put_report(format!("program.{:?}", program_type), picker.report());
    }
    chosen
}

/// One of the program's bindings at `offset`, chosen at random among alternates
pub(crate) fn binding_at(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    program_id: Uuid,
    offset: u32,
) -> Option<ProgramSequenceBinding> {
    content
        .bindings_at_offset(program_id, offset)
        .choose(fab.rng())
        .map(|b| (*b).clone())
}

/// A binding at the program's first offset
pub(crate) fn first_binding(
    fab: &mut Fabricator,
    content: &ContentSnapshot,
    program_id: Uuid,
) -> Option<ProgramSequenceBinding> {
    let offset = *content.available_offsets(program_id).first()?;
    binding_at(fab, content, program_id, offset)
}

/// Semitones moving `from_key` onto `to_key`, plus `adjust`
///
/// Zero for programs that must not be transposed or when either key is blank.
pub(crate) fn transpose_between(program: &Program, from_key: &str, to_key: &str, adjust: i32) -> Result<i32> {
    if !program.do_transpose || from_key.trim().is_empty() || to_key.trim().is_empty() {
        return Ok(0);
    }
    Key::delta(from_key, to_key, adjust)
        .map_err(|e| Error::Craft(format!("cannot transpose {}: {}", program.name, e)))
}

/// Choose a Rhythm or Detail program and realize each of its voices
///
/// Each matching voice gets an instrument and one of its patterns in the
/// chosen sequence; alternates at the same sequence are picked uniformly at
/// random. Voices already realized in this segment are left alone. The memes
/// of every realized choice's program, binding and instrument join the
/// segment's memes. Returns the voiced choices of the program, or nothing
/// when no program is eligible.
pub(crate) fn arrange_voices(
    fab: &mut Fabricator,
    program_type: ProgramType,
    voice_filter: fn(InstrumentType) -> bool,
    transpose_to_segment: bool,
) -> Result<Vec<SegmentChoice>> {
    let content = Arc::clone(fab.content());
    let program = match existing_or_new_program(fab, &content, program_type) {
        Some(program) => program,
        None => {
            fab.put_report(format!("program.{:?}", program_type), "none available");
            return Ok(Vec::new());
        }
    };
    let main_offset = fab
        .choice_of_type(ProgramType::Main)
        .and_then(|c| c.program_sequence_binding_id)
        .and_then(|id| content.binding(id))
        .map(|b| b.offset)
        .unwrap_or(0);
    let offsets = content.available_offsets(program.id);
    let offset = offsets
        .iter()
        .rev()
        .find(|o| **o <= main_offset)
        .or_else(|| offsets.first())
        .copied()
        .ok_or_else(|| Error::Ingest(format!("{} has no sequence bindings", program.name)))?;
    let binding = binding_at(fab, &content, program.id, offset)
        .ok_or_else(|| Error::Ingest(format!("{} has no binding at {}", program.name, offset)))?;
    let sequence = content
        .sequence_of_binding(&binding)
        .ok_or_else(|| Error::Ingest(format!("sequence {} not found", binding.program_sequence_id)))?;
    let transpose = if transpose_to_segment {
        let segment_key = fab.segment().key.clone();
        transpose_between(&program, &content.sequence_key(sequence), &segment_key, 0)?
    } else {
        0
    };

    let voices: Vec<&ProgramVoice> = content
        .voices(program.id)
        .into_iter()
        .filter(|v| voice_filter(v.instrument_type))
        .collect();
    let entries = plan_delta_ins(fab, &voices);

    let isometry = fab.isometry_of_segment();
    let mut realized = Vec::new();
    for voice in voices {
        if let Some(existing) = fab.choice_for_voice(voice.id) {
            realized.push(existing);
            continue;
        }
        let patterns = content.patterns(sequence.id, voice.id);
        let pattern = match patterns.choose(fab.rng()) {
            Some(pattern) => (*pattern).clone(),
            None => continue,
        };
        let continued = fab.retrospective().previous_instrument_for_voice(voice.id);
        let instrument = match choose_instrument(fab, &content, voice.instrument_type, continued, &isometry) {
            Some(instrument) => instrument,
            None => {
                warn!(
                    "{} segment {}: no {:?} instrument for voice {}",
                    fab.chain().ident(),
                    fab.segment().offset,
                    voice.instrument_type,
                    voice.name
                );
                fab.add_message(
                    MessageSeverity::Warning,
                    format!("No {:?} instrument available for voice {}", voice.instrument_type, voice.name),
                )?;
                continue;
            }
        };
        let delta_in = entries.get(&voice.id).copied().flatten();
        let choice = SegmentChoice::program(fab.segment().id, program_type, program.id, binding.id, transpose)?
            .with_voice(voice.id, instrument.id, instrument.instrument_type)
            .with_delta(delta_in, None)?;
        let choice = fab.put(choice)?;
        fab.put(SegmentChoiceArrangement::new(&choice, Some(pattern.id)))?;
        fab.put_report(format!("pattern.{}", voice.name), pattern.name.clone());
        if let Some(beat) = delta_in {
            fab.put_report(format!("deltaIn.{}", voice.name), beat.to_string());
        }
        realized.push(choice);
    }
    for choice in &realized {
        add_choice_memes(fab, &content, choice)?;
    }
    Ok(realized)
}

/// Add the memes of a choice's sequence binding (with its program) and instrument
pub(crate) fn add_choice_memes(fab: &mut Fabricator, content: &ContentSnapshot, choice: &SegmentChoice) -> Result<()> {
    let mut memes = choice
        .program_sequence_binding_id
        .and_then(|id| content.binding(id))
        .map(|b| content.binding_memes(b))
        .unwrap_or_default();
    if let Some(instrument) = choice.instrument_id.and_then(|id| content.instrument(id)) {
        memes.extend(content.memes(instrument));
    }
    for meme in memes {
        fab.add_meme(&meme)?;
    }
    Ok(())
}

/// Layers that may enter at a segment start without a delta arc
const INCOMING_LAYERS: u32 = 1;
const BAR_BEATS: u32 = 4;

/// Chain beat at which each voice enters; `None` means from the start
///
/// Without delta arcs every voice is unbounded. On Continue a voice keeps the
/// entry it had in the previous segment. On any other segment type the voices
/// enter one after another (prioritized names first) at random multiples of a
/// subsection of the segment.
fn plan_delta_ins(fab: &mut Fabricator, voices: &[&ProgramVoice]) -> HashMap<Uuid, Option<u64>> {
    let mut plan = HashMap::new();
    if !fab.chain().config.delta_arc_enabled {
        return plan;
    }
    if fab.segment().segment_type == SegmentType::Continue {
        for voice in voices {
            let inherited = fab
                .retrospective()
                .previous_choice_for_voice(voice.id)
                .and_then(|c| c.delta_in);
            plan.insert(voice.id, inherited);
        }
        return plan;
    }

    let priority = fab.config().delta_arc_priority.clone();
    let (mut ordered, mut rest): (Vec<&ProgramVoice>, Vec<&ProgramVoice>) =
        voices.iter().copied().partition(|v| is_prioritized(&v.name, &priority));
    ordered.shuffle(fab.rng());
    rest.shuffle(fab.rng());
    ordered.extend(rest);

    let unit = subsection_beats(fab.segment().total);
    let base = fab.segment().delta;
    let first = fab.rng().gen_range(0..unit * 4) as i64 - (unit * 2 * INCOMING_LAYERS) as i64;
    let mut delta = round_to_nearest(unit, first);
    for voice in ordered {
        let entry = (delta > 0).then(|| base + delta as u64);
        plan.insert(voice.id, entry);
        delta += round_to_nearest(unit, fab.rng().gen_range(0..unit * 4) as i64);
    }
    plan
}

fn is_prioritized(voice_name: &str, priority: &[String]) -> bool {
    let name = voice_name.to_lowercase();
    priority.iter().any(|p| !p.is_empty() && name.contains(&p.to_lowercase()))
}

/// Largest power-of-two number of bars fitting four times in the segment, at least one bar
fn subsection_beats(total: u32) -> u32 {
    let mut beats = BAR_BEATS;
    while beats * 2 * 4 <= total {
        beats *= 2;
    }
    beats
}

/// Nearest non-negative multiple of `unit`
fn round_to_nearest(unit: u32, value: i64) -> i64 {
    let unit = unit as i64;
    ((value as f64 / unit as f64).round() as i64).max(0) * unit
}

/// Program already chosen for this segment, the previous one on Continue, or a new pick
fn existing_or_new_program(fab: &mut Fabricator, content: &ContentSnapshot, program_type: ProgramType) -> Option<Program> {
    let existing = fab
        .choices()
        .into_iter()
        .find(|c| c.program_type == Some(program_type))
        .and_then(|c| c.program_id);
    if let Some(program) = existing.and_then(|id| content.program(id)) {
        return Some(program.clone());
    }
    if fab.segment().segment_type == SegmentType::Continue {
        let previous = fab.retrospective().previous_program(program_type);
        if let Some(program) = previous.and_then(|id| content.program(id)) {
            return Some(program.clone());
        }
    }
    let isometry = fab.isometry_of_segment();
    choose_program(fab, content, program_type, None, &isometry)
}
