//! Dub engine: turns a crafted segment's arrangements into timed picks
//!
//! Every arrangement's pattern is repeated across the segment; each event
//! resolves to an instrument audio and a start/length in microseconds from the
//! segment start. Picks are committed before shipping so a failed ship is
//! retried with exactly the same picks.

pub mod sink;

pub use sink::{AudioSink, JsonManifestSink, NullSink};

use crate::fabricator::Fabricator;
use crate::{Error, Result};
use mfab_common::content::{
    ContentSnapshot, Instrument, InstrumentAudio, ProgramSequencePatternEvent,
};
use mfab_common::models::{
    MessageSeverity, Segment, SegmentChoice, SegmentChoiceArrangement, SegmentChoiceArrangementPick,
};
use mfab_common::music::Note;
use mfab_common::{time, uuid_utils};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct DubEngine {
    sink: Arc<dyn AudioSink>,
    sink_timeout: Duration,
}

impl DubEngine {
    pub fn new(sink: Arc<dyn AudioSink>, sink_timeout: Duration) -> Self {
        Self { sink, sink_timeout }
    }

    /// Pick (unless already picked), commit, then ship
    pub async fn dub(&self, fab: &mut Fabricator) -> Result<Vec<SegmentChoiceArrangementPick>> {
        let mut picks = fab.get_all::<SegmentChoiceArrangementPick>();
        if picks.is_empty() {
            picks = pick_all(fab)?;
            fab.commit().await?;
        } else {
            debug!(
                "{} segment {}: reusing {} picks",
                fab.chain().ident(),
                fab.segment().offset,
                picks.len()
            );
        }
        sort_picks(&mut picks);
        self.ship(fab.segment(), &picks).await?;
        Ok(picks)
    }

    /// Ship to the sink, bounded by the sink timeout
    pub async fn ship(&self, segment: &Segment, picks: &[SegmentChoiceArrangementPick]) -> Result<()> {
        match tokio::time::timeout(self.sink_timeout, self.sink.ship(segment, picks)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Dub(format!("sink rejected {}: {}", segment.storage_key, e))),
            Err(_) => Err(Error::Timeout(format!(
                "sink did not accept {} within {:?}",
                segment.storage_key, self.sink_timeout
            ))),
        }
    }
}

fn sort_picks(picks: &mut [SegmentChoiceArrangementPick]) {
    picks.sort_by(|a, b| {
        a.start_micros
            .cmp(&b.start_micros)
            .then_with(|| a.tones.cmp(&b.tones))
    });
}

/// Create the picks of every arrangement on the fabricator
pub fn pick_all(fab: &mut Fabricator) -> Result<Vec<SegmentChoiceArrangementPick>> {
    let total_micros = fab.segment().total_micros();
    if total_micros == 0 || fab.segment().total == 0 {
        return Err(Error::Dub(format!(
            "segment {} has no duration; craft first",
            fab.segment().offset
        )));
    }
    let content = Arc::clone(fab.content());
    let choices: HashMap<Uuid, SegmentChoice> =
        fab.choices().into_iter().map(|c| (c.id, c)).collect();
    let mut picker = Picker {
        content: &content,
        total_micros,
        audio_memo: HashMap::new(),
        picks: Vec::new(),
    };
    for arrangement in fab.get_all::<SegmentChoiceArrangement>() {
        let choice = match choices.get(&arrangement.segment_choice_id) {
            Some(choice) => choice,
            None => continue,
        };
        let instrument = match choice.instrument_id.and_then(|id| content.instrument(id)) {
            Some(instrument) => instrument,
            None => {
                fab.add_message(
                    MessageSeverity::Warning,
                    format!("Arrangement {} has no instrument", arrangement.id),
                )?;
                continue;
            }
        };
        match arrangement.program_sequence_pattern_id {
            Some(pattern_id) => picker.pick_pattern(fab, &arrangement, choice, instrument, pattern_id)?,
            None => picker.pick_one_shot(fab, &arrangement, instrument),
        }
    }
    let mut picks = picker.picks;
    for pick in &picks {
        fab.put(pick.clone())?;
    }
    sort_picks(&mut picks);
    debug!(
        "{} segment {}: {} picks",
        fab.chain().ident(),
        fab.segment().offset,
        picks.len()
    );
    Ok(picks)
}

struct Picker<'a> {
    content: &'a ContentSnapshot,
    total_micros: u64,
    /// Percussive audio per (instrument, event name), fixed for the segment
    audio_memo: HashMap<(Uuid, String), Option<InstrumentAudio>>,
    picks: Vec<SegmentChoiceArrangementPick>,
}

impl<'a> Picker<'a> {
    fn pick_pattern(
        &mut self,
        fab: &mut Fabricator,
        arrangement: &SegmentChoiceArrangement,
        choice: &SegmentChoice,
        instrument: &Instrument,
        pattern_id: Uuid,
    ) -> Result<()> {
        let pattern = match self.content.pattern(pattern_id) {
            Some(pattern) => pattern,
            None => return Err(Error::Ingest(format!("pattern {} not found", pattern_id))),
        };
        let segment_total = fab.segment().total as f64;
        let segment_delta = fab.segment().delta as f64;
        let repeat = if pattern.total > 0 {
            pattern.total as f64
        } else {
            segment_total
        };
        let events = self.content.events(pattern.id);
        let mut offset = 0.0;
        while offset < segment_total {
            for event in &events {
                let position = offset + event.position;
                if position < 0.0 || position >= segment_total || !choice.governs(segment_delta + position) {
                    continue;
                }
                self.pick_event(fab, arrangement, choice, instrument, event, position)?;
            }
            offset += repeat;
        }
        Ok(())
    }

    fn pick_event(
        &mut self,
        fab: &mut Fabricator,
        arrangement: &SegmentChoiceArrangement,
        choice: &SegmentChoice,
        instrument: &Instrument,
        event: &ProgramSequencePatternEvent,
        position: f64,
    ) -> Result<()> {
        let segment_total = fab.segment().total as f64;
        let start = fab.micros_at_position(position).min(self.total_micros);
        let end = fab
            .micros_at_position((position + event.duration.max(0.0)).min(segment_total))
            .min(self.total_micros);
        let event_name = self
            .content
            .track(event.program_voice_track_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();

        if instrument.instrument_type.is_percussive() {
            let key = (instrument.id, event_name.to_ascii_lowercase());
            if !self.audio_memo.contains_key(&key) {
                let chosen = self
                    .content
                    .audios_for_event(instrument.id, &event_name)
                    .choose(fab.rng())
                    .map(|a| (*a).clone());
                self.audio_memo.insert(key.clone(), chosen);
            }
            match self.audio_memo.get(&key).cloned().flatten() {
                Some(audio) => {
                    let length = percussive_length(&audio, start, self.total_micros);
                    self.push(arrangement, event, &audio, instrument, start, length, event_name);
                }
                None => warn!(
                    "{} segment {}: {} has no audio for event {:?}",
                    fab.chain().ident(),
                    fab.segment().offset,
                    instrument.name,
                    event_name
                ),
            }
            return Ok(());
        }

        let length = end.saturating_sub(start);
        if length == 0 {
            return Ok(());
        }
        for note in self.event_notes(fab, choice, instrument, event, position)? {
            if let Some(audio) = closest_audio(self.content, instrument, &event_name, &note) {
                self.push(arrangement, event, &audio, instrument, start, length, note.to_string());
            }
        }
        Ok(())
    }

    /// Notes an event plays at a position
    ///
    /// Atonal tones take their pitch from the chord voicing there, through the
    /// event's sticky bun when the event is sticky; other tones are transposed
    /// with the choice.
    fn event_notes(
        &self,
        fab: &mut Fabricator,
        choice: &SegmentChoice,
        instrument: &Instrument,
        event: &ProgramSequencePatternEvent,
        position: f64,
    ) -> Result<Vec<Note>> {
        let mut voicing: Option<Vec<Note>> = None;
        let mut notes = Vec::new();
        for (i, tone) in event.tones.iter().enumerate() {
            if Note::is_atonal(tone) {
                if voicing.is_none() {
                    voicing = Some(voicing_notes_at(fab, instrument, position));
                }
                let available = voicing.as_deref().unwrap_or_default();
                if available.is_empty() {
                    continue;
                }
                let bun = if event.sticky {
                    fab.sticky_bun(event.id, event.tones.len())?
                } else {
                    None
                };
                let note = match bun {
                    Some(bun) => bun.compute(available, i),
                    None => available.get(i % available.len()).copied(),
                };
                notes.extend(note);
            } else {
                match Note::parse(tone) {
                    Ok(note) => notes.push(note.transpose(choice.transpose)),
                    Err(e) => fab.add_message(
                        MessageSeverity::Warning,
                        format!("Event {} tone {:?}: {}", event.id, tone, e),
                    )?,
                }
            }
        }
        Ok(notes)
    }

    fn push(
        &mut self,
        arrangement: &SegmentChoiceArrangement,
        event: &ProgramSequencePatternEvent,
        audio: &InstrumentAudio,
        instrument: &Instrument,
        start: u64,
        length: u64,
        tones: String,
    ) {
        self.picks.push(SegmentChoiceArrangementPick {
            id: uuid_utils::generate(),
            segment_id: arrangement.segment_id,
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: Some(event.id),
            instrument_audio_id: audio.id,
            start_micros: start,
            length_micros: length,
            amplitude: (event.velocity * instrument.volume * audio.volume).max(0.0),
            tones,
            event: audio.event.clone(),
        });
    }

    /// Instrument-only arrangement: one audio from the segment start
    fn pick_one_shot(&mut self, fab: &mut Fabricator, arrangement: &SegmentChoiceArrangement, instrument: &Instrument) {
        let audio = match self.content.audios(instrument.id).choose(fab.rng()) {
            Some(audio) => (*audio).clone(),
            None => return,
        };
        let length = percussive_length(&audio, 0, self.total_micros);
        self.picks.push(SegmentChoiceArrangementPick {
            id: uuid_utils::generate(),
            segment_id: arrangement.segment_id,
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: None,
            instrument_audio_id: audio.id,
            start_micros: 0,
            length_micros: length,
            amplitude: (instrument.volume * audio.volume).max(0.0),
            tones: audio.event.clone(),
            event: audio.event.clone(),
        });
    }
}

/// Full audio length, cut at the end of the segment
fn percussive_length(audio: &InstrumentAudio, start: u64, total_micros: u64) -> u64 {
    time::seconds_to_micros(audio.length_seconds).min(total_micros.saturating_sub(start))
}

fn voicing_notes_at(fab: &mut Fabricator, instrument: &Instrument, position: f64) -> Vec<Note> {
    let chord = match fab.chord_at(position) {
        Some(chord) => chord,
        None => return Vec::new(),
    };
    fab.voicing_of(chord.id, instrument.instrument_type)
        .map(|v| v.notes.iter().filter_map(|n| Note::parse(n).ok()).collect())
        .unwrap_or_default()
}

/// Audio whose first tone is nearest in pitch to `note`
///
/// Audios answering to the event name are preferred over the rest of the
/// instrument's audios.
fn closest_audio(
    content: &ContentSnapshot,
    instrument: &Instrument,
    event_name: &str,
    note: &Note,
) -> Option<InstrumentAudio> {
    let mut candidates = content.audios_for_event(instrument.id, event_name);
    if candidates.is_empty() {
        candidates = content.audios(instrument.id);
    }
    candidates
        .into_iter()
        .min_by_key(|audio| {
            audio
                .tones
                .first()
                .and_then(|t| Note::parse(t).ok())
                .map(|n| (n.pitch() - note.pitch()).abs())
                .unwrap_or(i32::MAX)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfab_common::content::InstrumentType;

    #[test]
    fn test_closest_audio_by_pitch() {
        let mut content = ContentSnapshot::default();
        let pad = Instrument::new(InstrumentType::Pad, "pad");
        let low = InstrumentAudio::new(&pad, "X", &["C3"], 2.0);
        let high = InstrumentAudio::new(&pad, "X", &["C5"], 2.0);
        content.instruments.push(pad.clone());
        content.instrument_audios = vec![low.clone(), high.clone()];

        let near_high = Note::parse("A4").unwrap();
        assert_eq!(closest_audio(&content, &pad, "X", &near_high).unwrap().id, high.id);
        let near_low = Note::parse("D3").unwrap();
        assert_eq!(closest_audio(&content, &pad, "other", &near_low).unwrap().id, low.id);
    }

    #[test]
    fn test_percussive_length_is_cut_at_segment_end() {
        let kit = Instrument::new(InstrumentType::Drum, "kit");
        let crash = InstrumentAudio::new(&kit, "CRASH", &[], 3.0);
        assert_eq!(percussive_length(&crash, 0, 10_000_000), 3_000_000);
        assert_eq!(percussive_length(&crash, 9_000_000, 10_000_000), 1_000_000);
        assert_eq!(percussive_length(&crash, 12_000_000, 10_000_000), 0);
    }
}
