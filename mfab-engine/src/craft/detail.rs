//! Detail phase: chordal and melodic voices
//!
//! Besides arranging the voices, every segment chord gets a voicing for each
//! instrument type chosen here. Voicings copied from the main sequence win;
//! missing ones are derived from the chord itself.

use super::{arrange_voices, CraftPhase};
use crate::fabricator::Fabricator;
use crate::{Error, Result};
use mfab_common::content::{InstrumentType, ProgramType};
use mfab_common::models::{SegmentChord, SegmentChordVoicing};
use mfab_common::music::Chord;
use std::collections::BTreeSet;

pub struct DetailCraft;

impl CraftPhase for DetailCraft {
    fn name(&self) -> &'static str {
        "Detail"
    }

    fn do_work(&self, fab: &mut Fabricator) -> Result<()> {
        let choices = arrange_voices(fab, ProgramType::Detail, is_detail_voice, true)?;
        let instrument_types: BTreeSet<InstrumentType> =
            choices.iter().filter_map(|c| c.instrument_type).collect();
        for chord in fab.get_all::<SegmentChord>() {
            for instrument_type in &instrument_types {
                if fab.voicing_of(chord.id, *instrument_type).is_some() {
                    continue;
                }
                let notes = derive_voicing(&chord.name, *instrument_type)?;
                fab.put(SegmentChordVoicing::new(&chord, *instrument_type, notes)?)?;
            }
        }
        Ok(())
    }
}

fn is_detail_voice(instrument_type: InstrumentType) -> bool {
    !instrument_type.is_percussive()
}

/// Close-position voicing of a chord name in the instrument type's octave
fn derive_voicing(chord_name: &str, instrument_type: InstrumentType) -> Result<Vec<String>> {
    let chord = Chord::parse(chord_name).map_err(|e| Error::Craft(e.to_string()))?;
    Ok(chord
        .voicing(instrument_type.voicing_octave())
        .iter()
        .map(|n| n.to_string())
        .collect())
}
