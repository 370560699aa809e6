//! Rhythm phase: percussive voices

use super::{arrange_voices, CraftPhase};
use crate::fabricator::Fabricator;
use crate::Result;
use mfab_common::content::{InstrumentType, ProgramType};

pub struct RhythmCraft;

impl CraftPhase for RhythmCraft {
    fn name(&self) -> &'static str {
        "Rhythm"
    }

    fn do_work(&self, fab: &mut Fabricator) -> Result<()> {
        arrange_voices(fab, ProgramType::Rhythm, is_rhythm_voice, false)?;
        Ok(())
    }
}

fn is_rhythm_voice(instrument_type: InstrumentType) -> bool {
    instrument_type == InstrumentType::Drum
}
