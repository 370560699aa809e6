//! Transition phase: a one-shot sweep where the main program changes

use super::{add_choice_memes, choose_instrument, CraftPhase};
use crate::fabricator::Fabricator;
use crate::Result;
use mfab_common::content::InstrumentType;
use mfab_common::models::{SegmentChoice, SegmentChoiceArrangement, SegmentType};
use std::sync::Arc;

pub struct TransitionCraft;

impl CraftPhase for TransitionCraft {
    fn name(&self) -> &'static str {
        "Transition"
    }

    fn do_work(&self, fab: &mut Fabricator) -> Result<()> {
        if !matches!(
            fab.segment().segment_type,
            SegmentType::NextMain | SegmentType::NextMacro
        ) {
            return Ok(());
        }
        let exists = fab
            .choices()
            .iter()
            .any(|c| c.instrument_type == Some(InstrumentType::Transition));
        if exists {
            return Ok(());
        }
        let content = Arc::clone(fab.content());
        let isometry = fab.isometry_of_segment();
        let instrument = match choose_instrument(fab, &content, InstrumentType::Transition, None, &isometry) {
            Some(instrument) => instrument,
            None => return Ok(()),
        };
        let choice = SegmentChoice::instrument(fab.segment().id, instrument.id, InstrumentType::Transition)?;
        let choice = fab.put(choice)?;
        fab.put(SegmentChoiceArrangement::new(&choice, None))?;
        add_choice_memes(fab, &content, &choice)
    }
}
