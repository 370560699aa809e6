//! Read-only view of the segment preceding the one under construction
//!
//! Crafting may only look backwards. The previous segment (offset - 1) and all
//! of its sub-entities are read once, when the fabricator is built, along with
//! the newest sticky bun of each event stored anywhere earlier in the chain.

use super::sticky_bun::META_KEY_PREFIX;
use crate::store::EntityStore;
use crate::Result;
use mfab_common::content::{ContentSnapshot, ProgramType};
use mfab_common::models::{
    Segment, SegmentChoice, SegmentEntity, SegmentMeta, SegmentScoped, SegmentType,
};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct Retrospective {
    previous: Option<Segment>,
    entities: Vec<SegmentEntity>,
    /// Sticky buns of earlier segments, newest per key
    carried: Vec<SegmentMeta>,
}

impl Retrospective {
    pub async fn load(store: &dyn EntityStore, chain_id: Uuid, offset: u64) -> Result<Self> {
        if offset == 0 {
            return Ok(Self::default());
        }
        let previous = store.read_one_at_chain_offset(chain_id, offset - 1).await?;
        let entities = match &previous {
            Some(segment) => store.segment_entities(segment.id, None).await?,
            None => Vec::new(),
        };
        let carried = store.latest_metas_before(chain_id, offset, META_KEY_PREFIX).await?;
        Ok(Self {
            previous,
            entities,
            carried,
        })
    }

    pub fn previous_segment(&self) -> Option<&Segment> {
        self.previous.as_ref()
    }

    pub fn all<T: SegmentScoped>(&self) -> Vec<&T> {
        self.entities.iter().filter_map(T::from_entity).collect()
    }

    pub fn previous_choice(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.all::<SegmentChoice>()
            .into_iter()
            .find(|c| c.program_type == Some(program_type) && c.program_voice_id.is_none())
    }

    /// Program of any choice of the given type, voiced or not
    pub fn previous_program(&self, program_type: ProgramType) -> Option<Uuid> {
        self.all::<SegmentChoice>()
            .into_iter()
            .find(|c| c.program_type == Some(program_type))
            .and_then(|c| c.program_id)
    }

    /// Choice that realized a program voice in the previous segment
    pub fn previous_choice_for_voice(&self, voice_id: Uuid) -> Option<&SegmentChoice> {
        self.all::<SegmentChoice>()
            .into_iter()
            .find(|c| c.program_voice_id == Some(voice_id))
    }

    pub fn previous_instrument_for_voice(&self, voice_id: Uuid) -> Option<Uuid> {
        self.previous_choice_for_voice(voice_id).and_then(|c| c.instrument_id)
    }

    /// Meta of the previous segment, else a sticky bun carried from further back
    pub fn meta(&self, key: &str) -> Option<&SegmentMeta> {
        self.all::<SegmentMeta>()
            .into_iter()
            .find(|m| m.key == key)
            .or_else(|| self.carried.iter().find(|m| m.key == key))
    }

    /// Type of the segment following the previous one
    ///
    /// Continue while the previous main program has another binding offset,
    /// else NextMain while the previous macro program does, else NextMacro.
    pub fn compute_type(&self, offset: u64, content: &ContentSnapshot) -> SegmentType {
        if offset == 0 {
            return SegmentType::Initial;
        }
        let advances = |program_type| {
            self.previous_choice(program_type)
                .and_then(|c| Some((c.program_id?, c.program_sequence_binding_id?)))
                .and_then(|(program_id, binding_id)| {
                    let binding = content.binding(binding_id)?;
                    content.next_offset(program_id, binding.offset)
                })
                .is_some()
        };
        if advances(ProgramType::Main) {
            SegmentType::Continue
        } else if advances(ProgramType::Macro) {
            SegmentType::NextMain
        } else {
            SegmentType::NextMacro
        }
    }
}
