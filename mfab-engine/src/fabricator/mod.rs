//! Fabricator: working context for one segment under construction
//!
//! Craft phases and the dub engine read and write the segment exclusively
//! through this type. Writes are collected in an in-memory workbench and only
//! reach the store on [`Fabricator::commit`], so an aborted craft leaves nothing
//! half-written behind.

pub mod retrospective;
pub mod score_picker;
pub mod sticky_bun;
pub mod time_computer;

pub use retrospective::Retrospective;
pub use score_picker::ScorePicker;
pub use sticky_bun::StickyBun;
pub use time_computer::TimeComputer;

use crate::meme_isometry::MemeIsometry;
use crate::store::EntityStore;
use crate::{Error, Result};
use mfab_common::config::CraftConfig;
use mfab_common::content::{ContentSnapshot, InstrumentType, ProgramType};
use mfab_common::models::{
    Chain, MessageSeverity, Segment, SegmentChoice, SegmentChord, SegmentChordVoicing, SegmentEntity,
    SegmentMeme, SegmentMessage, SegmentMeta, SegmentScoped, SegmentType,
};
use mfab_common::time;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct Fabricator {
    store: Arc<dyn EntityStore>,
    content: Arc<ContentSnapshot>,
    chain: Chain,
    segment: Segment,
    retrospective: Retrospective,
    config: CraftConfig,
    /// Persisted entities of this segment plus everything written since
    workbench: Vec<SegmentEntity>,
    /// Ids of workbench entries not yet persisted, in write order
    pending: Vec<Uuid>,
    segment_dirty: bool,
    chord_memo: HashMap<u64, Option<SegmentChord>>,
    seconds_memo: HashMap<u64, f64>,
    time_computer: Option<TimeComputer>,
    report: BTreeMap<String, String>,
    rng: StdRng,
}

impl Fabricator {
    /// Load the segment's existing entities and its retrospective
    pub async fn new(
        store: Arc<dyn EntityStore>,
        content: Arc<ContentSnapshot>,
        chain: Chain,
        segment: Segment,
        config: CraftConfig,
    ) -> Result<Self> {
        if segment.chain_id != chain.id {
            return Err(Error::Validation(format!(
                "Segment[{}] does not belong to chain {}",
                segment.offset,
                chain.ident()
            )));
        }
        let retrospective = Retrospective::load(store.as_ref(), chain.id, segment.offset).await?;
        let workbench = store.segment_entities(segment.id, None).await?;
        debug!(
            "Fabricator for {} segment {} loaded {} entities",
            chain.ident(),
            segment.offset,
            workbench.len()
        );
        Ok(Self {
            store,
            content,
            chain,
            segment,
            retrospective,
            config,
            workbench,
            pending: Vec::new(),
            segment_dirty: false,
            chord_memo: HashMap::new(),
            seconds_memo: HashMap::new(),
            time_computer: None,
            report: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Replace the random source, e.g. with a seeded one in tests
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn content(&self) -> &Arc<ContentSnapshot> {
        &self.content
    }

    pub fn config(&self) -> &CraftConfig {
        &self.config
    }

    pub fn retrospective(&self) -> &Retrospective {
        &self.retrospective
    }

    pub fn is_initial(&self) -> bool {
        self.segment.segment_type == SegmentType::Initial
    }

    pub fn previous_segment(&self) -> Option<&Segment> {
        self.retrospective.previous_segment()
    }

    pub fn previous_choice(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.retrospective.previous_choice(program_type)
    }

    // ========================================================================
    // Segment entities
    // ========================================================================

    /// Add or replace an entity of this segment
    pub fn put<T: SegmentScoped>(&mut self, entity: T) -> Result<T> {
        let wrapped = entity.clone().into_entity();
        wrapped.validate()?;
        if wrapped.segment_id() != self.segment.id {
            return Err(Error::Validation(format!(
                "{} belongs to another segment",
                wrapped.kind().as_str()
            )));
        }
        if matches!(wrapped, SegmentEntity::Chord(_)) {
            self.chord_memo.clear();
        }
        let id = wrapped.id();
        match self.workbench.iter_mut().find(|e| e.id() == id && e.kind() == T::KIND) {
            Some(slot) => *slot = wrapped,
            None => self.workbench.push(wrapped),
        }
        if !self.pending.contains(&id) {
            self.pending.push(id);
        }
        Ok(entity)
    }

    /// Entities of one kind, in write order
    pub fn get_all<T: SegmentScoped>(&self) -> Vec<T> {
        self.workbench.iter().filter_map(T::from_entity).cloned().collect()
    }

    /// The singleton Macro or Main choice, or the first choice of another type
    pub fn choice_of_type(&self, program_type: ProgramType) -> Option<SegmentChoice> {
        self.get_all::<SegmentChoice>()
            .into_iter()
            .find(|c| c.program_type == Some(program_type) && c.program_voice_id.is_none())
    }

    pub fn choices(&self) -> Vec<SegmentChoice> {
        self.get_all()
    }

    /// Choice already realizing a program voice, if any
    pub fn choice_for_voice(&self, voice_id: Uuid) -> Option<SegmentChoice> {
        self.get_all::<SegmentChoice>()
            .into_iter()
            .find(|c| c.program_voice_id == Some(voice_id))
    }

    pub fn voicing_of(&self, chord_id: Uuid, instrument_type: InstrumentType) -> Option<SegmentChordVoicing> {
        self.get_all::<SegmentChordVoicing>()
            .into_iter()
            .find(|v| v.segment_chord_id == chord_id && v.instrument_type == instrument_type)
    }

    /// Add a meme unless the segment already carries it
    pub fn add_meme(&mut self, name: &str) -> Result<()> {
        let meme = SegmentMeme::new(self.segment.id, name)?;
        if self.segment_memes().contains(&meme.name) {
            return Ok(());
        }
        self.put(meme)?;
        Ok(())
    }

    pub fn add_message(&mut self, severity: MessageSeverity, body: impl Into<String>) -> Result<()> {
        let message = SegmentMessage::new(self.segment.id, severity, body);
        self.put(message)?;
        Ok(())
    }

    /// Record a craft decision; flushed as one Info message on commit
    pub fn put_report(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.report.insert(key.into(), value.into());
    }

    // ========================================================================
    // Segment attributes
    // ========================================================================

    /// Mutate the segment; timing memos are invalidated
    pub fn update_segment<F: FnOnce(&mut Segment)>(&mut self, f: F) -> Result<()> {
        let mut updated = self.segment.clone();
        f(&mut updated);
        updated.validate()?;
        self.segment = updated;
        self.segment_dirty = true;
        self.time_computer = None;
        self.seconds_memo.clear();
        Ok(())
    }

    // ========================================================================
    // Chords and timing
    // ========================================================================

    /// Chord with the greatest position not after `position`
    pub fn chord_at(&mut self, position: f64) -> Option<SegmentChord> {
        let key = position.to_bits();
        if let Some(hit) = self.chord_memo.get(&key) {
            return hit.clone();
        }
        let found = self
            .get_all::<SegmentChord>()
            .into_iter()
            .filter(|c| c.position <= position)
            .max_by(|a, b| a.position.total_cmp(&b.position));
        self.chord_memo.insert(key, found.clone());
        found
    }

    /// Name of the chord at `position`, or the segment key when none applies
    pub fn chord_name_at(&mut self, position: f64) -> String {
        match self.chord_at(position) {
            Some(chord) => chord.name,
            None => self.segment.key.clone(),
        }
    }

    fn time_computer(&mut self) -> TimeComputer {
        if let Some(tc) = self.time_computer {
            return tc;
        }
        let to_tempo = self.segment.tempo;
        let from_tempo = match self.previous_segment() {
            Some(previous) if !self.is_initial() && previous.tempo > 0.0 => previous.tempo,
            _ => to_tempo,
        };
        let tc = TimeComputer::new(self.segment.total as f64, from_tempo, to_tempo);
        self.time_computer = Some(tc);
        tc
    }

    /// Seconds from the segment start to a beat position
    pub fn seconds_at_position(&mut self, position: f64) -> f64 {
        let key = position.to_bits();
        if let Some(seconds) = self.seconds_memo.get(&key) {
            return *seconds;
        }
        let seconds = self.time_computer().seconds_at_position(position);
        self.seconds_memo.insert(key, seconds);
        seconds
    }

    pub fn micros_at_position(&mut self, position: f64) -> u64 {
        time::seconds_to_micros(self.seconds_at_position(position))
    }

    pub fn total_seconds(&mut self) -> f64 {
        let total = self.segment.total as f64;
        self.seconds_at_position(total)
    }

    // ========================================================================
    // Sticky buns
    // ========================================================================

    /// The stored random note choice for an event, created on first use
    ///
    /// Looked up in this segment first, then in the most recent earlier
    /// segment that stored one for the event. `None` when sticky buns are
    /// disabled.
    pub fn sticky_bun(&mut self, event_id: Uuid, tone_count: usize) -> Result<Option<StickyBun>> {
        if !self.config.sticky_bun_enabled {
            return Ok(None);
        }
        let key = StickyBun::meta_key(event_id);
        if let Some(meta) = self.get_all::<SegmentMeta>().into_iter().find(|m| m.key == key) {
            return Ok(Some(serde_json::from_str(&meta.value)?));
        }
        if let Some(value) = self.retrospective.meta(&key).map(|m| m.value.clone()) {
            let bun: StickyBun = serde_json::from_str(&value)?;
            self.put(SegmentMeta::new(self.segment.id, key, value))?;
            return Ok(Some(bun));
        }
        let bun = StickyBun::random(event_id, tone_count, &mut self.rng);
        let value = serde_json::to_string(&bun)?;
        self.put(SegmentMeta::new(self.segment.id, key, value))?;
        Ok(Some(bun))
    }

    // ========================================================================
    // Meme isometries
    // ========================================================================

    pub fn segment_memes(&self) -> Vec<String> {
        self.get_all::<SegmentMeme>().into_iter().map(|m| m.name).collect()
    }

    pub fn isometry_of_segment(&self) -> MemeIsometry {
        MemeIsometry::of(self.segment_memes())
    }

    fn binding_memes_of(&self, choice: Option<&SegmentChoice>) -> Vec<String> {
        choice
            .and_then(|c| c.program_sequence_binding_id)
            .and_then(|id| self.content.binding(id))
            .map(|b| self.content.binding_memes(b))
            .unwrap_or_default()
    }

    /// Memes of the current macro choice's program and sequence binding
    pub fn isometry_of_macro_binding(&self) -> MemeIsometry {
        MemeIsometry::of(self.binding_memes_of(self.choice_of_type(ProgramType::Macro).as_ref()))
    }

    pub fn isometry_of_previous_macro_binding(&self) -> MemeIsometry {
        MemeIsometry::of(self.binding_memes_of(self.previous_choice(ProgramType::Macro)))
    }

    /// Memes of the binding after the previous macro choice's binding
    ///
    /// Falls back to the previous macro binding itself when it was the last.
    pub fn isometry_of_next_macro_binding(&self) -> MemeIsometry {
        let next = self.previous_choice(ProgramType::Macro).and_then(|choice| {
            let program_id = choice.program_id?;
            let binding = self.content.binding(choice.program_sequence_binding_id?)?;
            let offset = self.content.next_offset(program_id, binding.offset)?;
            self.content.bindings_at_offset(program_id, offset).into_iter().next()
        });
        match next {
            Some(binding) => MemeIsometry::of(self.content.binding_memes(binding)),
            None => self.isometry_of_previous_macro_binding(),
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Number of writes not yet persisted
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Persist the segment and every pending entity
    pub async fn commit(&mut self) -> Result<()> {
        if !self.report.is_empty() {
            let body = serde_json::to_string(&self.report)?;
            self.report.clear();
            self.add_message(MessageSeverity::Info, body)?;
        }
        if self.segment_dirty {
            self.segment.updated_at = time::now();
            self.store.put_segment(&self.segment).await?;
            self.segment_dirty = false;
        }
        let pending: Vec<SegmentEntity> = self
            .pending
            .iter()
            .filter_map(|id| self.workbench.iter().find(|e| e.id() == *id).cloned())
            .collect();
        self.store.put_entities(&pending).await?;
        debug!(
            "Committed {} entities of {} segment {}",
            pending.len(),
            self.chain.ident(),
            self.segment.offset
        );
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use mfab_common::models::ChainType;

    async fn fabricator(store: Arc<MemoryStore>) -> Fabricator {
        let chain = Chain::new(Uuid::nil(), "fab", ChainType::Production, time::now()).unwrap();
        store.put_chain(&chain).await.unwrap();
        let mut segment = Segment::planned(&chain, 0, SegmentType::Initial, time::now()).unwrap();
        segment.key = "C Major".to_string();
        segment.tempo = 120.0;
        segment.total = 16;
        store.create_segment(&segment).await.unwrap();
        Fabricator::new(
            store,
            Arc::new(ContentSnapshot::default()),
            chain,
            segment,
            CraftConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_chord_at_takes_greatest_position_not_after() {
        let mut fab = fabricator(Arc::new(MemoryStore::new())).await;
        let id = fab.segment().id;
        for (position, name) in [(0.0, "C"), (4.0, "F"), (8.0, "G")] {
            fab.put(SegmentChord::new(id, position, name).unwrap()).unwrap();
        }
        assert_eq!(fab.chord_name_at(5.0), "F");
        assert_eq!(fab.chord_name_at(0.0), "C");
        assert_eq!(fab.chord_name_at(8.0), "G");
        assert_eq!(fab.chord_name_at(-1.0), "C Major");
    }

    #[tokio::test]
    async fn test_chord_memo_invalidated_by_new_chord() {
        let mut fab = fabricator(Arc::new(MemoryStore::new())).await;
        let id = fab.segment().id;
        fab.put(SegmentChord::new(id, 0.0, "C").unwrap()).unwrap();
        assert_eq!(fab.chord_name_at(6.0), "C");
        fab.put(SegmentChord::new(id, 4.0, "Am").unwrap()).unwrap();
        assert_eq!(fab.chord_name_at(6.0), "Am");
    }

    #[tokio::test]
    async fn test_put_rejects_foreign_and_invalid_entities() {
        let mut fab = fabricator(Arc::new(MemoryStore::new())).await;
        let foreign = SegmentMeme::new(Uuid::new_v4(), "dark").unwrap();
        assert!(matches!(fab.put(foreign), Err(Error::Validation(_))));
        let mut chord = SegmentChord::new(fab.segment().id, 0.0, "C").unwrap();
        chord.name.clear();
        assert!(matches!(fab.put(chord), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_sticky_bun_is_stable() {
        let mut fab = fabricator(Arc::new(MemoryStore::new())).await;
        let event = Uuid::new_v4();
        let first = fab.sticky_bun(event, 3).unwrap().unwrap();
        let second = fab.sticky_bun(event, 3).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(fab.get_all::<SegmentMeta>().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_persists_pending_once() {
        let store = Arc::new(MemoryStore::new());
        let mut fab = fabricator(store.clone()).await;
        fab.add_meme("dark").unwrap();
        fab.add_meme(" DARK ").unwrap();
        fab.put_report("macro", "chosen");
        fab.update_segment(|s| s.density = 0.7).unwrap();
        fab.commit().await.unwrap();
        assert_eq!(fab.pending_count(), 0);

        let id = fab.segment().id;
        let memes = crate::store::get_all::<SegmentMeme>(store.as_ref(), id).await.unwrap();
        assert_eq!(memes.len(), 1);
        let messages = crate::store::get_all::<SegmentMessage>(store.as_ref(), id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].body.contains("macro"));
        assert_eq!(store.get_segment(id).await.unwrap().density, 0.7);
    }

    #[tokio::test]
    async fn test_seconds_at_position_constant_tempo() {
        let mut fab = fabricator(Arc::new(MemoryStore::new())).await;
        assert!((fab.total_seconds() - 8.0).abs() < 1e-9);
        assert_eq!(fab.micros_at_position(4.0), 2_000_000);
        fab.update_segment(|s| s.tempo = 60.0).unwrap();
        assert!((fab.total_seconds() - 16.0).abs() < 1e-9);
    }
}
