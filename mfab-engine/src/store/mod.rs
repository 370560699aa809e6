//! Entity store: persistence of chains, segments and segment sub-entities
//!
//! The fabrication pipeline only depends on the [`EntityStore`] trait. Two
//! implementations are provided: [`MemoryStore`] for tests and previews, and
//! [`SqliteStore`] for durable production runs.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfab_common::models::{
    Chain, ChainState, EntityKind, Segment, SegmentEntity, SegmentMeta, SegmentScoped, SegmentState,
};
use std::collections::HashSet;
use uuid::Uuid;

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or replace a chain
    async fn put_chain(&self, chain: &Chain) -> Result<()>;

    async fn get_chain(&self, id: Uuid) -> Result<Chain>;

    async fn chains_in_state(&self, state: ChainState) -> Result<Vec<Chain>>;

    /// Overwrite only a chain's buffered-ahead figure, leaving its state alone
    async fn set_fabricated_ahead(&self, chain_id: Uuid, seconds: f64) -> Result<()>;

    /// Insert a new segment; fails if its (chain, offset) is already occupied
    async fn create_segment(&self, segment: &Segment) -> Result<()>;

    /// Replace an existing segment's attributes
    ///
    /// The persisted state is kept; states only move through
    /// [`EntityStore::compare_and_set_segment_state`].
    async fn put_segment(&self, segment: &Segment) -> Result<()>;

    async fn get_segment(&self, id: Uuid) -> Result<Segment>;

    /// All segments of a chain ordered by offset
    async fn segments_of_chain(&self, chain_id: Uuid) -> Result<Vec<Segment>>;

    async fn read_one_at_chain_offset(&self, chain_id: Uuid, offset: u64) -> Result<Option<Segment>>;

    /// Segment with the highest offset, in any state
    async fn read_last_segment(&self, chain_id: Uuid) -> Result<Option<Segment>>;

    /// Highest-offset segment in one of the given states
    async fn read_last_segment_in(&self, chain_id: Uuid, states: &[SegmentState]) -> Result<Option<Segment>>;

    /// Atomically move a segment from `from` to `to`
    ///
    /// Returns the state found before the swap; the swap was applied only if
    /// that equals `from`.
    async fn compare_and_set_segment_state(
        &self,
        id: Uuid,
        from: SegmentState,
        to: SegmentState,
    ) -> Result<SegmentState>;

    /// Insert or replace a sub-entity of an existing segment
    async fn put_entity(&self, entity: &SegmentEntity) -> Result<()>;

    async fn get_entity(&self, kind: EntityKind, id: Uuid) -> Result<Option<SegmentEntity>>;

    /// Sub-entities of a segment, optionally of one kind, in insertion order
    async fn segment_entities(&self, segment_id: Uuid, kind: Option<EntityKind>) -> Result<Vec<SegmentEntity>>;

    /// Delete segments (and their sub-entities) that ended before `threshold`
    ///
    /// Returns the ids of deleted segments.
    async fn delete_segments_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn put_entities(&self, entities: &[SegmentEntity]) -> Result<()> {
        for entity in entities {
            self.put_entity(entity).await?;
        }
        Ok(())
    }

    /// Last segment whose craft has committed (Crafted, Dubbing or Dubbed)
    async fn read_last_crafted_segment(&self, chain_id: Uuid) -> Result<Option<Segment>> {
        self.read_last_segment_in(
            chain_id,
            &[SegmentState::Crafted, SegmentState::Dubbing, SegmentState::Dubbed],
        )
        .await
    }

    async fn read_last_dubbed_segment(&self, chain_id: Uuid) -> Result<Option<Segment>> {
        self.read_last_segment_in(chain_id, &[SegmentState::Dubbed]).await
    }

    /// Newest meta per key among the chain's segments below `offset`
    ///
    /// Only keys starting with `prefix` are returned. A key stored by several
    /// segments resolves to the one at the highest offset.
    async fn latest_metas_before(&self, chain_id: Uuid, offset: u64, prefix: &str) -> Result<Vec<SegmentMeta>> {
        let mut segments = self.segments_of_chain(chain_id).await?;
        segments.retain(|s| s.offset < offset);
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for segment in segments.iter().rev() {
            for entity in self.segment_entities(segment.id, Some(EntityKind::Meta)).await? {
                if let Some(meta) = SegmentMeta::from_entity(&entity) {
                    if meta.key.starts_with(prefix) && seen.insert(meta.key.clone()) {
                        found.push(meta.clone());
                    }
                }
            }
        }
        Ok(found)
    }
}

/// All sub-entities of type `T` belonging to a segment
pub async fn get_all<T: SegmentScoped>(store: &dyn EntityStore, segment_id: Uuid) -> Result<Vec<T>> {
    Ok(store
        .segment_entities(segment_id, Some(T::KIND))
        .await?
        .iter()
        .filter_map(T::from_entity)
        .cloned()
        .collect())
}

/// Retention key for a segment: its end, or its beginning if never crafted
pub(crate) fn retain_until(segment: &Segment) -> DateTime<Utc> {
    segment.end_or_begin()
}
