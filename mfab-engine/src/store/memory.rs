//! In-memory entity store

use super::{retain_until, EntityStore};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfab_common::models::{Chain, ChainState, EntityKind, Segment, SegmentEntity, SegmentState};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    chains: HashMap<Uuid, Chain>,
    segments: HashMap<Uuid, Segment>,
    /// (chain, offset) → segment id
    offsets: BTreeMap<(Uuid, u64), Uuid>,
    /// segment id → sub-entities in insertion order
    entities: HashMap<Uuid, Vec<SegmentEntity>>,
}

/// Entity store held entirely in process memory
///
/// Every call takes the table lock once, so each operation is atomic with
/// respect to concurrent workers.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn segment_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("Segment {}", id))
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn put_chain(&self, chain: &Chain) -> Result<()> {
        chain.validate()?;
        self.tables.write().await.chains.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Chain> {
        self.tables
            .read()
            .await
            .chains
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Chain {}", id)))
    }

    async fn set_fabricated_ahead(&self, chain_id: Uuid, seconds: f64) -> Result<()> {
        let mut tables = self.tables.write().await;
        let chain = tables
            .chains
            .get_mut(&chain_id)
            .ok_or_else(|| Error::NotFound(format!("Chain {}", chain_id)))?;
        chain.fabricated_ahead_seconds = seconds;
        Ok(())
    }

    async fn chains_in_state(&self, state: ChainState) -> Result<Vec<Chain>> {
        let tables = self.tables.read().await;
        let mut chains: Vec<Chain> = tables
            .chains
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect();
        chains.sort_by_key(|c| c.start_at);
        Ok(chains)
    }

    async fn create_segment(&self, segment: &Segment) -> Result<()> {
        segment.validate()?;
        let mut tables = self.tables.write().await;
        if !tables.chains.contains_key(&segment.chain_id) {
            return Err(Error::NotFound(format!("Chain {}", segment.chain_id)));
        }
        let key = (segment.chain_id, segment.offset);
        if tables.offsets.contains_key(&key) {
            return Err(Error::Validation(format!(
                "Chain {} already has a segment at offset {}",
                segment.chain_id, segment.offset
            )));
        }
        tables.offsets.insert(key, segment.id);
        tables.segments.insert(segment.id, segment.clone());
        Ok(())
    }

    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        segment.validate()?;
        let mut tables = self.tables.write().await;
        let existing = tables
            .segments
            .get_mut(&segment.id)
            .ok_or_else(|| segment_not_found(segment.id))?;
        if existing.chain_id != segment.chain_id || existing.offset != segment.offset {
            return Err(Error::Validation(format!(
                "Segment {} chain and offset are immutable",
                segment.id
            )));
        }
        let state = existing.state;
        *existing = segment.clone();
        existing.state = state;
        Ok(())
    }

    async fn get_segment(&self, id: Uuid) -> Result<Segment> {
        self.tables
            .read()
            .await
            .segments
            .get(&id)
            .cloned()
            .ok_or_else(|| segment_not_found(id))
    }

    async fn segments_of_chain(&self, chain_id: Uuid) -> Result<Vec<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .offsets
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .filter_map(|(_, id)| tables.segments.get(id).cloned())
            .collect())
    }

    async fn read_one_at_chain_offset(&self, chain_id: Uuid, offset: u64) -> Result<Option<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .offsets
            .get(&(chain_id, offset))
            .and_then(|id| tables.segments.get(id).cloned()))
    }

    async fn read_last_segment(&self, chain_id: Uuid) -> Result<Option<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .offsets
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .next_back()
            .and_then(|(_, id)| tables.segments.get(id).cloned()))
    }

    async fn read_last_segment_in(&self, chain_id: Uuid, states: &[SegmentState]) -> Result<Option<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .offsets
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .rev()
            .filter_map(|(_, id)| tables.segments.get(id))
            .find(|s| states.contains(&s.state))
            .cloned())
    }

    async fn compare_and_set_segment_state(
        &self,
        id: Uuid,
        from: SegmentState,
        to: SegmentState,
    ) -> Result<SegmentState> {
        let mut tables = self.tables.write().await;
        let segment = tables.segments.get_mut(&id).ok_or_else(|| segment_not_found(id))?;
        let actual = segment.state;
        if actual == from {
            segment.state = to;
            segment.updated_at = Utc::now();
        }
        Ok(actual)
    }

    async fn put_entity(&self, entity: &SegmentEntity) -> Result<()> {
        entity.validate()?;
        let mut tables = self.tables.write().await;
        let segment_id = entity.segment_id();
        if !tables.segments.contains_key(&segment_id) {
            return Err(segment_not_found(segment_id));
        }
        let rows = tables.entities.entry(segment_id).or_default();
        match rows.iter_mut().find(|e| e.id() == entity.id()) {
            Some(existing) => *existing = entity.clone(),
            None => rows.push(entity.clone()),
        }
        Ok(())
    }

    async fn get_entity(&self, kind: EntityKind, id: Uuid) -> Result<Option<SegmentEntity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .entities
            .values()
            .flatten()
            .find(|e| e.id() == id && e.kind() == kind)
            .cloned())
    }

    async fn segment_entities(&self, segment_id: Uuid, kind: Option<EntityKind>) -> Result<Vec<SegmentEntity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .entities
            .get(&segment_id)
            .map(|rows| {
                rows.iter()
                    .filter(|e| kind.map_or(true, |k| e.kind() == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_segments_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tables = self.tables.write().await;
        let expired: Vec<(Uuid, Uuid, u64)> = tables
            .segments
            .values()
            .filter(|s| retain_until(s) < threshold)
            .map(|s| (s.id, s.chain_id, s.offset))
            .collect();
        for (id, chain_id, offset) in &expired {
            tables.segments.remove(id);
            tables.offsets.remove(&(*chain_id, *offset));
            tables.entities.remove(id);
        }
        Ok(expired.into_iter().map(|(id, _, _)| id).collect())
    }
}
