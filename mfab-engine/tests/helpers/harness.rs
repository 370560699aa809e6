//! Work context and chain setup for integration tests

use super::fixture::{library, Library};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfab_common::config::FabricationConfig;
use mfab_common::content::ContentSnapshot;
use mfab_common::events::EventBus;
use mfab_common::models::{
    Chain, ChainState, ChainType, EntityKind, Segment, SegmentChoiceArrangementPick, SegmentEntity,
    SegmentState,
};
use mfab_common::time;
use mfab_engine::dub::AudioSink;
use mfab_engine::store::{EntityStore, MemoryStore};
use mfab_engine::work::{ChainWorker, ContentSource, StaticContent, WorkContext, WorkOutcome};
use mfab_engine::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Remembers every shipped segment and its pick count
#[derive(Default)]
pub struct RecordingSink {
    shipped: Mutex<Vec<(String, usize)>>,
}

impl RecordingSink {
    pub fn shipped(&self) -> Vec<(String, usize)> {
        self.shipped.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn ship(&self, segment: &Segment, picks: &[SegmentChoiceArrangementPick]) -> Result<()> {
        self.shipped
            .lock()
            .unwrap()
            .push((segment.storage_key.clone(), picks.len()));
        Ok(())
    }
}

/// Rejects every segment
pub struct FailingSink;

#[async_trait]
impl AudioSink for FailingSink {
    async fn ship(&self, segment: &Segment, _picks: &[SegmentChoiceArrangementPick]) -> Result<()> {
        Err(Error::Dub(format!("{} refused", segment.storage_key)))
    }
}

/// Memory store that lets a test act in the middle of a worker or boss pass
#[derive(Default)]
pub struct InterferingStore {
    inner: MemoryStore,
    cancel_on_crafting: Option<CancellationToken>,
    complete_when_listed: bool,
}

impl InterferingStore {
    /// Cancels `cancel` as soon as any segment moves to Crafting
    pub fn cancelling_on_crafting(cancel: CancellationToken) -> Self {
        Self {
            cancel_on_crafting: Some(cancel),
            ..Self::default()
        }
    }

    /// Completes each chain right after it is listed as fabricating
    pub fn completing_listed_chains() -> Self {
        Self {
            complete_when_listed: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl EntityStore for InterferingStore {
    async fn put_chain(&self, chain: &Chain) -> Result<()> {
        self.inner.put_chain(chain).await
    }

    async fn get_chain(&self, id: Uuid) -> Result<Chain> {
        self.inner.get_chain(id).await
    }

    async fn chains_in_state(&self, state: ChainState) -> Result<Vec<Chain>> {
        let chains = self.inner.chains_in_state(state).await?;
        if self.complete_when_listed && state == ChainState::Fabricate {
            for chain in &chains {
                let mut done = chain.clone();
                done.transition(ChainState::Complete)?;
                self.inner.put_chain(&done).await?;
            }
        }
        Ok(chains)
    }

    async fn set_fabricated_ahead(&self, chain_id: Uuid, seconds: f64) -> Result<()> {
        self.inner.set_fabricated_ahead(chain_id, seconds).await
    }

    async fn create_segment(&self, segment: &Segment) -> Result<()> {
        self.inner.create_segment(segment).await
    }

    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        self.inner.put_segment(segment).await
    }

    async fn get_segment(&self, id: Uuid) -> Result<Segment> {
        self.inner.get_segment(id).await
    }

    async fn segments_of_chain(&self, chain_id: Uuid) -> Result<Vec<Segment>> {
        self.inner.segments_of_chain(chain_id).await
    }

    async fn read_one_at_chain_offset(&self, chain_id: Uuid, offset: u64) -> Result<Option<Segment>> {
        self.inner.read_one_at_chain_offset(chain_id, offset).await
    }

    async fn read_last_segment(&self, chain_id: Uuid) -> Result<Option<Segment>> {
        self.inner.read_last_segment(chain_id).await
    }

    async fn read_last_segment_in(&self, chain_id: Uuid, states: &[SegmentState]) -> Result<Option<Segment>> {
        self.inner.read_last_segment_in(chain_id, states).await
    }

    async fn compare_and_set_segment_state(
        &self,
        id: Uuid,
        from: SegmentState,
        to: SegmentState,
    ) -> Result<SegmentState> {
        let before = self.inner.compare_and_set_segment_state(id, from, to).await?;
        if before == from && to == SegmentState::Crafting {
            if let Some(cancel) = &self.cancel_on_crafting {
                cancel.cancel();
            }
        }
        Ok(before)
    }

    async fn put_entity(&self, entity: &SegmentEntity) -> Result<()> {
        self.inner.put_entity(entity).await
    }

    async fn get_entity(&self, kind: EntityKind, id: Uuid) -> Result<Option<SegmentEntity>> {
        self.inner.get_entity(kind, id).await
    }

    async fn segment_entities(&self, segment_id: Uuid, kind: Option<EntityKind>) -> Result<Vec<SegmentEntity>> {
        self.inner.segment_entities(segment_id, kind).await
    }

    async fn delete_segments_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.inner.delete_segments_older_than(threshold).await
    }
}

/// Content source that cannot be reached
pub struct FailingContent;

#[async_trait]
impl ContentSource for FailingContent {
    async fn snapshot(&self, chain: &Chain) -> Result<Arc<ContentSnapshot>> {
        Err(Error::Ingest(format!("no content for {}", chain.ident())))
    }
}

pub struct Harness {
    pub library: Library,
    pub content: Arc<ContentSnapshot>,
    pub store: Arc<dyn EntityStore>,
    pub sink: Arc<RecordingSink>,
    pub events: Arc<EventBus>,
    pub ctx: Arc<WorkContext>,
}

impl Harness {
    /// In-memory store, fixture content and default configuration
    pub fn new() -> Self {
        Self::with(Arc::new(MemoryStore::new()), FabricationConfig::default())
    }

    pub fn with_config(config: FabricationConfig) -> Self {
        Self::with(Arc::new(MemoryStore::new()), config)
    }

    pub fn with(store: Arc<dyn EntityStore>, config: FabricationConfig) -> Self {
        let library = library();
        let content = Arc::new(library.content.clone());
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventBus::default());
        let ctx = Arc::new(WorkContext::new(
            Arc::clone(&store),
            Arc::new(StaticContent::new(library.content.clone())),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            config,
            Arc::clone(&events),
        ));
        Self {
            library,
            content,
            store,
            sink,
            events,
            ctx,
        }
    }

    /// Same store and content, different sink
    pub fn context_with_sink(&self, sink: Arc<dyn AudioSink>) -> Arc<WorkContext> {
        Arc::new(WorkContext::new(
            Arc::clone(&self.store),
            Arc::new(StaticContent::new(self.library.content.clone())),
            sink,
            self.ctx.config.clone(),
            Arc::clone(&self.events),
        ))
    }

    /// Production chain in Fabricate state, stored
    pub async fn fabricating_chain(&self, name: &str, start_at: DateTime<Utc>) -> Chain {
        self.chain_stopping_at(name, start_at, None).await
    }

    pub async fn chain_stopping_at(&self, name: &str, start_at: DateTime<Utc>, stop_at: Option<DateTime<Utc>>) -> Chain {
        let mut chain = Chain::new(Uuid::new_v4(), name, ChainType::Production, start_at).unwrap();
        chain.stop_at = stop_at;
        chain.transition(ChainState::Ready).unwrap();
        chain.transition(ChainState::Fabricate).unwrap();
        self.store.put_chain(&chain).await.unwrap();
        chain
    }

    /// One unit of work on a chain, the way the boss would run it
    pub async fn work_once(&self, chain_id: Uuid) -> Result<WorkOutcome> {
        self.work_once_in(&self.ctx, chain_id).await
    }

    pub async fn work_once_in(&self, ctx: &Arc<WorkContext>, chain_id: Uuid) -> Result<WorkOutcome> {
        self.run_worker(ctx, chain_id, Arc::clone(&self.content), CancellationToken::new())
            .await
    }

    /// One unit of work crafting from other content
    pub async fn work_once_with(&self, chain_id: Uuid, content: ContentSnapshot) -> Result<WorkOutcome> {
        self.run_worker(&self.ctx, chain_id, Arc::new(content), CancellationToken::new())
            .await
    }

    pub async fn run_worker(
        &self,
        ctx: &Arc<WorkContext>,
        chain_id: Uuid,
        content: Arc<ContentSnapshot>,
        cancel: CancellationToken,
    ) -> Result<WorkOutcome> {
        let chain = self.store.get_chain(chain_id).await?;
        let lease = ctx
            .in_flight
            .try_acquire(chain_id)
            .expect("chain is not already in flight");
        let worker = ChainWorker::new(
            Arc::clone(ctx),
            chain,
            content,
            lease,
            cancel,
        );
        worker.run_once().await
    }

    /// Run until `count` segments are dubbed
    pub async fn fabricate(&self, chain_id: Uuid, count: usize) -> Vec<Segment> {
        for _ in 0..count {
            let outcome = self.work_once(chain_id).await.unwrap();
            assert!(
                matches!(outcome, WorkOutcome::Dubbed { .. }),
                "unexpected outcome {:?}",
                outcome
            );
        }
        self.store.segments_of_chain(chain_id).await.unwrap()
    }
}

/// A start time far enough back that nothing fabricated is "ahead"
pub fn long_ago() -> DateTime<Utc> {
    time::now() - chrono::Duration::days(10)
}
