//! Worker scheduler: boss, chain workers, janitor and medic
//!
//! The boss, janitor and medic each tick on their own interval. Chain workers
//! are spawned by the boss, at most one per chain and at most
//! `worker_concurrency` at a time.

pub mod boss;
pub mod chain_worker;
pub mod content_source;
pub mod in_flight;
pub mod janitor;
pub mod medic;

pub use boss::Boss;
pub use chain_worker::{ChainWorker, WorkOutcome};
pub use content_source::{ContentSource, JsonFileContent, StaticContent};
pub use in_flight::{InFlight, Lease};
pub use janitor::Janitor;
pub use medic::Medic;

use crate::dub::AudioSink;
use crate::store::EntityStore;
use futures::future::join_all;
use mfab_common::config::FabricationConfig;
use mfab_common::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a worker needs, shared by all of them
pub struct WorkContext {
    pub store: Arc<dyn EntityStore>,
    pub content: Arc<dyn ContentSource>,
    pub sink: Arc<dyn AudioSink>,
    pub config: FabricationConfig,
    pub events: Arc<EventBus>,
    pub in_flight: InFlight,
}

impl WorkContext {
    pub fn new(
        store: Arc<dyn EntityStore>,
        content: Arc<dyn ContentSource>,
        sink: Arc<dyn AudioSink>,
        config: FabricationConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            content,
            sink,
            config,
            events,
            in_flight: InFlight::new(),
        }
    }
}

/// Owns the background loops
pub struct WorkManager {
    ctx: Arc<WorkContext>,
    boss: Arc<Boss>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkManager {
    pub fn new(ctx: Arc<WorkContext>) -> Self {
        let boss = Arc::new(Boss::new(Arc::clone(&ctx)));
        Self {
            ctx,
            boss,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn boss(&self) -> &Arc<Boss> {
        &self.boss
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start(&mut self) {
        let work = &self.ctx.config.work;
        self.handles
            .push(tokio::spawn(Arc::clone(&self.boss).run(self.cancel.clone())));
        if work.janitor_enabled {
            let janitor = Janitor::new(Arc::clone(&self.ctx));
            self.handles.push(tokio::spawn(janitor.run(self.cancel.clone())));
        }
        if work.medic_enabled {
            let medic = Medic::new(Arc::clone(&self.ctx));
            self.handles.push(tokio::spawn(medic.run(self.cancel.clone())));
        }
        info!("Work manager started {} loops", self.handles.len());
    }

    /// Stop the loops, then wait up to `grace` for in-flight chain work
    ///
    /// Workers see the cancellation at their next phase boundary.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!("Work loop ended abnormally: {}", e);
            }
        }
        if !self.ctx.in_flight.wait_idle(grace).await {
            warn!(
                "{} chain workers still running after {:?}",
                self.ctx.in_flight.len(),
                grace
            );
        }
        info!("Work manager stopped");
    }
}
