//! Boss: decides which chains need work and dispatches chain workers
//!
//! Each tick the boss reads every chain in Fabricate state, refreshes how many
//! seconds of dubbed output it has ahead of now, and dispatches a worker for
//! every chain below its buffer that is not already in flight, not backing off
//! after a failure, and for which a pool permit is free.

use super::chain_worker::{ChainWorker, WorkOutcome};
use super::WorkContext;
use crate::{Error, Result};
use mfab_common::content::ContentSnapshot;
use mfab_common::events::FabricationEvent;
use mfab_common::models::{Chain, ChainState, ChainType};
use mfab_common::time;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct ChainRecord {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    content: Option<(Arc<ContentSnapshot>, Instant)>,
}

pub struct Boss {
    ctx: Arc<WorkContext>,
    permits: Arc<Semaphore>,
    records: Arc<Mutex<HashMap<Uuid, ChainRecord>>>,
}

impl Boss {
    pub fn new(ctx: Arc<WorkContext>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.work.worker_concurrency));
        Self {
            ctx,
            permits,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Periodic loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Boss started (cycle {:?}, {} workers)",
            self.ctx.config.work.boss_cycle(),
            self.ctx.config.work.worker_concurrency
        );
        let mut timer = tokio::time::interval(self.ctx.config.work.boss_cycle());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.tick(&cancel).await {
                        error!("Boss tick failed: {}", e);
                    }
                }
            }
        }
        info!("Boss stopped");
    }

    /// One scheduling pass; returns the number of workers dispatched
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut dispatched = 0;
        for chain in self.ctx.store.chains_in_state(ChainState::Fabricate).await? {
            if cancel.is_cancelled() {
                break;
            }
            if self.ctx.in_flight.is_in_flight(chain.id) || self.in_backoff(chain.id).await {
                continue;
            }
            let chain = match self.refresh_fabricated_ahead(chain.id).await? {
                Some(chain) => chain,
                None => continue,
            };
            if chain.fabricated_ahead_seconds >= self.buffer_seconds(&chain) {
                continue;
            }
            let content = match self.content_for(&chain).await {
                Ok(content) => content,
                Err(e) => {
                    self.record(chain.id, Err(e)).await;
                    continue;
                }
            };
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Worker pool saturated; {} waits for the next tick", chain.ident());
                    break;
                }
            };
            let lease = match self.ctx.in_flight.try_acquire(chain.id) {
                Some(lease) => lease,
                None => continue,
            };
            let chain_id = chain.id;
            let token = lease.token();
            let worker = ChainWorker::new(Arc::clone(&self.ctx), chain, content, lease, cancel.clone());
            let ctx = Arc::clone(&self.ctx);
            let records = Arc::clone(&self.records);
            let dispatch_timeout = self.ctx.config.work.dispatch_timeout();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = match tokio::time::timeout(dispatch_timeout, worker.run_once()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "chain {} worker exceeded {:?}",
                        chain_id, dispatch_timeout
                    ))),
                };
                record_outcome(&ctx, &records, chain_id, result).await;
            });
            self.ctx.in_flight.attach(chain_id, token, handle.abort_handle());
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn buffer_seconds(&self, chain: &Chain) -> f64 {
        match chain.chain_type {
            ChainType::Production => self.ctx.config.work.buffer_production_seconds as f64,
            ChainType::Preview => self.ctx.config.work.buffer_preview_seconds as f64,
        }
    }

    /// Store how far dubbed output reaches past now
    ///
    /// Works on a fresh read of the chain and writes only the figure, so a
    /// state change made meanwhile by a worker survives. `None` once the chain
    /// has left Fabricate.
    async fn refresh_fabricated_ahead(&self, chain_id: Uuid) -> Result<Option<Chain>> {
        let mut chain = self.ctx.store.get_chain(chain_id).await?;
        if chain.state != ChainState::Fabricate {
            debug!("{} left Fabricate before dispatch", chain.ident());
            return Ok(None);
        }
        let reach = match self.ctx.store.read_last_dubbed_segment(chain.id).await? {
            Some(segment) => segment.end_or_begin(),
            None => chain.start_at,
        };
        let ahead = time::seconds_between(time::now(), reach).max(0.0);
        if (ahead - chain.fabricated_ahead_seconds).abs() >= 0.001 {
            self.ctx.store.set_fabricated_ahead(chain.id, ahead).await?;
            chain.fabricated_ahead_seconds = ahead;
        }
        Ok(Some(chain))
    }

    async fn in_backoff(&self, chain_id: Uuid) -> bool {
        let records = self.records.lock().await;
        records
            .get(&chain_id)
            .and_then(|r| r.backoff_until)
            .map_or(false, |until| Instant::now() < until)
    }

    /// Cached snapshot, re-ingested once older than the ingest cycle
    async fn content_for(&self, chain: &Chain) -> Result<Arc<ContentSnapshot>> {
        let cycle = Duration::from_secs(self.ctx.config.work.ingest_cycle_seconds);
        {
            let records = self.records.lock().await;
            if let Some((content, at)) = records.get(&chain.id).and_then(|r| r.content.as_ref()) {
                if at.elapsed() < cycle {
                    return Ok(Arc::clone(content));
                }
            }
        }
        let content = self.ctx.content.snapshot(chain).await?;
        let mut records = self.records.lock().await;
        records.entry(chain.id).or_default().content = Some((Arc::clone(&content), Instant::now()));
        Ok(content)
    }

    async fn record(&self, chain_id: Uuid, result: Result<WorkOutcome>) {
        record_outcome(&self.ctx, &self.records, chain_id, result).await;
    }

    /// Consecutive failures of a chain so far
    pub async fn failures(&self, chain_id: Uuid) -> u32 {
        self.records
            .lock()
            .await
            .get(&chain_id)
            .map_or(0, |r| r.consecutive_failures)
    }
}

/// Reset a chain's failure count on success; on failure back off and, every
/// `stuck_after_failures` failures in a row, report the chain as stuck
async fn record_outcome(
    ctx: &WorkContext,
    records: &Mutex<HashMap<Uuid, ChainRecord>>,
    chain_id: Uuid,
    result: Result<WorkOutcome>,
) {
    let mut records = records.lock().await;
    let record = records.entry(chain_id).or_default();
    match result {
        Ok(outcome) => {
            debug!("Chain {} work done: {:?}", chain_id, outcome);
            record.consecutive_failures = 0;
            record.backoff_until = None;
        }
        Err(e) => {
            record.consecutive_failures += 1;
            record.backoff_until = Some(Instant::now() + ctx.config.work.segment_requeue());
            if !e.is_recoverable() {
                error!("Chain {} hit an unrecoverable error: {}", chain_id, e);
            }
            warn!(
                "Chain {} failed ({} in a row), requeued after {:?}: {}",
                chain_id,
                record.consecutive_failures,
                ctx.config.work.segment_requeue(),
                e
            );
            let threshold = ctx.config.work.stuck_after_failures;
            if record.consecutive_failures % threshold == 0 {
                error!(
                    "Chain {} is stuck after {} consecutive failures: {}",
                    chain_id, record.consecutive_failures, e
                );
                ctx.events.emit(FabricationEvent::ChainStuck {
                    chain_id,
                    consecutive_failures: record.consecutive_failures,
                    last_error: e.to_string(),
                    timestamp: time::now(),
                });
            }
        }
    }
}
