//! Janitor: erases segments older than the retention horizon

use super::WorkContext;
use crate::Result;
use chrono::Duration as ChronoDuration;
use mfab_common::events::FabricationEvent;
use mfab_common::time;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Janitor {
    ctx: Arc<WorkContext>,
}

impl Janitor {
    pub fn new(ctx: Arc<WorkContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Janitor started (cycle {:?}, erasing after {}s)",
            self.ctx.config.work.janitor_cycle(),
            self.ctx.config.work.erase_segments_older_than_seconds
        );
        let mut timer = tokio::time::interval(self.ctx.config.work.janitor_cycle());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Janitor pass failed: {}", e);
                    }
                }
            }
        }
        info!("Janitor stopped");
    }

    /// Delete every segment that ended before the horizon; returns how many
    pub async fn tick(&self) -> Result<usize> {
        let horizon = ChronoDuration::seconds(self.ctx.config.work.erase_segments_older_than_seconds as i64);
        let older_than = time::now() - horizon;
        let erased = self.ctx.store.delete_segments_older_than(older_than).await?;
        if erased.is_empty() {
            debug!("Janitor: nothing older than {}", older_than);
            return Ok(0);
        }
        info!("Janitor erased {} segments older than {}", erased.len(), older_than);
        self.ctx.events.emit(FabricationEvent::SegmentsErased {
            count: erased.len(),
            older_than,
            timestamp: time::now(),
        });
        Ok(erased.len())
    }
}
