//! Medic: restarts chain workers that stopped making progress

use super::WorkContext;
use mfab_common::events::FabricationEvent;
use mfab_common::time;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Medic {
    ctx: Arc<WorkContext>,
}

impl Medic {
    pub fn new(ctx: Arc<WorkContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Medic started (cycle {:?}, heartbeat timeout {}s)",
            self.ctx.config.work.medic_cycle(),
            self.ctx.config.work.medic_heartbeat_timeout_seconds
        );
        let mut timer = tokio::time::interval(self.ctx.config.work.medic_cycle());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }
        info!("Medic stopped");
    }

    /// Abort stalled workers and free their chains; returns how many
    pub fn tick(&self) -> usize {
        let timeout = Duration::from_secs(self.ctx.config.work.medic_heartbeat_timeout_seconds);
        let reaped = self.ctx.in_flight.reap_stalled(timeout);
        for stalled in &reaped {
            warn!(
                "Chain {} worker stalled in {} for {:?} (running {:?}); restarting",
                stalled.chain_id, stalled.phase, stalled.stalled_for, stalled.running_for
            );
            self.ctx.events.emit(FabricationEvent::WorkerRestarted {
                chain_id: stalled.chain_id,
                stalled_seconds: stalled.stalled_for.as_secs_f64(),
                timestamp: time::now(),
            });
        }
        reaped.len()
    }
}
