//! Chain worker: advances one chain by one segment
//!
//! The worker resumes whatever the chain's last segment needs:
//!
//! | Last segment | Action                                  |
//! |--------------|-----------------------------------------|
//! | none         | create the Initial segment, then craft  |
//! | Planned      | craft                                   |
//! | Crafting     | revert to Planned (stale), then craft   |
//! | Crafted      | dub                                     |
//! | Dubbing      | ship again, reusing the committed picks |
//! | Dubbed       | create the next segment, or complete    |

use super::in_flight::Lease;
use super::WorkContext;
use crate::craft::CraftEngine;
use crate::dub::DubEngine;
use crate::fabricator::{Fabricator, Retrospective};
use crate::state_machine::{transition, Transition};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use mfab_common::content::ContentSnapshot;
use mfab_common::events::FabricationEvent;
use mfab_common::models::{
    Chain, ChainState, MessageSeverity, Segment, SegmentMessage, SegmentScoped, SegmentState,
};
use mfab_common::time;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of one unit of chain work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Segment fully crafted and dubbed
    Dubbed { offset: u64, pick_count: usize },
    /// Chain reached its stop time and was completed
    Completed,
    /// Nothing done: cancelled, or another worker moved the segment first
    Skipped,
}

pub struct ChainWorker {
    ctx: Arc<WorkContext>,
    chain: Chain,
    content: Arc<ContentSnapshot>,
    lease: Lease,
    cancel: CancellationToken,
}

impl ChainWorker {
    pub fn new(
        ctx: Arc<WorkContext>,
        chain: Chain,
        content: Arc<ContentSnapshot>,
        lease: Lease,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            chain,
            content,
            lease,
            cancel,
        }
    }

    pub async fn run_once(mut self) -> Result<WorkOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(WorkOutcome::Skipped);
        }
        self.lease.beat("resume");
        let store = self.ctx.store.as_ref();
        let mut segment = match store.read_last_segment(self.chain.id).await? {
            None => self.create_segment(0, self.chain.start_at, 0).await?,
            Some(last) if last.state == SegmentState::Dubbed => {
                let begin_at = last.end_or_begin();
                if self.chain.stop_at.map_or(false, |stop| begin_at >= stop) {
                    self.complete_chain().await?;
                    return Ok(WorkOutcome::Completed);
                }
                self.create_segment(last.offset + 1, begin_at, last.next_delta()).await?
            }
            Some(last) => last,
        };

        if segment.state == SegmentState::Crafting {
            warn!(
                "{} segment {}: found stale Crafting state, reverting",
                self.chain.ident(),
                segment.offset
            );
            if !self.move_state(&segment, SegmentState::Crafting, SegmentState::Planned).await? {
                return Ok(WorkOutcome::Skipped);
            }
            segment.state = SegmentState::Planned;
        }

        if segment.state == SegmentState::Planned {
            if !self.craft(&segment).await? {
                return Ok(WorkOutcome::Skipped);
            }
            segment.state = SegmentState::Crafted;
        }

        if self.cancel.is_cancelled() {
            return Ok(WorkOutcome::Skipped);
        }

        if segment.state == SegmentState::Crafted {
            if !self.move_state(&segment, SegmentState::Crafted, SegmentState::Dubbing).await? {
                return Ok(WorkOutcome::Skipped);
            }
            segment.state = SegmentState::Dubbing;
        }

        if segment.state == SegmentState::Dubbing {
            let pick_count = self.dub(&segment).await?;
            return Ok(WorkOutcome::Dubbed {
                offset: segment.offset,
                pick_count,
            });
        }
        Ok(WorkOutcome::Skipped)
    }

    async fn create_segment(&self, offset: u64, begin_at: DateTime<Utc>, delta: u64) -> Result<Segment> {
        let retrospective = Retrospective::load(self.ctx.store.as_ref(), self.chain.id, offset).await?;
        let segment_type = retrospective.compute_type(offset, &self.content);
        let mut segment = Segment::planned(&self.chain, offset, segment_type, begin_at)?;
        segment.delta = delta;
        self.ctx.store.create_segment(&segment).await?;
        info!(
            "{} segment {}: planned {:?} at {}",
            self.chain.ident(),
            offset,
            segment_type,
            begin_at
        );
        self.ctx.events.emit(FabricationEvent::SegmentCreated {
            chain_id: self.chain.id,
            segment_id: segment.id,
            offset,
            timestamp: time::now(),
        });
        Ok(segment)
    }

    async fn complete_chain(&mut self) -> Result<()> {
        self.chain.transition(ChainState::Complete)?;
        self.ctx.store.put_chain(&self.chain).await?;
        info!("Chain {} reached its stop time; complete", self.chain.ident());
        self.ctx.events.emit(FabricationEvent::ChainCompleted {
            chain_id: self.chain.id,
            timestamp: time::now(),
        });
        Ok(())
    }

    /// Apply a state move; false if another worker got there first
    async fn move_state(&self, segment: &Segment, from: SegmentState, to: SegmentState) -> Result<bool> {
        match transition(self.ctx.store.as_ref(), segment.id, from, to).await? {
            Transition::Applied => Ok(true),
            Transition::Rejected { .. } => Ok(false),
        }
    }

    /// Planned → Crafting → Crafted; reverted to Planned on failure or shutdown
    async fn craft(&self, segment: &Segment) -> Result<bool> {
        self.lease.beat("craft");
        if !self.move_state(segment, SegmentState::Planned, SegmentState::Crafting).await? {
            return Ok(false);
        }
        let attempt = async {
            let mut fab = Fabricator::new(
                Arc::clone(&self.ctx.store),
                Arc::clone(&self.content),
                self.chain.clone(),
                segment.clone(),
                self.ctx.config.fabrication.clone(),
            )
            .await?;
            let engine = CraftEngine::new(&self.ctx.config.fabrication);
            let progress = |phase: &'static str| self.lease.beat(phase);
            engine.craft(&mut fab, &self.cancel, &progress).await
        };
        match attempt.await {
            Ok(()) => {
                self.move_state(segment, SegmentState::Crafting, SegmentState::Crafted).await?;
                self.ctx.events.emit(FabricationEvent::SegmentCrafted {
                    chain_id: self.chain.id,
                    segment_id: segment.id,
                    offset: segment.offset,
                    timestamp: time::now(),
                });
                Ok(true)
            }
            Err(Error::Cancelled(reason)) => {
                info!(
                    "{} segment {}: craft cancelled {}, reverting to Planned",
                    self.chain.ident(),
                    segment.offset,
                    reason
                );
                self.move_state(segment, SegmentState::Crafting, SegmentState::Planned).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "{} segment {}: craft failed, reverting to Planned: {}",
                    self.chain.ident(),
                    segment.offset,
                    e
                );
                self.move_state(segment, SegmentState::Crafting, SegmentState::Planned).await?;
                self.report_failure(segment, &e).await;
                self.ctx.events.emit(FabricationEvent::CraftFailed {
                    chain_id: self.chain.id,
                    segment_id: segment.id,
                    offset: segment.offset,
                    error: e.to_string(),
                    timestamp: time::now(),
                });
                Err(e)
            }
        }
    }

    /// Pick (once) and ship; Dubbing → Dubbed on success, left in Dubbing on failure
    async fn dub(&self, segment: &Segment) -> Result<usize> {
        self.lease.beat("dub");
        let attempt = async {
            let crafted = self.ctx.store.get_segment(segment.id).await?;
            let mut fab = Fabricator::new(
                Arc::clone(&self.ctx.store),
                Arc::clone(&self.content),
                self.chain.clone(),
                crafted,
                self.ctx.config.fabrication.clone(),
            )
            .await?;
            let engine = DubEngine::new(Arc::clone(&self.ctx.sink), self.ctx.config.work.sink_timeout());
            engine.dub(&mut fab).await
        };
        match attempt.await {
            Ok(picks) => {
                if self.move_state(segment, SegmentState::Dubbing, SegmentState::Dubbed).await? {
                    info!(
                        "{} segment {}: dubbed {} picks",
                        self.chain.ident(),
                        segment.offset,
                        picks.len()
                    );
                    self.ctx.events.emit(FabricationEvent::SegmentDubbed {
                        chain_id: self.chain.id,
                        segment_id: segment.id,
                        offset: segment.offset,
                        pick_count: picks.len(),
                        timestamp: time::now(),
                    });
                }
                Ok(picks.len())
            }
            Err(e) => {
                warn!(
                    "{} segment {}: dub failed, will retry: {}",
                    self.chain.ident(),
                    segment.offset,
                    e
                );
                self.report_failure(segment, &e).await;
                self.ctx.events.emit(FabricationEvent::DubFailed {
                    chain_id: self.chain.id,
                    segment_id: segment.id,
                    offset: segment.offset,
                    error: e.to_string(),
                    timestamp: time::now(),
                });
                Err(e)
            }
        }
    }

    /// Attach the failure to the segment; a store error here is only logged
    async fn report_failure(&self, segment: &Segment, error: &Error) {
        let message = SegmentMessage::new(segment.id, MessageSeverity::Error, error.to_string());
        if let Err(e) = self.ctx.store.put_entity(&message.into_entity()).await {
            warn!(
                "{} segment {}: could not record failure: {}",
                self.chain.ident(),
                segment.offset,
                e
            );
        }
    }
}
