//! Segment state machine
//!
//! ```text
//! Planned → Crafting → Crafted → Dubbing → Dubbed
//!              ↓
//!           Planned (revert after failed craft)
//! ```
//!
//! A move is applied only if the persisted state still equals the expected
//! `from` state. A mismatch means another (stale or duplicate) worker got there
//! first; it is logged and reported as [`Transition::Rejected`], never as an error.

use crate::store::EntityStore;
use crate::{Error, Result};
use mfab_common::models::SegmentState;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a requested state move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Persisted state differed from the expected `from` state
    Rejected { actual: SegmentState },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Move a segment from `from` to `to`
///
/// Illegal pairs are programming errors and return [`Error::InvalidTransition`].
pub async fn transition(
    store: &dyn EntityStore,
    segment_id: Uuid,
    from: SegmentState,
    to: SegmentState,
) -> Result<Transition> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { segment_id, from, to });
    }
    let actual = store.compare_and_set_segment_state(segment_id, from, to).await?;
    if actual == from {
        debug!("Segment {} {} -> {}", segment_id, from, to);
        Ok(Transition::Applied)
    } else {
        warn!(
            "Segment {} transition {} -> {} rejected: state is {}",
            segment_id, from, to, actual
        );
        Ok(Transition::Rejected { actual })
    }
}
