//! Sticky buns: per-event random note choices that repeat identically
//!
//! A bun holds one random value per tone of a pattern event. It is stored as
//! segment meta under [`StickyBun::meta_key`] so later segments recover the
//! exact same choice.

use mfab_common::music::Note;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound (exclusive) of each stored value
pub const MAX_VALUE: u32 = 100;

/// Prefix of every sticky bun meta key
pub const META_KEY_PREFIX: &str = "StickyBun_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyBun {
    pub event_id: Uuid,
    pub values: Vec<u32>,
}

impl StickyBun {
    /// New bun with one random value per tone (at least one)
    pub fn random<R: Rng + ?Sized>(event_id: Uuid, tone_count: usize, rng: &mut R) -> Self {
        let values = (0..tone_count.max(1)).map(|_| rng.gen_range(0..MAX_VALUE)).collect();
        Self { event_id, values }
    }

    pub fn meta_key(event_id: Uuid) -> String {
        format!("{}{}", META_KEY_PREFIX, event_id)
    }

    /// Pick the note for tone `index` from the available voicing notes
    pub fn compute(&self, voicing_notes: &[Note], index: usize) -> Option<Note> {
        if voicing_notes.is_empty() || self.values.is_empty() {
            return None;
        }
        let value = self.values[index % self.values.len()] as usize;
        let slot = value * voicing_notes.len() / MAX_VALUE as usize;
        voicing_notes.get(slot.min(voicing_notes.len() - 1)).copied()
    }
}
