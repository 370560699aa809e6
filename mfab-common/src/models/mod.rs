//! Fabrication data model
//!
//! Chains own Segments; Segments own every sub-entity (choices, arrangements,
//! picks, chords, voicings, memes, messages, meta). Sub-entities are plain
//! structs bound together by the [`SegmentEntity`] enum so stores can persist
//! them generically while callers keep static types via [`SegmentScoped`].

pub mod chain;
pub mod entities;
pub mod segment;

pub use chain::*;
pub use entities::*;
pub use segment::*;
