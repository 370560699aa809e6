//! # mfab Engine Library (mfab-engine)
//!
//! Segment fabrication pipeline and worker scheduler.
//!
//! **Purpose:** Continuously fabricate segments for every chain in Fabricate
//! state: craft their musical structure from a content snapshot, dub the
//! result into microsecond-timed audio picks, and ship those to an audio sink.
//!
//! **Architecture:** per-segment [`fabricator::Fabricator`] driven by the
//! [`craft::CraftEngine`] and [`dub::DubEngine`]; the [`work`] module schedules
//! chain workers over any [`store::EntityStore`].

pub mod craft;
pub mod dub;
pub mod error;
pub mod fabricator;
pub mod meme_isometry;
pub mod state_machine;
pub mod store;
pub mod work;

pub use error::{Error, Result};
