//! # mfab Common Library
//!
//! Shared code for the segment fabrication engine:
//! - Chain, segment and segment sub-entity models
//! - Content snapshot model (programs, sequences, patterns, instruments)
//! - Music theory primitives (notes, keys, chords)
//! - Configuration loading
//! - Event types (FabricationEvent) and the EventBus
//! - Time and UUID helpers

pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod models;
pub mod music;
pub mod time;
pub mod uuid_utils;

pub use error::{Error, Result};
