//! Test helper modules for mfab-engine integration tests
//!
//! - fixture: a small but complete content snapshot
//! - harness: store, work context and chain setup, plus recording sinks
//!   and a store that interferes with a pass in flight

#![allow(dead_code)]

pub mod fixture;
pub mod harness;

pub use fixture::{library, Library};
pub use harness::{FailingContent, FailingSink, Harness, InterferingStore, RecordingSink};
