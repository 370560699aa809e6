//! Segment: one fixed-duration slice of a chain's output

use super::chain::Chain;
use crate::{time, uuid_utils, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a segment relates to its predecessor's macro and main choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentType {
    /// First segment of a chain
    Initial,
    /// Same main program, next sequence binding
    Continue,
    /// Same macro program advanced; new main program
    NextMain,
    /// New macro and main programs
    NextMacro,
}

/// Segment lifecycle
///
/// ```text
/// Planned → Crafting → Crafted → Dubbing → Dubbed
///              ↓
///           Planned (revert after failed craft)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    Planned,
    Crafting,
    Crafted,
    Dubbing,
    Dubbed,
}

impl SegmentState {
    /// Whether `self → to` is a legal lifecycle move
    pub fn can_transition_to(self, to: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, to),
            (Planned, Crafting)
                | (Crafting, Crafted)
                | (Crafting, Planned)
                | (Crafted, Dubbing)
                | (Dubbing, Dubbed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Planned => "Planned",
            SegmentState::Crafting => "Crafting",
            SegmentState::Crafted => "Crafted",
            SegmentState::Dubbing => "Dubbing",
            SegmentState::Dubbed => "Dubbed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Planned" => Ok(SegmentState::Planned),
            "Crafting" => Ok(SegmentState::Crafting),
            "Crafted" => Ok(SegmentState::Crafted),
            "Dubbing" => Ok(SegmentState::Dubbing),
            "Dubbed" => Ok(SegmentState::Dubbed),
            other => Err(Error::Validation(format!("unknown segment state {:?}", other))),
        }
    }
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub chain_id: Uuid,
    /// 0-based, unique and contiguous per chain
    pub offset: u64,
    pub segment_type: SegmentType,
    pub state: SegmentState,
    pub begin_at: DateTime<Utc>,
    /// Unknown until craft computes the duration
    pub end_at: Option<DateTime<Utc>>,
    pub duration_micros: Option<u64>,
    pub key: String,
    /// Length in beats
    pub total: u32,
    /// Beats of the chain before this segment
    #[serde(default)]
    pub delta: u64,
    pub density: f64,
    /// Beats per minute
    pub tempo: f64,
    pub storage_key: String,
    pub output_encoder: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    /// New Planned segment for a chain at the given offset
    pub fn planned(
        chain: &Chain,
        offset: u64,
        segment_type: SegmentType,
        begin_at: DateTime<Utc>,
    ) -> Result<Self> {
        let now = time::now();
        let segment = Self {
            id: uuid_utils::generate(),
            chain_id: chain.id,
            offset,
            segment_type,
            state: SegmentState::Planned,
            begin_at,
            end_at: None,
            duration_micros: None,
            key: String::new(),
            total: 0,
            delta: 0,
            density: 0.0,
            tempo: 0.0,
            storage_key: format!("{}-{}", chain.ident(), offset),
            output_encoder: chain.config.output_encoding.clone(),
            created_at: now,
            updated_at: now,
        };
        segment.validate()?;
        Ok(segment)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_key.is_empty() {
            return Err(Error::Validation(format!(
                "Segment[{}] storage key is required",
                self.offset
            )));
        }
        if !self.tempo.is_finite() || self.tempo < 0.0 {
            return Err(Error::Validation(format!(
                "Segment[{}] tempo {} is invalid",
                self.offset, self.tempo
            )));
        }
        if !self.density.is_finite() {
            return Err(Error::Validation(format!(
                "Segment[{}] density is invalid",
                self.offset
            )));
        }
        if let Some(end_at) = self.end_at {
            if end_at < self.begin_at {
                return Err(Error::Validation(format!(
                    "Segment[{}] ends before it begins",
                    self.offset
                )));
            }
        }
        Ok(())
    }

    /// Total duration in microseconds, zero until crafted
    pub fn total_micros(&self) -> u64 {
        self.duration_micros.unwrap_or(0)
    }

    /// Chain beat at which the following segment starts
    pub fn next_delta(&self) -> u64 {
        self.delta + self.total as u64
    }

    /// End-at if known, else begin-at
    pub fn end_or_begin(&self) -> DateTime<Utc> {
        self.end_at.unwrap_or(self.begin_at)
    }
}
