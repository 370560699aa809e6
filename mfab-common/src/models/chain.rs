//! Chain: one ongoing fabrication job

use crate::{uuid_utils, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainType {
    Production,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainState {
    Draft,
    Ready,
    Fabricate,
    Complete,
    Failed,
}

impl ChainState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainState::Complete | ChainState::Failed)
    }

    /// Whether a chain may move from `self` to `to`
    pub fn can_transition_to(self, to: ChainState) -> bool {
        use ChainState::*;
        matches!(
            (self, to),
            (Draft, Ready)
                | (Ready, Fabricate)
                | (Fabricate, Complete)
                | (Draft, Failed)
                | (Ready, Failed)
                | (Fabricate, Failed)
        )
    }
}

impl std::fmt::Display for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Output settings carried by every chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub output_encoding: String,
    pub output_channels: u16,
    pub output_sample_rate: u32,
    pub output_frame_rate: u32,
    pub delta_arc_enabled: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            output_encoding: "PCM_SIGNED".to_string(),
            output_channels: 2,
            output_sample_rate: 48_000,
            output_frame_rate: 48_000,
            delta_arc_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: Uuid,
    pub account_id: Uuid,
    pub template_key: String,
    pub name: String,
    pub chain_type: ChainType,
    pub state: ChainState,
    pub start_at: DateTime<Utc>,
    pub stop_at: Option<DateTime<Utc>>,
    /// Seconds of dubbed output ahead of "now", refreshed by the scheduler
    pub fabricated_ahead_seconds: f64,
    pub config: ChainConfig,
}

impl Chain {
    /// Create a Draft chain; rejects an empty name
    pub fn new(
        account_id: Uuid,
        name: &str,
        chain_type: ChainType,
        start_at: DateTime<Utc>,
    ) -> Result<Self> {
        let chain = Self {
            id: uuid_utils::generate(),
            account_id,
            template_key: String::new(),
            name: name.trim().to_string(),
            chain_type,
            state: ChainState::Draft,
            start_at,
            stop_at: None,
            fabricated_ahead_seconds: 0.0,
            config: ChainConfig::default(),
        };
        chain.validate()?;
        Ok(chain)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("Chain name is required".to_string()));
        }
        if let Some(stop_at) = self.stop_at {
            if stop_at <= self.start_at {
                return Err(Error::Validation(format!(
                    "Chain[{}] stop-at must be after start-at",
                    self.ident()
                )));
            }
        }
        if self.config.output_channels == 0 || self.config.output_sample_rate == 0 {
            return Err(Error::Validation(format!(
                "Chain[{}] output channels and sample rate must be non-zero",
                self.ident()
            )));
        }
        Ok(())
    }

    /// Move to another lifecycle state, rejecting illegal moves
    pub fn transition(&mut self, to: ChainState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::Validation(format!(
                "Chain[{}] cannot transition from {} to {}",
                self.ident(),
                self.state,
                to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Identifier for logs and storage keys: template key if set, else a short id
    pub fn ident(&self) -> String {
        if self.template_key.is_empty() {
            uuid_utils::short(&self.id)
        } else {
            self.template_key.clone()
        }
    }
}
