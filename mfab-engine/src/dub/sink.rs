//! Audio sinks: where a dubbed segment's picks are shipped

use crate::Result;
use async_trait::async_trait;
use mfab_common::models::{Segment, SegmentChoiceArrangementPick};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Receives the ordered picks of a dubbed segment
///
/// Shipping the same segment twice must be harmless; dub retries resend
/// without re-picking.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn ship(&self, segment: &Segment, picks: &[SegmentChoiceArrangementPick]) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn ship(&self, segment: &Segment, picks: &[SegmentChoiceArrangementPick]) -> Result<()> {
        debug!("Discarding {} picks of {}", picks.len(), segment.storage_key);
        Ok(())
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    segment: &'a Segment,
    picks: &'a [SegmentChoiceArrangementPick],
}

/// Writes `<storage_key>.json` (segment plus ordered picks) to a directory
#[derive(Debug, Clone)]
pub struct JsonManifestSink {
    output_dir: PathBuf,
}

impl JsonManifestSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn manifest_path(&self, segment: &Segment) -> PathBuf {
        self.output_dir.join(format!("{}.json", segment.storage_key))
    }
}

#[async_trait]
impl AudioSink for JsonManifestSink {
    async fn ship(&self, segment: &Segment, picks: &[SegmentChoiceArrangementPick]) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let body = serde_json::to_vec_pretty(&Manifest { segment, picks })?;
        let path = self.manifest_path(segment);
        // write then rename, so readers never see a partial manifest
        let partial = path.with_extension("json.partial");
        tokio::fs::write(&partial, body).await?;
        tokio::fs::rename(&partial, &path).await?;
        info!("Shipped {} picks to {}", picks.len(), path.display());
        Ok(())
    }
}
