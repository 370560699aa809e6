//! Where chains get their content snapshots from

use crate::{Error, Result};
use async_trait::async_trait;
use mfab_common::content::ContentSnapshot;
use mfab_common::models::Chain;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Resolves the content bound to a chain
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn snapshot(&self, chain: &Chain) -> Result<Arc<ContentSnapshot>>;
}

/// The same snapshot for every chain
#[derive(Debug, Clone)]
pub struct StaticContent {
    snapshot: Arc<ContentSnapshot>,
}

impl StaticContent {
    pub fn new(snapshot: ContentSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }
}

#[async_trait]
impl ContentSource for StaticContent {
    async fn snapshot(&self, _chain: &Chain) -> Result<Arc<ContentSnapshot>> {
        Ok(Arc::clone(&self.snapshot))
    }
}

/// Snapshot re-read from a JSON file on every ingest
#[derive(Debug, Clone)]
pub struct JsonFileContent {
    path: PathBuf,
}

impl JsonFileContent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContentSource for JsonFileContent {
    async fn snapshot(&self, chain: &Chain) -> Result<Arc<ContentSnapshot>> {
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Ingest(format!("cannot read {}: {}", self.path.display(), e)))?;
        let snapshot = ContentSnapshot::from_json(&json)
            .and_then(|s| s.validate().map(|_| s))
            .map_err(|e| Error::Ingest(format!("{}: {}", self.path.display(), e)))?;
        info!(
            "Ingested {} programs and {} instruments for chain {}",
            snapshot.programs.len(),
            snapshot.instruments.len(),
            chain.ident()
        );
        Ok(Arc::new(snapshot))
    }
}
