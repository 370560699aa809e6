//! SQLite entity store
//!
//! Entities are stored as JSON bodies alongside the few columns queries need.
//! `UNIQUE(chain_id, offset)` enforces one segment per chain offset and
//! sub-entities cascade when their segment is deleted.

use super::{retain_until, EntityStore};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfab_common::models::{
    Chain, ChainState, EntityKind, Segment, SegmentEntity, SegmentMeta, SegmentScoped, SegmentState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and ensure the schema exists
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        Self::with_pool(pool).await
    }

    /// Private in-memory database (single connection so all queries share it)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        init_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chains (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            start_at INTEGER NOT NULL,
            body TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            chain_id TEXT NOT NULL REFERENCES chains(id) ON DELETE CASCADE,
            "offset" INTEGER NOT NULL,
            state TEXT NOT NULL,
            retain_until INTEGER NOT NULL,
            body TEXT NOT NULL,
            UNIQUE(chain_id, "offset")
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_retain_until ON segments(retain_until)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segment_entities (
            id TEXT PRIMARY KEY,
            segment_id TEXT NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            seq INTEGER NOT NULL,
            body TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_segment_entities_segment ON segment_entities(segment_id, kind)",
    )
    .execute(pool)
    .await?;

    debug!("Entity store schema ready");
    Ok(())
}

fn chain_state_str(state: ChainState) -> String {
    state.to_string()
}

fn map_unique_violation(err: sqlx::Error, segment: &Segment) -> Error {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => Error::Validation(format!(
            "Chain {} already has a segment at offset {}",
            segment.chain_id, segment.offset
        )),
        Some(db) if db.is_foreign_key_violation() => {
            Error::NotFound(format!("Chain {}", segment.chain_id))
        }
        _ => Error::Database(err),
    }
}

fn decode_segment(body: &str) -> Result<Segment> {
    Ok(serde_json::from_str(body)?)
}

fn decode_entities(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<SegmentEntity>> {
    rows.iter()
        .map(|row| {
            let body: String = row.get("body");
            Ok(serde_json::from_str(&body)?)
        })
        .collect()
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn put_chain(&self, chain: &Chain) -> Result<()> {
        chain.validate()?;
        sqlx::query(
            r#"
            INSERT INTO chains (id, state, start_at, body) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state, start_at = excluded.start_at, body = excluded.body
            "#,
        )
        .bind(chain.id.to_string())
        .bind(chain_state_str(chain.state))
        .bind(chain.start_at.timestamp_micros())
        .bind(serde_json::to_string(chain)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_fabricated_ahead(&self, chain_id: Uuid, seconds: f64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chains SET body = json_set(body, '$.fabricated_ahead_seconds', ?) WHERE id = ?",
        )
        .bind(seconds)
        .bind(chain_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Chain {}", chain_id)));
        }
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Chain> {
        let row = sqlx::query("SELECT body FROM chains WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Chain {}", id)))?;
        let body: String = row.get("body");
        Ok(serde_json::from_str(&body)?)
    }

    async fn chains_in_state(&self, state: ChainState) -> Result<Vec<Chain>> {
        let rows = sqlx::query("SELECT body FROM chains WHERE state = ? ORDER BY start_at")
            .bind(chain_state_str(state))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    async fn create_segment(&self, segment: &Segment) -> Result<()> {
        segment.validate()?;
        sqlx::query(
            r#"
            INSERT INTO segments (id, chain_id, "offset", state, retain_until, body)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(segment.id.to_string())
        .bind(segment.chain_id.to_string())
        .bind(segment.offset as i64)
        .bind(segment.state.as_str())
        .bind(retain_until(segment).timestamp_micros())
        .bind(serde_json::to_string(segment)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, segment))?;
        Ok(())
    }

    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        segment.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE segments SET retain_until = ?, body = json_set(?, '$.state', state)
            WHERE id = ? AND chain_id = ? AND "offset" = ?
            "#,
        )
        .bind(retain_until(segment).timestamp_micros())
        .bind(serde_json::to_string(segment)?)
        .bind(segment.id.to_string())
        .bind(segment.chain_id.to_string())
        .bind(segment.offset as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Segment {} at chain {} offset {}",
                segment.id, segment.chain_id, segment.offset
            )));
        }
        Ok(())
    }

    async fn get_segment(&self, id: Uuid) -> Result<Segment> {
        let row = sqlx::query("SELECT body FROM segments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Segment {}", id)))?;
        decode_segment(row.get("body"))
    }

    async fn segments_of_chain(&self, chain_id: Uuid) -> Result<Vec<Segment>> {
        let rows = sqlx::query(r#"SELECT body FROM segments WHERE chain_id = ? ORDER BY "offset""#)
            .bind(chain_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| decode_segment(row.get("body"))).collect()
    }

    async fn read_one_at_chain_offset(&self, chain_id: Uuid, offset: u64) -> Result<Option<Segment>> {
        let row = sqlx::query(r#"SELECT body FROM segments WHERE chain_id = ? AND "offset" = ?"#)
            .bind(chain_id.to_string())
            .bind(offset as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_segment(r.get("body"))).transpose()
    }

    async fn read_last_segment(&self, chain_id: Uuid) -> Result<Option<Segment>> {
        let row = sqlx::query(
            r#"SELECT body FROM segments WHERE chain_id = ? ORDER BY "offset" DESC LIMIT 1"#,
        )
        .bind(chain_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_segment(r.get("body"))).transpose()
    }

    async fn read_last_segment_in(&self, chain_id: Uuid, states: &[SegmentState]) -> Result<Option<Segment>> {
        if states.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            r#"SELECT body FROM segments WHERE chain_id = ? AND state IN ({}) ORDER BY "offset" DESC LIMIT 1"#,
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(chain_id.to_string());
        for state in states {
            query = query.bind(state.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| decode_segment(r.get("body"))).transpose()
    }

    async fn compare_and_set_segment_state(
        &self,
        id: Uuid,
        from: SegmentState,
        to: SegmentState,
    ) -> Result<SegmentState> {
        // Single conditional UPDATE keeps the swap atomic across connections
        let updated_at = serde_json::to_value(Utc::now())?;
        let result = sqlx::query(
            r#"
            UPDATE segments
            SET state = ?1, body = json_set(body, '$.state', ?1, '$.updated_at', ?2)
            WHERE id = ?3 AND state = ?4
            "#,
        )
        .bind(to.as_str())
        .bind(updated_at.as_str().unwrap_or_default().to_string())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(from);
        }

        let row = sqlx::query("SELECT state FROM segments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Segment {}", id)))?;
        let actual: String = row.get("state");
        Ok(SegmentState::parse(&actual)?)
    }

    async fn put_entity(&self, entity: &SegmentEntity) -> Result<()> {
        entity.validate()?;
        sqlx::query(
            r#"
            INSERT INTO segment_entities (id, segment_id, kind, seq, body)
            VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM segment_entities WHERE segment_id = ?2), ?4)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(entity.id().to_string())
        .bind(entity.segment_id().to_string())
        .bind(entity.kind().as_str())
        .bind(serde_json::to_string(entity)?)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_foreign_key_violation() => {
                Error::NotFound(format!("Segment {}", entity.segment_id()))
            }
            _ => Error::Database(e),
        })?;
        Ok(())
    }

    async fn get_entity(&self, kind: EntityKind, id: Uuid) -> Result<Option<SegmentEntity>> {
        let row = sqlx::query("SELECT body FROM segment_entities WHERE id = ? AND kind = ?")
            .bind(id.to_string())
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn segment_entities(&self, segment_id: Uuid, kind: Option<EntityKind>) -> Result<Vec<SegmentEntity>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT body FROM segment_entities WHERE segment_id = ? AND kind = ? ORDER BY seq",
                )
                .bind(segment_id.to_string())
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT body FROM segment_entities WHERE segment_id = ? ORDER BY seq")
                    .bind(segment_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        decode_entities(rows)
    }

    async fn latest_metas_before(&self, chain_id: Uuid, offset: u64, prefix: &str) -> Result<Vec<SegmentMeta>> {
        // substr rather than LIKE: `_` is a LIKE wildcard
        let rows = sqlx::query(
            r#"SELECT e.body FROM segment_entities e
               JOIN segments s ON s.id = e.segment_id
               WHERE s.chain_id = ? AND s."offset" < ? AND e.kind = ?
                 AND substr(json_extract(e.body, '$.key'), 1, ?) = ?
               ORDER BY s."offset" DESC, e.seq"#,
        )
        .bind(chain_id.to_string())
        .bind(offset as i64)
        .bind(EntityKind::Meta.as_str())
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        let mut seen = HashSet::new();
        Ok(decode_entities(rows)?
            .iter()
            .filter_map(SegmentMeta::from_entity)
            .filter(|m| seen.insert(m.key.clone()))
            .cloned()
            .collect())
    }

    async fn delete_segments_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("DELETE FROM segments WHERE retain_until < ? RETURNING id")
            .bind(threshold.timestamp_micros())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Bad segment id {}: {}", id, e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfab_common::models::{ChainType, SegmentChord, SegmentMeme, SegmentType};
    use mfab_common::time;

    async fn store_with_chain() -> (SqliteStore, Chain) {
        let store = SqliteStore::in_memory().await.unwrap();
        let chain = Chain::new(Uuid::nil(), "test", ChainType::Production, time::now()).unwrap();
        store.put_chain(&chain).await.unwrap();
        (store, chain)
    }

    #[tokio::test]
    async fn test_chain_roundtrip_and_state_query() {
        let (store, mut chain) = store_with_chain().await;
        assert_eq!(store.get_chain(chain.id).await.unwrap(), chain);
        assert!(store.chains_in_state(ChainState::Fabricate).await.unwrap().is_empty());

        chain.transition(ChainState::Ready).unwrap();
        chain.transition(ChainState::Fabricate).unwrap();
        store.put_chain(&chain).await.unwrap();
        let fabricating = store.chains_in_state(ChainState::Fabricate).await.unwrap();
        assert_eq!(fabricating.len(), 1);
        assert_eq!(fabricating[0].id, chain.id);
    }

    #[tokio::test]
    async fn test_fabricated_ahead_written_alone() {
        let (store, mut chain) = store_with_chain().await;
        chain.transition(ChainState::Ready).unwrap();
        store.put_chain(&chain).await.unwrap();

        store.set_fabricated_ahead(chain.id, 12.25).await.unwrap();
        let stored = store.get_chain(chain.id).await.unwrap();
        assert_eq!(stored.state, ChainState::Ready);
        assert_eq!(stored.fabricated_ahead_seconds, 12.25);
        assert!(matches!(
            store.set_fabricated_ahead(Uuid::new_v4(), 1.0).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unique_offset() {
        let (store, chain) = store_with_chain().await;
        let first = Segment::planned(&chain, 0, SegmentType::Initial, time::now()).unwrap();
        store.create_segment(&first).await.unwrap();
        let duplicate = Segment::planned(&chain, 0, SegmentType::Initial, time::now()).unwrap();
        assert!(matches!(store.create_segment(&duplicate).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_compare_and_set_updates_body() {
        let (store, chain) = store_with_chain().await;
        let segment = Segment::planned(&chain, 0, SegmentType::Initial, time::now()).unwrap();
        store.create_segment(&segment).await.unwrap();

        let before = store
            .compare_and_set_segment_state(segment.id, SegmentState::Planned, SegmentState::Crafting)
            .await
            .unwrap();
        assert_eq!(before, SegmentState::Planned);
        assert_eq!(store.get_segment(segment.id).await.unwrap().state, SegmentState::Crafting);

        let stale = store
            .compare_and_set_segment_state(segment.id, SegmentState::Planned, SegmentState::Crafting)
            .await
            .unwrap();
        assert_eq!(stale, SegmentState::Crafting);
        let last = store.read_last_segment_in(chain.id, &[SegmentState::Crafting]).await.unwrap();
        assert_eq!(last.map(|s| s.id), Some(segment.id));
    }

    #[tokio::test]
    async fn test_entities_ordered_and_cascaded() {
        let (store, chain) = store_with_chain().await;
        let segment = Segment::planned(&chain, 0, SegmentType::Initial, time::now()).unwrap();
        store.create_segment(&segment).await.unwrap();

        let chords = vec![
            SegmentChord::new(segment.id, 0.0, "C").unwrap(),
            SegmentChord::new(segment.id, 4.0, "F").unwrap(),
        ];
        for chord in &chords {
            store.put_entity(&chord.clone().into_entity()).await.unwrap();
        }
        let meme = SegmentMeme::new(segment.id, "dark").unwrap();
        store.put_entity(&meme.clone().into_entity()).await.unwrap();
        // upsert keeps a single row
        store.put_entity(&meme.clone().into_entity()).await.unwrap();

        let stored = crate::store::get_all::<SegmentChord>(&store, segment.id).await.unwrap();
        assert_eq!(stored, chords);
        assert_eq!(store.segment_entities(segment.id, None).await.unwrap().len(), 3);
        assert!(store.get_entity(EntityKind::Meme, meme.id).await.unwrap().is_some());

        let deleted = store
            .delete_segments_older_than(time::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deleted, vec![segment.id]);
        assert!(store.segment_entities(segment.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_metas_skip_segments_without_them() {
        let (store, chain) = store_with_chain().await;
        let mut segments = Vec::new();
        for offset in 0..4 {
            let segment = Segment::planned(&chain, offset, SegmentType::Continue, time::now()).unwrap();
            store.create_segment(&segment).await.unwrap();
            segments.push(segment);
        }
        let metas = [
            SegmentMeta::new(segments[0].id, "StickyBun_a", "[1]"),
            SegmentMeta::new(segments[0].id, "StickyBun_b", "[2]"),
            SegmentMeta::new(segments[0].id, "StickyXBun_c", "[9]"),
            SegmentMeta::new(segments[1].id, "StickyBun_b", "[3]"),
            SegmentMeta::new(segments[3].id, "StickyBun_a", "[4]"),
        ];
        for meta in &metas {
            store.put_entity(&meta.clone().into_entity()).await.unwrap();
        }

        let found = store.latest_metas_before(chain.id, 3, "StickyBun_").await.unwrap();
        let pairs: Vec<(&str, &str)> = found.iter().map(|m| (m.key.as_str(), m.value.as_str())).collect();
        assert_eq!(pairs, vec![("StickyBun_b", "[3]"), ("StickyBun_a", "[1]")]);
        assert!(store.latest_metas_before(chain.id, 0, "StickyBun_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mfab.db");
        let chain = Chain::new(Uuid::nil(), "durable", ChainType::Preview, time::now()).unwrap();
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put_chain(&chain).await.unwrap();
            store.pool().close().await;
        }
        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_chain(chain.id).await.unwrap().name, "durable");
    }
}
