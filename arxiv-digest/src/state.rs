use crate::types::{DigestError, PaperCandidate, Result, SeenRecord, SeenSnapshot, SeenStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Run-facing view of the seen set.
///
/// A run reads the store once through [`DedupStore::snapshot`] and writes it
/// once through [`DedupStore::commit`], after delivery succeeded.
pub struct DedupStore {
    store: Arc<dyn SeenStore>,
}

impl DedupStore {
    pub fn new(store: Arc<dyn SeenStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> String {
        self.store.backend_name()
    }

    pub async fn snapshot(&self) -> Result<SeenSnapshot> {
        let snapshot = self.store.load_snapshot().await?;
        info!(
            "Loaded seen set from {}: {} papers, last window end {:?}",
            self.store.backend_name(),
            snapshot.len(),
            snapshot.last_window_end
        );
        Ok(snapshot)
    }

    /// Drop candidates already recorded in `snapshot`. Returns the unseen
    /// candidates in their original order and the number removed.
    pub fn filter_unseen(
        snapshot: &SeenSnapshot,
        candidates: Vec<PaperCandidate>,
    ) -> (Vec<PaperCandidate>, usize) {
        let total = candidates.len();
        let unseen: Vec<PaperCandidate> = candidates
            .into_iter()
            .filter(|paper| {
                let seen = snapshot.contains(&paper.id);
                if seen {
                    debug!("Skipping already notified paper {}", paper.id);
                }
                !seen
            })
            .collect();
        let skipped = total - unseen.len();
        (unseen, skipped)
    }

    pub async fn commit(
        &self,
        paper_ids: &[String],
        seen_at: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        let records: Vec<SeenRecord> = paper_ids
            .iter()
            .map(|id| SeenRecord {
                paper_id: id.clone(),
                first_seen: seen_at,
            })
            .collect();
        self.store.commit(&records, window_end).await?;
        info!(
            "Committed {} papers to {} (window end {})",
            records.len(),
            self.store.backend_name(),
            window_end
        );
        Ok(())
    }
}

/// Open the backend named by a state-store location.
///
/// `postgres://` and `postgresql://` select PostgreSQL, `memory://` an
/// in-process store, and `file://<path>` or a bare path a JSON document.
pub async fn open_store(location: &str) -> Result<Arc<dyn SeenStore>> {
    let location = location.trim();
    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
        return Ok(Arc::new(PgSeenStore::connect(location).await?));
    }
    if location.starts_with("memory://") {
        return Ok(Arc::new(MemorySeenStore::new()));
    }
    if let Some(path) = location.strip_prefix("file://") {
        return Ok(Arc::new(JsonFileSeenStore::new(path)));
    }
    if location.contains("://") {
        return Err(DigestError::config(format!(
            "unsupported STATE_STORE_URL scheme: {}",
            location
        )));
    }
    Ok(Arc::new(JsonFileSeenStore::new(location)))
}

fn db_error(e: sqlx::Error) -> DigestError {
    DigestError::store(format!("database error: {}", e))
}

pub struct PgSeenStore {
    pool: PgPool,
}

impl PgSeenStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(db_error)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DigestError::store(format!("migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeenStore for PgSeenStore {
    fn backend_name(&self) -> String {
        "postgres".to_string()
    }

    async fn load_snapshot(&self) -> Result<SeenSnapshot> {
        let rows = sqlx::query("SELECT paper_id FROM seen_papers")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut snapshot = SeenSnapshot::default();
        for row in rows {
            let paper_id: String = row.try_get("paper_id").map_err(db_error)?;
            snapshot.seen.insert(paper_id);
        }

        let state = sqlx::query("SELECT last_window_end FROM run_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if let Some(row) = state {
            snapshot.last_window_end = Some(row.try_get("last_window_end").map_err(db_error)?);
        }

        Ok(snapshot)
    }

    async fn commit(&self, records: &[SeenRecord], window_end: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO seen_papers (paper_id, first_seen)
                VALUES ($1, $2)
                ON CONFLICT (paper_id) DO NOTHING
                "#,
            )
            .bind(&record.paper_id)
            .bind(record.first_seen)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        sqlx::query(
            r#"
            INSERT INTO run_state (id, last_window_end, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET
                last_window_end = GREATEST(run_state.last_window_end, EXCLUDED.last_window_end),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(window_end)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }
}

/// On-disk layout of the JSON backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SeenDocument {
    #[serde(default)]
    last_window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    seen: BTreeMap<String, DateTime<Utc>>,
}

impl SeenDocument {
    fn snapshot(&self) -> SeenSnapshot {
        SeenSnapshot {
            seen: self.seen.keys().cloned().collect(),
            last_window_end: self.last_window_end,
        }
    }

    fn apply(&mut self, records: &[SeenRecord], window_end: DateTime<Utc>) {
        for record in records {
            self.seen
                .entry(record.paper_id.clone())
                .or_insert(record.first_seen);
        }
        self.last_window_end = Some(match self.last_window_end {
            Some(previous) => previous.max(window_end),
            None => window_end,
        });
    }
}

/// Seen set kept in a single JSON file, replaced atomically on commit.
pub struct JsonFileSeenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSeenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<SeenDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DigestError::store(format!("{} is not a valid state file: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file {} not found, starting empty", self.path.display());
                Ok(SeenDocument::default())
            }
            Err(e) => Err(DigestError::store(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_document(&self, document: &SeenDocument) -> Result<()> {
        let io_error = |e: std::io::Error| {
            DigestError::store(format!("failed to write {}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let content = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp_path, content).await.map_err(io_error)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}

#[async_trait]
impl SeenStore for JsonFileSeenStore {
    fn backend_name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn load_snapshot(&self) -> Result<SeenSnapshot> {
        Ok(self.read_document().await?.snapshot())
    }

    async fn commit(&self, records: &[SeenRecord], window_end: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.apply(records, window_end);
        self.write_document(&document).await
    }
}

/// In-process seen set for tests and dry runs.
#[derive(Default)]
pub struct MemorySeenStore {
    document: Mutex<SeenDocument>,
    commits: Mutex<usize>,
}

impl MemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `paper_ids`, all first seen at `first_seen`.
    pub fn with_seen<I, S>(paper_ids: I, first_seen: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let document = SeenDocument {
            last_window_end: None,
            seen: paper_ids
                .into_iter()
                .map(|id| (id.into(), first_seen))
                .collect(),
        };
        Self {
            document: Mutex::new(document),
            commits: Mutex::new(0),
        }
    }

    /// Recorded ids in sorted order.
    pub async fn seen_ids(&self) -> Vec<String> {
        self.document.lock().await.seen.keys().cloned().collect()
    }

    pub async fn first_seen(&self, paper_id: &str) -> Option<DateTime<Utc>> {
        self.document.lock().await.seen.get(paper_id).copied()
    }

    pub async fn last_window_end(&self) -> Option<DateTime<Utc>> {
        self.document.lock().await.last_window_end
    }

    pub async fn commit_count(&self) -> usize {
        *self.commits.lock().await
    }
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    fn backend_name(&self) -> String {
        "memory".to_string()
    }

    async fn load_snapshot(&self) -> Result<SeenSnapshot> {
        Ok(self.document.lock().await.snapshot())
    }

    async fn commit(&self, records: &[SeenRecord], window_end: DateTime<Utc>) -> Result<()> {
        self.document.lock().await.apply(records, window_end);
        *self.commits.lock().await += 1;
        Ok(())
    }
}
