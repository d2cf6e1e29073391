use bytes::Bytes;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use crate::errors::{AppError, AppResult};
use crate::payload::Locator;
use crate::storage::ObjectStorage;

/// One dispatchable catalog row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    /// `None` when the row carries neither a path nor a bucket/key pair
    pub locator: Option<Locator>,
    pub caption: String,
    pub published: bool,
}

impl WorkItem {
    pub fn require_locator(&self) -> AppResult<&Locator> {
        self.locator
            .as_ref()
            .ok_or_else(|| AppError::validation("locator", "Item has no payload path or bucket key"))
    }
}

/// Catalog file mirrored from object storage for the duration of a run
struct RemoteCatalog {
    storage: ObjectStorage,
    bucket: String,
    key: String,
    local_path: PathBuf,
    _dir: TempDir,
}

impl RemoteCatalog {
    async fn push(&self) -> AppResult<()> {
        let data = tokio::fs::read(&self.local_path).await?;
        self.storage
            .store(&self.bucket, &self.key, Bytes::from(data))
            .await?;
        log::info!("Uploaded catalog to s3://{}/{}", self.bucket, self.key);
        Ok(())
    }
}

/// Durable table of work items
pub struct CatalogStore {
    pool: SqlitePool,
    remote: Option<RemoteCatalog>,
}

const ITEM_COLUMNS: &str = "id, path, bucket_name, bucket_path, caption, uploaded";

/// Unpublished and not held by a live claim
const ELIGIBLE: &str = "uploaded = 0 AND (claimed_until IS NULL OR claimed_until <= ?)";

impl CatalogStore {
    pub async fn open(db_path: &Path, create_if_missing: bool) -> AppResult<Self> {
        log::info!("Opening catalog: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(create_if_missing)
            .journal_mode(SqliteJournalMode::Delete);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool, remote: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// Catalog living only in memory, mainly for tests.
    pub async fn open_in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Memory);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, remote: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// Downloads the catalog file from object storage. Commits are pushed
    /// back before they are acknowledged.
    pub async fn open_remote(storage: ObjectStorage, bucket: &str, key: &str) -> AppResult<Self> {
        let data = storage.fetch(bucket, key).await?;

        let dir = tempfile::tempdir()?;
        let local_path = dir.path().join("catalog.db");
        tokio::fs::write(&local_path, &data).await?;
        log::info!(
            "Downloaded catalog s3://{}/{} ({} bytes)",
            bucket,
            key,
            data.len()
        );

        let mut store = Self::open(&local_path, false).await?;
        store.remote = Some(RemoteCatalog {
            storage,
            bucket: bucket.to_string(),
            key: key.to_string(),
            local_path,
            _dir: dir,
        });
        Ok(store)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn init_schema(&self) -> AppResult<()> {
        self.adopt_bucket_table().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT,
                bucket_name TEXT,
                bucket_path TEXT,
                caption TEXT,
                uploaded INTEGER NOT NULL DEFAULT 0,
                claimed_until INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate().await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_uploaded ON image(uploaded)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Adds columns introduced after the flat-path schema. `uploaded` is
    /// never rewritten.
    pub async fn migrate(&self) -> AppResult<()> {
        for (column, definition) in [
            ("path", "path TEXT"),
            ("bucket_name", "bucket_name TEXT"),
            ("bucket_path", "bucket_path TEXT"),
            ("caption", "caption TEXT"),
            ("claimed_until", "claimed_until INTEGER"),
        ] {
            let exists = sqlx::query("SELECT name FROM pragma_table_info('image') WHERE name = ?")
                .bind(column)
                .fetch_optional(&self.pool)
                .await?;

            if exists.is_none() {
                log::info!("Adding missing {} column to image table", column);
                sqlx::query(&format!("ALTER TABLE image ADD COLUMN {}", definition))
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    /// Bucket-based catalogs keep their queue in `image2`. It becomes the
    /// `image` table, or fills an `image` table that is still empty.
    async fn adopt_bucket_table(&self) -> AppResult<()> {
        if !self.table_exists("image2").await? {
            return Ok(());
        }

        if !self.table_exists("image").await? {
            log::info!("Adopting legacy image2 table as image");
            sqlx::query("ALTER TABLE image2 RENAME TO image")
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let row = sqlx::query("SELECT COUNT(*) AS total FROM image")
            .fetch_one(&self.pool)
            .await?;
        let existing: i64 = row.get("total");
        if existing > 0 {
            log::warn!(
                "Both image ({} rows) and image2 exist; image2 is left untouched",
                existing
            );
            return Ok(());
        }

        self.migrate().await?;

        let mut tx = self.pool.begin().await?;
        let copied = sqlx::query(
            "INSERT INTO image (id, bucket_name, bucket_path, caption, uploaded) \
             SELECT id, bucket_name, bucket_path, caption, COALESCE(uploaded, 0) FROM image2",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DROP TABLE image2").execute(&mut *tx).await?;
        tx.commit().await?;

        log::info!(
            "Moved {} rows from image2 into the empty image table",
            copied.rows_affected()
        );
        Ok(())
    }

    async fn table_exists(&self, name: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_item(&self, locator: &Locator, caption: Option<&str>) -> AppResult<i64> {
        let (path, bucket, key) = match locator {
            Locator::File(path) => (Some(path.to_string_lossy().to_string()), None, None),
            Locator::Object { bucket, key } => (None, Some(bucket.clone()), Some(key.clone())),
        };

        let result = sqlx::query(
            "INSERT INTO image (path, bucket_name, bucket_path, caption) VALUES (?, ?, ?, ?)",
        )
        .bind(path)
        .bind(bucket)
        .bind(key)
        .bind(caption)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_item(&self, id: i64) -> AppResult<Option<WorkItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM image WHERE id = ?", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| item_from_row(&row)))
    }

    pub async fn count_unpublished(&self) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM image WHERE uploaded = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("pending"))
    }

    /// Uniform draw over the unpublished set. Read-only.
    pub async fn select_candidate<R: Rng + ?Sized>(&self, rng: &mut R) -> AppResult<Option<WorkItem>> {
        let now = chrono::Utc::now().timestamp();

        let ids: Vec<i64> = sqlx::query(&format!("SELECT id FROM image WHERE {} ORDER BY id", ELIGIBLE))
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.get("id"))
            .collect();

        if ids.is_empty() {
            return Ok(None);
        }

        let chosen = ids[rng.random_range(0..ids.len())];
        log::debug!("Selected item {} out of {} candidates", chosen, ids.len());
        self.get_item(chosen).await
    }

    /// Uniform draw that also marks the chosen item as claimed for `lease`,
    /// in the same transaction. Claimed items are invisible to other
    /// selections until the lease runs out or the claim is released.
    pub async fn claim_candidate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        lease: Duration,
    ) -> AppResult<Option<WorkItem>> {
        let now = chrono::Utc::now().timestamp();
        let claimed_until = now + lease.as_secs() as i64;

        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query(&format!("SELECT id FROM image WHERE {} ORDER BY id", ELIGIBLE))
            .bind(now)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get("id"))
            .collect();

        if ids.is_empty() {
            return Ok(None);
        }

        let chosen = ids[rng.random_range(0..ids.len())];

        let result = sqlx::query(&format!(
            "UPDATE image SET claimed_until = ? WHERE id = ? AND {}",
            ELIGIBLE
        ))
        .bind(claimed_until)
        .bind(chosen)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(AppError::Internal(format!(
                "Item {} was claimed concurrently",
                chosen
            )));
        }

        let row = sqlx::query(&format!("SELECT {} FROM image WHERE id = ?", ITEM_COLUMNS))
            .bind(chosen)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        self.push_remote().await?;

        log::info!(
            "Claimed item {} until {} out of {} candidates",
            chosen,
            claimed_until,
            ids.len()
        );
        Ok(Some(item_from_row(&row)))
    }

    pub async fn release_claim(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE image SET claimed_until = NULL WHERE id = ? AND uploaded = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.push_remote().await?;
        log::debug!("Released claim on item {}", id);
        Ok(())
    }

    /// Sets `uploaded = 1` and returns only once the change is durable.
    /// Repeating it for the same id is a no-op.
    pub async fn commit_published(&self, id: i64) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE image SET uploaded = 1, claimed_until = NULL WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::UnknownItem { id });
        }

        tx.commit().await?;
        self.push_remote().await?;

        log::info!("Marked item {} as published", id);
        Ok(())
    }

    async fn push_remote(&self) -> AppResult<()> {
        match &self.remote {
            Some(remote) => remote.push().await,
            None => Ok(()),
        }
    }
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> WorkItem {
    let path: Option<String> = row.get("path");
    let bucket: Option<String> = row.get("bucket_name");
    let key: Option<String> = row.get("bucket_path");
    let caption: Option<String> = row.get("caption");
    let uploaded: i64 = row.get("uploaded");

    let locator = match (bucket, key, path) {
        (Some(bucket), Some(key), _) => Some(Locator::Object { bucket, key }),
        (_, _, Some(path)) if !path.is_empty() => Some(Locator::File(PathBuf::from(path))),
        _ => None,
    };

    WorkItem {
        id: row.get("id"),
        locator,
        caption: caption.unwrap_or_default(),
        published: uploaded != 0,
    }
}
