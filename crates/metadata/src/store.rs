//! Persistence of processed-image records.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgflow_bus::ProcessedResult;
use imgflow_core::config::PostgresConfig;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

/// A stored row of `image_records`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub source_url: String,
    pub storage_path: String,
    pub processed_at: DateTime<Utc>,
    pub status: String,
    pub error_msg: Option<String>,
    pub trace_id: String,
    pub width: i32,
    pub height: i32,
    pub format: String,
    pub file_size: i64,
    pub processing_type: String,
}

/// Column values for an insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImageRecord {
    pub source_url: String,
    pub storage_path: String,
    pub processed_at: DateTime<Utc>,
    pub status: String,
    pub error_msg: Option<String>,
    pub trace_id: String,
    pub width: i32,
    pub height: i32,
    pub format: String,
    pub file_size: i64,
    pub processing_type: String,
}

impl NewImageRecord {
    /// `processed_at` is the result envelope's timestamp, i.e. when the
    /// worker published it.
    pub fn from_result(processed_at: DateTime<Utc>, result: &ProcessedResult) -> Self {
        Self {
            source_url: result.source_url.clone(),
            storage_path: result.storage_path.clone(),
            processed_at,
            status: result.status.to_string(),
            error_msg: result.error_msg.clone(),
            trace_id: result.trace_id.clone(),
            width: i32::try_from(result.width).unwrap_or(i32::MAX),
            height: i32::try_from(result.height).unwrap_or(i32::MAX),
            format: result.format.clone(),
            file_size: i64::try_from(result.file_size).unwrap_or(i64::MAX),
            processing_type: result.processing_type.to_string(),
        }
    }

    fn with_id(self, id: i64) -> ImageRecord {
        ImageRecord {
            id,
            source_url: self.source_url,
            storage_path: self.storage_path,
            processed_at: self.processed_at,
            status: self.status,
            error_msg: self.error_msg,
            trace_id: self.trace_id,
            width: self.width,
            height: self.height,
            format: self.format,
            file_size: self.file_size,
            processing_type: self.processing_type,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert one record and return its id.
    async fn insert(&self, record: &NewImageRecord) -> Result<i64, PersistError>;

    /// Most recently processed records first.
    async fn recent(&self, limit: i64) -> Result<Vec<ImageRecord>, PersistError>;

    async fn by_id(&self, id: i64) -> Result<Option<ImageRecord>, PersistError>;
}

/// Connection options built field by field, so credentials never pass
/// through URL parsing.
pub fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, PersistError> {
    let ssl_mode: PgSslMode = config.ssl_mode.parse()?;
    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode))
}

const SELECT_COLUMNS: &str = "SELECT id, source_url, storage_path, processed_at, status, error_msg, \
     trace_id, width, height, format, file_size, processing_type FROM image_records";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a bounded pool and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PersistError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options(config)?)
            .await?;
        info!(host = %config.host, database = %config.database, "PostgreSQL connected");

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, r: &NewImageRecord) -> Result<i64, PersistError> {
        let (id,) = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO image_records
                (source_url, storage_path, processed_at, status, error_msg, trace_id,
                 width, height, format, file_size, processing_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING id",
        )
        .bind(&r.source_url)
        .bind(&r.storage_path)
        .bind(r.processed_at)
        .bind(&r.status)
        .bind(&r.error_msg)
        .bind(&r.trace_id)
        .bind(r.width)
        .bind(r.height)
        .bind(&r.format)
        .bind(r.file_size)
        .bind(&r.processing_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ImageRecord>, PersistError> {
        let rows = sqlx::query_as::<_, ImageRecord>(&format!(
            "{SELECT_COLUMNS} ORDER BY processed_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn by_id(&self, id: i64) -> Result<Option<ImageRecord>, PersistError> {
        let row = sqlx::query_as::<_, ImageRecord>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

/// In-process store for local runs without PostgreSQL.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<Vec<ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ImageRecord>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &NewImageRecord) -> Result<i64, PersistError> {
        let mut rows = self.lock();
        let id = rows.len() as i64 + 1;
        rows.push(record.clone().with_id(id));
        Ok(id)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ImageRecord>, PersistError> {
        let mut rows = self.lock().clone();
        rows.sort_by(|a, b| b.processed_at.cmp(&a.processed_at).then(b.id.cmp(&a.id)));
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn by_id(&self, id: i64) -> Result<Option<ImageRecord>, PersistError> {
        Ok(self.lock().iter().find(|r| r.id == id).cloned())
    }
}
