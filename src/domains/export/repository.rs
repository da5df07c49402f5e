use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::OwnerRef;
use crate::errors::{DbError, DomainError, DomainResult};

use super::types::{ExportJob, ExportStatus};

#[async_trait]
pub trait ExportJobRepository: Send + Sync {
    async fn create_job(&self, job: &ExportJob) -> DomainResult<()>;
    async fn update_file_name(&self, id: Uuid, file_name: &str) -> DomainResult<()>;
    async fn update_status(
        &self,
        id: Uuid,
        status: ExportStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()>;

    /// Add to the progress counters in one atomic statement. Each counter
    /// clamps to `total_rows` independently, so redelivered chunks can
    /// never push either past the total.
    async fn increment_progress(&self, id: Uuid, processed: i64, successful: i64)
        -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportJob>;
}

pub struct SqliteExportJobRepository {
    pool: SqlitePool,
}

impl SqliteExportJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `export_jobs` table when it does not exist yet.
    pub async fn migrate(&self) -> DomainResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS export_jobs (
                id TEXT PRIMARY KEY NOT NULL,
                exporter TEXT NOT NULL,
                file_disk TEXT NOT NULL,
                file_name TEXT NOT NULL,
                total_rows INTEGER NOT NULL DEFAULT 0,
                processed_rows INTEGER NOT NULL DEFAULT 0,
                successful_rows INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                completed_at TEXT,
                owner_type TEXT,
                owner_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }
}

fn status_to_str(status: &ExportStatus) -> &'static str {
    match status {
        ExportStatus::Pending => "pending",
        ExportStatus::Processing => "processing",
        ExportStatus::Completed => "completed",
        ExportStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> Option<ExportStatus> {
    match s {
        "pending" => Some(ExportStatus::Pending),
        "processing" => Some(ExportStatus::Processing),
        "completed" => Some(ExportStatus::Completed),
        "failed" => Some(ExportStatus::Failed),
        _ => None,
    }
}

#[async_trait]
impl ExportJobRepository for SqliteExportJobRepository {
    async fn create_job(&self, job: &ExportJob) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO export_jobs (id, exporter, file_disk, file_name, total_rows, processed_rows, successful_rows, status, completed_at, owner_type, owner_id, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(job.id.to_string())
        .bind(&job.exporter)
        .bind(&job.file_disk)
        .bind(&job.file_name)
        .bind(job.total_rows)
        .bind(job.processed_rows)
        .bind(job.successful_rows)
        .bind(status_to_str(&job.status))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.owner.as_ref().map(|o| o.kind.clone()))
        .bind(job.owner.as_ref().map(|o| o.id.clone()))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn update_file_name(&self, id: Uuid, file_name: &str) -> DomainResult<()> {
        sqlx::query("UPDATE export_jobs SET file_name = ?, updated_at = ? WHERE id = ?")
            .bind(file_name)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExportStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        sqlx::query("UPDATE export_jobs SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(status_to_str(&status))
            .bind(completed_at.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn increment_progress(
        &self,
        id: Uuid,
        processed: i64,
        successful: i64,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET
                processed_rows = MIN(total_rows, processed_rows + ?),
                successful_rows = MIN(total_rows, successful_rows + ?),
                updated_at = ?
            WHERE id = ?",
        )
        .bind(processed)
        .bind(successful)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportJob> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: String,
            exporter: String,
            file_disk: String,
            file_name: String,
            total_rows: i64,
            processed_rows: i64,
            successful_rows: i64,
            status: String,
            completed_at: Option<String>,
            owner_type: Option<String>,
            owner_id: Option<String>,
            created_at: String,
            updated_at: String,
        }

        let row: Row = sqlx::query_as("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?
            .ok_or_else(|| {
                DomainError::Database(DbError::NotFound("export_jobs".to_string(), id.to_string()))
            })?;

        let status = str_to_status(&row.status).ok_or_else(|| {
            DomainError::Internal(format!("Invalid status {} in export_jobs", row.status))
        })?;

        let owner = match (row.owner_type, row.owner_id) {
            (Some(kind), Some(owner_id)) => Some(OwnerRef::new(kind, owner_id)),
            _ => None,
        };

        Ok(ExportJob {
            id: Uuid::parse_str(&row.id).map_err(|e| DomainError::InvalidUuid(e.to_string()))?,
            exporter: row.exporter,
            file_disk: row.file_disk,
            file_name: row.file_name,
            total_rows: row.total_rows,
            processed_rows: row.processed_rows,
            successful_rows: row.successful_rows,
            status,
            completed_at: parse_timestamp_opt(row.completed_at.as_deref())?,
            owner,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("Bad timestamp: {}", e)))
}

fn parse_timestamp_opt(raw: Option<&str>) -> DomainResult<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}
