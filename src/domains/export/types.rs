use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::OwnerRef;

use super::source::SerializedQuery;

/// Export formats supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    /// Parse a download-format token (`csv` | `xlsx`).
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "csv" => Some(ExportFormat::Csv),
            "xlsx" => Some(ExportFormat::Xlsx),
            _ => None,
        }
    }

    /// Whether completed exports can be downloaded in this format.
    pub fn is_downloadable(&self) -> bool {
        true
    }
}

/// Export job statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Row mapped to the `export_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    /// Host-registered exporter identifier.
    pub exporter: String,
    pub file_disk: String,
    pub file_name: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub status: ExportStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub owner: Option<OwnerRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(
        exporter: impl Into<String>,
        file_disk: impl Into<String>,
        file_name: impl Into<String>,
        total_rows: i64,
        owner: Option<OwnerRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            exporter: exporter.into(),
            file_disk: file_disk.into(),
            file_name: file_name.into(),
            total_rows,
            processed_rows: 0,
            successful_rows: 0,
            status: ExportStatus::Processing,
            completed_at: None,
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// Private per-export directory all shard files live under.
    pub fn file_directory(&self) -> String {
        format!("exports/{}", self.id)
    }

    /// Relative path of the header shard.
    pub fn headers_path(&self) -> String {
        format!("{}/headers.csv", self.file_directory())
    }

    /// Relative path of a numbered shard; zero-padded so that
    /// lexicographic order equals numeric order.
    pub fn shard_path(&self, sequence: u64) -> String {
        format!("{}/{:016}.csv", self.file_directory(), sequence)
    }

    /// Relative path of the materialized workbook.
    pub fn xlsx_path(&self) -> String {
        format!("{}/{}.xlsx", self.file_directory(), self.file_name)
    }

    pub fn failed_rows_count(&self) -> i64 {
        self.total_rows - self.successful_rows
    }

    /// Progress of the export as a value between 0 and 100, rounded to
    /// 2 decimal places.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_rows <= 0 {
            return 0.0;
        }
        let ratio = self.processed_rows as f64 / self.total_rows as f64;
        (ratio * 100.0 * 100.0).round() / 100.0
    }
}

/// High-level request describing what should be exported.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    /// Serialized query to export. Defaults to the exporter's whole model.
    pub query: Option<SerializedQuery>,
    /// Explicit record ids to export instead of a query; order is preserved.
    pub records: Option<Vec<String>>,
    /// Ordered column name → label map; defaults to the exporter's
    /// enabled-by-default columns.
    pub column_map: Option<Vec<(String, String)>>,
    /// Subject the export belongs to, if any.
    pub owner: Option<OwnerRef>,
}

/// Crate-wide defaults, mirroring the host's `exports` configuration.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub default_chunk_size: usize,
    pub default_file_disk: String,
    pub default_batch_name: String,
    pub csv_delimiter: u8,
    pub csv_quote: u8,
    pub csv_escape: u8,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 100,
            default_file_disk: "local".to_string(),
            default_batch_name: "Exports".to_string(),
            csv_delimiter: b',',
            csv_quote: b'"',
            csv_escape: b'\\',
        }
    }
}

impl ExportConfig {
    /// Build a config from `EXPORT_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = std::env::var("EXPORT_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            config.default_chunk_size = size;
        }
        if let Ok(disk) = std::env::var("EXPORT_FILE_DISK") {
            if !disk.trim().is_empty() {
                config.default_file_disk = disk;
            }
        }
        if let Ok(name) = std::env::var("EXPORT_BATCH_NAME") {
            if !name.trim().is_empty() {
                config.default_batch_name = name;
            }
        }
        if let Some(delimiter) = std::env::var("EXPORT_CSV_DELIMITER")
            .ok()
            .and_then(|v| v.bytes().next())
        {
            config.csv_delimiter = delimiter;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_tokens_round_trip() {
        assert_eq!(ExportFormat::from_token("csv"), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::from_token("xlsx"), Some(ExportFormat::Xlsx));
        assert_eq!(ExportFormat::from_token("pdf"), None);
        assert_eq!(ExportFormat::Xlsx.extension(), "xlsx");
    }

    #[test]
    fn test_shard_paths_are_zero_padded() {
        let job = ExportJob::new("users", "local", "users-export", 10, None);
        assert_eq!(job.shard_path(42), format!("exports/{}/0000000000000042.csv", job.id));
        assert_eq!(job.headers_path(), format!("exports/{}/headers.csv", job.id));
    }

    #[test]
    fn test_progress_percentage() {
        let mut job = ExportJob::new("users", "local", "users-export", 3, None);
        assert_eq!(job.progress_percentage(), 0.0);

        job.processed_rows = 1;
        assert_eq!(job.progress_percentage(), 33.33);

        job.processed_rows = 3;
        assert_eq!(job.progress_percentage(), 100.0);

        job.total_rows = 0;
        assert_eq!(job.progress_percentage(), 0.0);
    }

    #[test]
    fn test_failed_rows_count() {
        let mut job = ExportJob::new("users", "local", "users-export", 10, None);
        job.successful_rows = 7;
        assert_eq!(job.failed_rows_count(), 3);
    }
}
