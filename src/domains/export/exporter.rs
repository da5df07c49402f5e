use std::time::Duration;

use rust_xlsxwriter::{Format, Workbook};

use super::column::ExportColumn;
use super::types::{ExportFormat, ExportJob};

/// Host-implemented definition of one exportable dataset.
///
/// The trait carries the column declarations plus every per-exporter
/// default the orchestrator can override: file disk and name, formats,
/// CSV delimiter, retry policy, XLSX styling and the completion
/// notification text.
pub trait Exporter: Send + Sync {
    /// Stable identifier stored on the export row.
    fn name(&self) -> &str;

    /// Column declarations, in output order.
    fn columns(&self) -> Vec<ExportColumn>;

    /// Default storage disk; `None` falls back to the configured default.
    fn file_disk(&self) -> Option<String> {
        None
    }

    /// Default base file name (no extension) for a created export.
    fn file_name(&self, export: &ExportJob) -> String {
        format!("{}-{}", self.name().replace('_', "-"), export.id)
    }

    fn formats(&self) -> Vec<ExportFormat> {
        vec![ExportFormat::Csv, ExportFormat::Xlsx]
    }

    fn csv_delimiter(&self) -> u8 {
        b','
    }

    fn completed_notification_title(&self, _export: &ExportJob) -> String {
        "Export completed".to_string()
    }

    fn completed_notification_body(&self, export: &ExportJob) -> String {
        let mut body = format!(
            "Your export has completed and {} rows exported.",
            export.successful_rows
        );
        if export.failed_rows_count() > 0 {
            body.push_str(&format!(" {} rows failed to export.", export.failed_rows_count()));
        }
        body
    }

    /// Delay before each retry of this exporter's tasks; its length bounds
    /// the attempt count.
    fn job_backoff(&self) -> Vec<Duration> {
        vec![
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(300),
            Duration::from_secs(600),
        ]
    }

    /// Absolute time-to-live for retrying a task after it is first run.
    fn job_retry_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(1)
    }

    fn job_tags(&self, export: &ExportJob) -> Vec<String> {
        vec![format!("export{}", export.id)]
    }

    fn xlsx_header_cell_format(&self) -> Option<Format> {
        None
    }

    fn xlsx_cell_format(&self) -> Option<Format> {
        None
    }

    /// Hook invoked on the assembled workbook just before it is saved.
    fn configure_workbook_before_close(&self, _workbook: &mut Workbook) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::test_support::TestExporter;

    #[test]
    fn test_default_file_name_includes_export_id() {
        let exporter = TestExporter::default();
        let export = ExportJob::new("test_rows", "local", "pending", 0, None);
        assert_eq!(
            exporter.file_name(&export),
            format!("test-rows-{}", export.id)
        );
    }

    #[test]
    fn test_default_notification_body_mentions_failures() {
        let exporter = TestExporter::default();
        let mut export = ExportJob::new("test_rows", "local", "f", 10, None);
        export.successful_rows = 8;

        let body = exporter.completed_notification_body(&export);
        assert!(body.contains("8 rows exported"));
        assert!(body.contains("2 rows failed"));
    }
}
