use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_xlsxwriter::{Format, Workbook, Worksheet};

use crate::domains::core::file_storage_service::FileStorage;
use crate::errors::{DomainError, DomainResult};

use super::super::exporter::Exporter;
use super::super::manager::ExportContext;
use super::super::scheduler::{ExportTask, TaskSpec};
use super::super::types::ExportJob;

/// Materializes the CSV shards of an export into one XLSX workbook.
pub struct CreateXlsxFile {
    ctx: Arc<ExportContext>,
    exporter: Arc<dyn Exporter>,
    export: ExportJob,
}

impl CreateXlsxFile {
    pub fn new(ctx: Arc<ExportContext>, exporter: Arc<dyn Exporter>, export: ExportJob) -> Self {
        Self {
            ctx,
            exporter,
            export,
        }
    }
}

#[async_trait]
impl ExportTask for CreateXlsxFile {
    fn spec(&self) -> TaskSpec {
        TaskSpec {
            label: format!("create-xlsx:{}", self.export.id),
            tags: self.exporter.job_tags(&self.export),
            backoff: self.exporter.job_backoff(),
            retry_deadline: Utc::now() + self.exporter.job_retry_ttl(),
            lock_key: Some(format!("export:{}", self.export.id)),
        }
    }

    async fn run(&self) -> DomainResult<()> {
        let disk = self
            .ctx
            .storage
            .disk(&self.export.file_disk)
            .ok_or_else(|| DomainError::UnknownDisk(self.export.file_disk.clone()))?;

        let xlsx_path = self.export.xlsx_path();
        if disk.exists(&xlsx_path).await? {
            log::debug!("export {}: workbook already materialized", self.export.id);
            return Ok(());
        }

        let bytes = build_workbook(disk.as_ref(), self.exporter.as_ref(), &self.export).await?;
        disk.put(&xlsx_path, bytes).await?;
        Ok(())
    }
}

/// Assemble a workbook from `headers.csv` plus every numbered shard in
/// ascending order, writing rows into the sheet as each shard streams in.
/// Non-CSV files in the directory are ignored.
pub async fn build_workbook(
    disk: &dyn FileStorage,
    exporter: &dyn Exporter,
    export: &ExportJob,
) -> DomainResult<Vec<u8>> {
    let delimiter = exporter.csv_delimiter();
    let header_format = exporter.xlsx_header_cell_format();
    let cell_format = exporter.xlsx_cell_format();

    let mut workbook = Workbook::new();
    {
        let worksheet = workbook.add_worksheet();
        let mut next_row: u32 = 0;

        let headers = disk.get(&export.headers_path()).await?;
        write_csv_rows(worksheet, &headers, delimiter, header_format.as_ref(), &mut next_row)?;

        // Zero-padded names make the sorted listing numerically ascending.
        for name in disk.list(&export.file_directory()).await? {
            if name == "headers.csv" || !name.ends_with(".csv") {
                continue;
            }
            let shard = disk
                .get(&format!("{}/{}", export.file_directory(), name))
                .await?;
            write_csv_rows(worksheet, &shard, delimiter, cell_format.as_ref(), &mut next_row)?;
        }
    }

    exporter.configure_workbook_before_close(&mut workbook);

    // Stage through a temp dir before handing the bytes to blob storage.
    let staging = tempfile::tempdir().map_err(|e| DomainError::File(e.to_string()))?;
    let staged = staging.path().join(format!("{}.xlsx", export.file_name));
    workbook
        .save(&staged)
        .map_err(|e| DomainError::File(e.to_string()))?;
    tokio::fs::read(&staged)
        .await
        .map_err(|e| DomainError::File(e.to_string()))
}

fn write_csv_rows(
    worksheet: &mut Worksheet,
    bytes: &[u8],
    delimiter: u8,
    format: Option<&Format>,
    next_row: &mut u32,
) -> DomainResult<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    for result in reader.records() {
        let record = result.map_err(|e| DomainError::Serialization(e.to_string()))?;
        for (column, field) in record.iter().enumerate() {
            let column = column as u16;
            match format {
                Some(format) => worksheet
                    .write_string_with_format(*next_row, column, field, format)
                    .map_err(|e| DomainError::File(e.to_string()))?,
                None => worksheet
                    .write_string(*next_row, column, field)
                    .map_err(|e| DomainError::File(e.to_string()))?,
            };
        }
        *next_row += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::repository::ExportJobRepository;
    use crate::domains::export::test_support::{harness, test_rows, TestExporter};

    async fn seeded_export(
        harness: &crate::domains::export::test_support::TestHarness,
    ) -> ExportJob {
        let export = ExportJob::new("test_rows", "local", "test-export", 3, None);
        harness.ctx.repo.create_job(&export).await.unwrap();

        let disk = harness.ctx.storage.disk("local").unwrap();
        disk.put(&export.headers_path(), b"ID,Name\n".to_vec()).await.unwrap();
        disk.put(&export.shard_path(1), b"1,Test 1\n".to_vec()).await.unwrap();
        disk.put(&export.shard_path(2), b"2,Test 2\n".to_vec()).await.unwrap();
        export
    }

    #[tokio::test]
    async fn test_creates_workbook_from_csv_shards() {
        let harness = harness(test_rows()).await;
        let export = seeded_export(&harness).await;

        let task = CreateXlsxFile::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export.clone(),
        );
        task.run().await.unwrap();

        let disk = harness.ctx.storage.disk("local").unwrap();
        let bytes = disk.get(&export.xlsx_path()).await.unwrap();
        // XLSX files are zip archives.
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn test_existing_workbook_is_left_untouched() {
        let harness = harness(test_rows()).await;
        let export = seeded_export(&harness).await;

        let disk = harness.ctx.storage.disk("local").unwrap();
        disk.put(&export.xlsx_path(), b"already built".to_vec()).await.unwrap();

        let task = CreateXlsxFile::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export.clone(),
        );
        task.run().await.unwrap();

        let bytes = disk.get(&export.xlsx_path()).await.unwrap();
        assert_eq!(bytes, b"already built");
    }

    #[tokio::test]
    async fn test_ignores_non_csv_files() {
        let harness = harness(test_rows()).await;
        let export = seeded_export(&harness).await;

        let disk = harness.ctx.storage.disk("local").unwrap();
        disk.put(
            &format!("{}/some-file.txt", export.file_directory()),
            b"not a shard".to_vec(),
        )
        .await
        .unwrap();

        let task = CreateXlsxFile::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export.clone(),
        );
        task.run().await.unwrap();

        let bytes = disk.get(&export.xlsx_path()).await.unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn test_missing_directory_fails_the_task() {
        let harness = harness(test_rows()).await;
        let export = ExportJob::new("test_rows", "local", "never-written", 0, None);

        let task = CreateXlsxFile::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export,
        );
        assert!(task.run().await.is_err());
    }
}
