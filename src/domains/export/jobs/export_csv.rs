use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::auth::SubjectResolver;
use crate::domains::core::file_storage_service::FileStorage;
use crate::errors::{DomainError, DomainResult};

use super::super::column::{EvalContext, ExportColumn};
use super::super::exporter::Exporter;
use super::super::manager::ExportContext;
use super::super::repository::ExportJobRepository;
use super::super::resolver::resolve_formatted;
use super::super::scheduler::{ExportTask, TaskSpec};
use super::super::source::{DataSource, QueryPlan};
use super::super::types::ExportJob;

/// Processes one shard of records into one shard file, updating the
/// export's progress counters.
pub struct ExportCsv {
    ctx: Arc<ExportContext>,
    exporter: Arc<dyn Exporter>,
    export: ExportJob,
    plan: QueryPlan,
    /// Explicit record ids; when set the page window is ignored.
    records: Option<Vec<String>>,
    page: u64,
    chunk_size: usize,
    column_map: Vec<(String, String)>,
    options: Map<String, Value>,
}

impl ExportCsv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<ExportContext>,
        exporter: Arc<dyn Exporter>,
        export: ExportJob,
        plan: QueryPlan,
        records: Option<Vec<String>>,
        page: u64,
        chunk_size: usize,
        column_map: Vec<(String, String)>,
        options: Map<String, Value>,
    ) -> Self {
        Self {
            ctx,
            exporter,
            export,
            plan,
            records,
            page,
            chunk_size,
            column_map,
            options,
        }
    }

    fn build_row(
        &self,
        columns: &HashMap<String, ExportColumn>,
        ctx: &EvalContext<'_>,
    ) -> DomainResult<Vec<String>> {
        self.column_map
            .iter()
            .map(|(name, _label)| {
                let column = columns
                    .get(name)
                    .ok_or_else(|| DomainError::UnknownColumn(name.clone()))?;
                resolve_formatted(column, ctx)
            })
            .collect()
    }

    fn encode_rows<'a>(
        &self,
        rows: impl IntoIterator<Item = Vec<&'a str>>,
    ) -> DomainResult<Vec<u8>> {
        let config = &self.ctx.config;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.exporter.csv_delimiter())
            .quote(config.csv_quote)
            .escape(config.csv_escape)
            .from_writer(Vec::new());
        for row in rows {
            writer
                .write_record(&row)
                .map_err(|e| DomainError::Serialization(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| DomainError::File(e.to_string()))
    }
}

#[async_trait]
impl ExportTask for ExportCsv {
    fn spec(&self) -> TaskSpec {
        TaskSpec {
            label: format!("export-csv:{}:{}", self.export.id, self.page),
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

        // Row resolution runs as the export's owner when one resolves.
        let subject = match &self.export.owner {
            Some(owner) => self.ctx.subjects.resolve(owner).await?,
            None => None,
        };
        let _scope = subject.clone().map(|s| self.ctx.identity.enter(s));

        let records = match &self.records {
            Some(ids) => self.ctx.source.fetch_by_ids(&self.plan, ids).await?,
            None => {
                self.ctx
                    .source
                    .fetch_page(&self.plan, self.page, self.chunk_size)
                    .await?
            }
        };
        log::debug!(
            "export {}: processing shard {} with {} record(s)",
            self.export.id,
            self.page,
            records.len()
        );

        // Header shard, exactly once per export. A lost race writes
        // identical bytes.
        let headers_path = self.export.headers_path();
        if !disk.exists(&headers_path).await? {
            let labels: Vec<&str> = self.column_map.iter().map(|(_, label)| label.as_str()).collect();
            disk.put(&headers_path, self.encode_rows([labels])?).await?;
        }

        let columns: HashMap<String, ExportColumn> = self
            .exporter
            .columns()
            .into_iter()
            .map(|column| (column.name().to_string(), column))
            .collect();

        let mut processed: i64 = 0;
        let mut successful: i64 = 0;
        let mut rows: Vec<Vec<String>> = Vec::with_capacity(records.len());

        for record in &records {
            processed += 1;
            let eval = EvalContext {
                record: Some(record),
                export: Some(&self.export),
                options: &self.options,
                subject: subject.as_ref(),
            };
            match self.build_row(&columns, &eval) {
                Ok(row) => {
                    rows.push(row);
                    successful += 1;
                }
                Err(error) => {
                    // One bad record never aborts the chunk.
                    log::warn!(
                        "export {}: record in shard {} failed to resolve: {}",
                        self.export.id,
                        self.page,
                        error
                    );
                }
            }
        }

        let encoded = self.encode_rows(
            rows.iter()
                .map(|row| row.iter().map(String::as_str).collect::<Vec<&str>>()),
        )?;
        disk.put(&self.export.shard_path(self.page), encoded).await?;

        self.ctx
            .repo
            .increment_progress(self.export.id, processed, successful)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::test_support::{harness, test_rows, TestExporter};
    use crate::errors::DomainError;

    fn column_map() -> Vec<(String, String)> {
        vec![("id".into(), "ID".into()), ("name".into(), "Name".into())]
    }

    fn job(
        harness: &crate::domains::export::test_support::TestHarness,
        export: &ExportJob,
        records: Option<Vec<String>>,
        page: u64,
    ) -> ExportCsv {
        ExportCsv::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export.clone(),
            QueryPlan::default(),
            records,
            page,
            100,
            column_map(),
            Map::new(),
        )
    }

    async fn create_export(
        harness: &crate::domains::export::test_support::TestHarness,
        total_rows: i64,
    ) -> ExportJob {
        let export = ExportJob::new("test_rows", "local", "test-export", total_rows, None);
        harness.ctx.repo.create_job(&export).await.unwrap();
        export
    }

    #[tokio::test]
    async fn test_processes_records_and_creates_shard_file() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        job(&harness, &export, Some(vec!["1".into(), "2".into(), "3".into()]), 1)
            .run()
            .await
            .unwrap();

        let found = harness.repo.find_by_id(export.id).await.unwrap();
        assert_eq!(found.processed_rows, 3);
        assert_eq!(found.successful_rows, 3);

        let disk = harness.ctx.storage.disk("local").unwrap();
        let shard = disk.get(&export.shard_path(1)).await.unwrap();
        assert_eq!(shard, b"1,Test 1\n2,Test 2\n3,Test 3\n");
        let headers = disk.get(&export.headers_path()).await.unwrap();
        assert_eq!(headers, b"ID,Name\n");
    }

    #[tokio::test]
    async fn test_missing_ids_are_silently_absent() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        job(&harness, &export, Some(vec!["999".into()]), 1)
            .run()
            .await
            .unwrap();

        let found = harness.repo.find_by_id(export.id).await.unwrap();
        assert_eq!(found.processed_rows, 0);
        assert_eq!(found.successful_rows, 0);
    }

    #[tokio::test]
    async fn test_shard_file_names_are_zero_padded() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        job(&harness, &export, Some(vec!["1".into()]), 42).run().await.unwrap();

        let disk = harness.ctx.storage.disk("local").unwrap();
        assert!(disk
            .exists(&format!("exports/{}/0000000000000042.csv", export.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_header_shard_written_once_across_retries() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        let disk = harness.ctx.storage.disk("local").unwrap();
        disk.put(&export.headers_path(), b"ID,Name\n".to_vec()).await.unwrap();

        // A redelivered task must not duplicate the header row.
        job(&harness, &export, Some(vec!["1".into()]), 1).run().await.unwrap();

        let headers = disk.get(&export.headers_path()).await.unwrap();
        assert_eq!(headers, b"ID,Name\n");
    }

    #[tokio::test]
    async fn test_counters_clamp_on_redelivery() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 2).await;

        let ids: Vec<String> = vec!["1".into(), "2".into(), "3".into()];
        job(&harness, &export, Some(ids.clone()), 1).run().await.unwrap();
        job(&harness, &export, Some(ids), 1).run().await.unwrap();

        let found = harness.repo.find_by_id(export.id).await.unwrap();
        assert_eq!(found.processed_rows, 2);
        assert_eq!(found.successful_rows, 2);
    }

    #[tokio::test]
    async fn test_pages_load_their_window() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        let mut task = job(&harness, &export, None, 2);
        task.chunk_size = 2;
        task.run().await.unwrap();

        let disk = harness.ctx.storage.disk("local").unwrap();
        let shard = disk.get(&export.shard_path(2)).await.unwrap();
        assert_eq!(shard, b"3,Test 3\n");
    }

    #[tokio::test]
    async fn test_record_failure_counts_processed_not_successful() {
        struct ExplodingExporter;
        impl Exporter for ExplodingExporter {
            fn name(&self) -> &str {
                "exploding"
            }
            fn columns(&self) -> Vec<ExportColumn> {
                vec![
                    ExportColumn::new("id"),
                    ExportColumn::new("name").state_using(|ctx| {
                        let record = ctx.record.expect("record");
                        if record.attribute("id") == Some(&serde_json::json!(2)) {
                            return Err(DomainError::Internal("Processing failed".into()));
                        }
                        Ok(record.attribute("name").cloned().unwrap_or_default())
                    }),
                ]
            }
        }

        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        let task = ExportCsv::new(
            harness.ctx.clone(),
            Arc::new(ExplodingExporter),
            export.clone(),
            QueryPlan::default(),
            Some(vec!["1".into(), "2".into(), "3".into()]),
            1,
            100,
            column_map(),
            Map::new(),
        );
        task.run().await.unwrap();

        let found = harness.repo.find_by_id(export.id).await.unwrap();
        assert_eq!(found.processed_rows, 3);
        assert_eq!(found.successful_rows, 2);

        // The failing record is absent from the shard.
        let disk = harness.ctx.storage.disk("local").unwrap();
        let shard = disk.get(&export.shard_path(1)).await.unwrap();
        assert_eq!(shard, b"1,Test 1\n3,Test 3\n");
    }

    #[tokio::test]
    async fn test_unknown_column_key_fails_each_record() {
        let harness = harness(test_rows()).await;
        let export = create_export(&harness, 3).await;

        let task = ExportCsv::new(
            harness.ctx.clone(),
            Arc::new(TestExporter::default()),
            export.clone(),
            QueryPlan::default(),
            Some(vec!["1".into()]),
            1,
            100,
            vec![("nope".into(), "Nope".into())],
            Map::new(),
        );
        task.run().await.unwrap();

        let found = harness.repo.find_by_id(export.id).await.unwrap();
        assert_eq!(found.processed_rows, 1);
        assert_eq!(found.successful_rows, 0);
    }
}
