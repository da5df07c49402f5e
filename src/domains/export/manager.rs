use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::auth::{AuthContext, IdentityCell, SubjectResolver};
use crate::domains::core::file_storage_service::{FileStorage, StorageManager};
use crate::errors::{DomainError, ServiceResult};
use crate::types::Permission;

use super::column::{ConfigValue, EvalContext};
use super::events::EventSink;
use super::exporter::Exporter;
use super::jobs::{CreateXlsxFile, ExportCompletion, ExportCsv};
use super::repository::ExportJobRepository;
use super::scheduler::{ExecutionPlan, ExportTask, FailureHook, JobScheduler, ScheduleHandle};
use super::source::{DataSource, QueryPlan, SerializedQuery};
use super::types::{ExportConfig, ExportFormat, ExportJob, ExportRequest, ExportStatus};

/// Collaborators the export pipeline runs against. Built once by the host
/// and shared by the orchestrator, its tasks and the download surface.
pub struct ExportContext {
    pub repo: Arc<dyn ExportJobRepository>,
    pub storage: Arc<StorageManager>,
    pub source: Arc<dyn DataSource>,
    pub events: Arc<dyn EventSink>,
    pub subjects: Arc<dyn SubjectResolver>,
    pub identity: Arc<IdentityCell>,
    pub config: ExportConfig,
}

/// An export accepted for processing: the persisted job plus a handle on
/// the asynchronous execution.
pub struct StartedExport {
    pub job: ExportJob,
    pub handle: ScheduleHandle,
}

type QueryModifier = Arc<dyn Fn(SerializedQuery, &Map<String, Value>) -> SerializedQuery + Send + Sync>;

/// Validates an export request, persists the job row and schedules the
/// parallel-then-sequential task graph.
pub struct ExportManager {
    ctx: Arc<ExportContext>,
    scheduler: Arc<dyn JobScheduler>,
    exporter: Arc<dyn Exporter>,
    chunk_size: ConfigValue<usize>,
    max_rows: Option<ConfigValue<u64>>,
    file_disk: Option<ConfigValue<String>>,
    file_name: Option<ConfigValue<String>>,
    formats: Option<ConfigValue<Vec<ExportFormat>>>,
    options: Map<String, Value>,
    modify_query: Option<QueryModifier>,
}

impl ExportManager {
    pub fn new(
        ctx: Arc<ExportContext>,
        scheduler: Arc<dyn JobScheduler>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        let chunk_size = ctx.config.default_chunk_size;
        Self {
            ctx,
            scheduler,
            exporter,
            chunk_size: ConfigValue::Literal(chunk_size),
            max_rows: None,
            file_disk: None,
            file_name: None,
            formats: None,
            options: Map::new(),
            modify_query: None,
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = ConfigValue::Literal(size);
        self
    }

    pub fn max_rows(mut self, rows: u64) -> Self {
        self.max_rows = Some(ConfigValue::Literal(rows));
        self
    }

    pub fn file_disk(mut self, disk: impl Into<String>) -> Self {
        self.file_disk = Some(ConfigValue::Literal(disk.into()));
        self
    }

    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(ConfigValue::Literal(name.into()));
        self
    }

    /// Compute the file name lazily; the export being created is available
    /// on the evaluation context.
    pub fn file_name_with(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.file_name = Some(ConfigValue::Computed(Arc::new(f)));
        self
    }

    pub fn formats(mut self, formats: Vec<ExportFormat>) -> Self {
        self.formats = Some(ConfigValue::Literal(formats));
        self
    }

    pub fn options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn modify_query_using(
        mut self,
        f: impl Fn(SerializedQuery, &Map<String, Value>) -> SerializedQuery + Send + Sync + 'static,
    ) -> Self {
        self.modify_query = Some(Arc::new(f));
        self
    }

    /// Start the export process. Validation failures surface before any
    /// state is persisted; afterwards execution is asynchronous and the
    /// returned job reflects its starting snapshot.
    pub async fn start(
        &self,
        auth: &AuthContext,
        request: ExportRequest,
    ) -> ServiceResult<StartedExport> {
        auth.authorize(Permission::ExportData)?;

        let eval = EvalContext::with_options(&self.options);

        let mut query = request.query.unwrap_or_default();
        if let Some(modify) = &self.modify_query {
            query = modify(query, &self.options);
        }

        // 1. Total rows: explicit ids count as-is, a query is counted by the
        //    source (which honors any pre-existing row limit).
        let count_plan = QueryPlan::new(query.clone());
        let total_rows: u64 = match &request.records {
            Some(ids) => ids.len() as u64,
            None => self.ctx.source.count(&count_plan).await?,
        };

        // 2. Row ceiling, before any persisted state exists.
        if let Some(max_rows) = &self.max_rows {
            let max_rows = max_rows.get(&eval);
            if max_rows < total_rows {
                return Err(DomainError::RowLimitExceeded {
                    max: max_rows,
                    total: total_rows,
                }
                .into());
            }
        }

        // 3. Column map: explicit, or enabled-by-default columns in
        //    declaration order.
        let columns = self.exporter.columns();
        let column_map: Vec<(String, String)> = match request.column_map {
            Some(map) => map,
            None => columns
                .iter()
                .filter(|column| column.is_enabled_by_default(&eval))
                .map(|column| (column.name().to_string(), column.get_label(&eval)))
                .collect(),
        };
        if column_map.is_empty() {
            return Err(DomainError::NoColumnsSelected.into());
        }

        // 4. Persist the job early so its id is durable, then clear any
        //    leftover directory for a reused id before tasks can race it.
        let file_disk = self
            .file_disk
            .as_ref()
            .map(|disk| disk.get(&eval))
            .or_else(|| self.exporter.file_disk())
            .unwrap_or_else(|| self.ctx.config.default_file_disk.clone());

        let mut export = ExportJob::new(
            self.exporter.name(),
            file_disk.clone(),
            format!("temp-{}", Utc::now().timestamp()),
            total_rows as i64,
            request.owner,
        );
        self.ctx.repo.create_job(&export).await?;

        let disk = self
            .ctx
            .storage
            .disk(&file_disk)
            .ok_or_else(|| DomainError::UnknownDisk(file_disk.clone()))?;
        disk.delete_directory(&export.file_directory())
            .await
            .map_err(DomainError::from)?;

        // 5. Final file name: explicit override wins over the exporter's.
        let file_name = match &self.file_name {
            Some(name) => {
                let mut eval = EvalContext::with_options(&self.options);
                eval.export = Some(&export);
                name.get(&eval)
            }
            None => self.exporter.file_name(&export),
        };
        self.ctx.repo.update_file_name(export.id, &file_name).await?;
        export.file_name = file_name;

        let formats = self
            .formats
            .as_ref()
            .map(|formats| formats.get(&eval))
            .unwrap_or_else(|| self.exporter.formats());
        let has_csv = formats.contains(&ExportFormat::Csv);
        let has_xlsx = formats.contains(&ExportFormat::Xlsx);

        // 6. Query plan shipped to the chunk tasks: aggregates and
        //    eager-load hints derived from the mapped columns.
        let mut aggregates = Vec::new();
        let mut eager_load: Vec<String> = Vec::new();
        for (name, _) in &column_map {
            if let Some(column) = columns.iter().find(|c| c.name() == name) {
                aggregates.extend(column.aggregates().iter().cloned());
            }
            if let Some(dot) = name.rfind('.') {
                let prefix = name[..dot].to_string();
                if !eager_load.contains(&prefix) {
                    eager_load.push(prefix);
                }
            }
        }
        let plan = QueryPlan {
            query,
            aggregates,
            eager_load,
        };

        // 7. One chunk task per page, or a single task over the id list.
        let chunk_size = self.chunk_size.get(&eval).max(1);
        let mut batch: Vec<Arc<dyn ExportTask>> = Vec::new();
        match request.records {
            Some(ids) => {
                batch.push(Arc::new(ExportCsv::new(
                    self.ctx.clone(),
                    self.exporter.clone(),
                    export.clone(),
                    plan.clone(),
                    Some(ids),
                    1,
                    chunk_size,
                    column_map.clone(),
                    self.options.clone(),
                )));
            }
            None => {
                let pages = total_rows.div_ceil(chunk_size as u64);
                for page in 1..=pages {
                    batch.push(Arc::new(ExportCsv::new(
                        self.ctx.clone(),
                        self.exporter.clone(),
                        export.clone(),
                        plan.clone(),
                        None,
                        page,
                        chunk_size,
                        column_map.clone(),
                        self.options.clone(),
                    )));
                }
            }
        }

        // The XLSX step runs before completion when XLSX is the only
        // format, but after completion when CSV is also requested, so the
        // CSV becomes downloadable the moment the export completes.
        let make_xlsx = || -> Arc<dyn ExportTask> {
            Arc::new(CreateXlsxFile::new(
                self.ctx.clone(),
                self.exporter.clone(),
                export.clone(),
            ))
        };
        let mut chain: Vec<Arc<dyn ExportTask>> = Vec::new();
        if has_xlsx && !has_csv {
            chain.push(make_xlsx());
        }
        chain.push(Arc::new(ExportCompletion::new(
            self.ctx.clone(),
            self.exporter.clone(),
            export.clone(),
        )));
        if has_xlsx && has_csv {
            chain.push(make_xlsx());
        }

        let repo = self.ctx.repo.clone();
        let export_id = export.id;
        let on_failure: FailureHook = Arc::new(move |error| {
            let repo = repo.clone();
            Box::pin(async move {
                log::error!("export {} failed: {}", export_id, error);
                if let Err(update_error) = repo
                    .update_status(export_id, ExportStatus::Failed, None)
                    .await
                {
                    log::error!(
                        "export {}: failed to record failure: {}",
                        export_id,
                        update_error
                    );
                }
            })
        });

        let handle = self.scheduler.dispatch(ExecutionPlan {
            batch,
            chain,
            on_failure: Some(on_failure),
        });

        log::debug!(
            "export {} started: {} row(s), chunk size {}",
            export.id,
            total_rows,
            chunk_size
        );

        Ok(StartedExport {
            job: export,
            handle,
        })
    }
}
