//! Shared fixtures for the export domain's tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_stream::StreamExt;

use crate::auth::{AuthContext, IdentityCell, OwnerRef, SubjectResolver};
use crate::domains::core::file_storage_service::{LocalFileStorage, StorageManager};
use crate::errors::DomainResult;
use crate::types::UserRole;

use super::column::ExportColumn;
use super::downloader::Download;
use super::events::{ChannelEventSink, ExportEvent, NullEventSink};
use super::exporter::Exporter;
use super::manager::ExportContext;
use super::record::Record;
use super::repository::SqliteExportJobRepository;
use super::source::{DataSource, StaticDataSource};
use super::types::ExportConfig;

/// Single-connection in-memory pool so every query sees the same database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool")
}

/// Exporter over a small `test_rows` dataset, with fast retries.
#[derive(Default)]
pub struct TestExporter {
    pub formats: Option<Vec<super::types::ExportFormat>>,
}

impl Exporter for TestExporter {
    fn name(&self) -> &str {
        "test_rows"
    }

    fn columns(&self) -> Vec<ExportColumn> {
        vec![
            ExportColumn::new("id").label("ID"),
            ExportColumn::new("name").label("Name"),
            ExportColumn::new("hidden").enabled_by_default(false),
        ]
    }

    fn formats(&self) -> Vec<super::types::ExportFormat> {
        self.formats
            .clone()
            .unwrap_or_else(|| vec![super::types::ExportFormat::Csv, super::types::ExportFormat::Xlsx])
    }

    fn job_backoff(&self) -> Vec<Duration> {
        vec![Duration::from_millis(1); 2]
    }

    fn job_retry_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(30)
    }
}

/// Three-row dataset matching [`TestExporter`].
pub fn test_rows() -> Vec<Record> {
    vec![
        Record::new().with_attribute("id", 1).with_attribute("name", "Test 1"),
        Record::new().with_attribute("id", 2).with_attribute("name", "Test 2"),
        Record::new().with_attribute("id", 3).with_attribute("name", "Test 3"),
    ]
}

/// Resolver backed by a fixed owner → subject map.
#[derive(Default)]
pub struct MapSubjectResolver {
    subjects: HashMap<OwnerRef, AuthContext>,
}

impl MapSubjectResolver {
    pub fn with(mut self, owner: OwnerRef, subject: AuthContext) -> Self {
        self.subjects.insert(owner, subject);
        self
    }
}

#[async_trait]
impl SubjectResolver for MapSubjectResolver {
    async fn resolve(&self, owner: &OwnerRef) -> DomainResult<Option<AuthContext>> {
        Ok(self.subjects.get(owner).cloned())
    }
}

pub struct TestHarness {
    pub ctx: Arc<ExportContext>,
    pub repo: Arc<SqliteExportJobRepository>,
    pub pool: SqlitePool,
    /// Keeps the backing directory alive for the test's duration.
    pub storage_dir: TempDir,
}

/// Build an export context over an in-memory repository, a temp-dir "local"
/// disk and the given records.
pub async fn harness(rows: Vec<Record>) -> TestHarness {
    harness_with_source(Arc::new(StaticDataSource::new(rows))).await
}

pub async fn harness_with_source(source: Arc<dyn DataSource>) -> TestHarness {
    let pool = memory_pool().await;
    let repo = Arc::new(SqliteExportJobRepository::new(pool.clone()));
    repo.migrate().await.unwrap();

    let storage_dir = TempDir::new().unwrap();
    let storage = Arc::new(
        StorageManager::new().register(
            "local",
            Arc::new(LocalFileStorage::new(storage_dir.path()).unwrap()),
        ),
    );

    let ctx = Arc::new(ExportContext {
        repo: repo.clone(),
        storage,
        source,
        events: Arc::new(NullEventSink),
        subjects: Arc::new(crate::auth::NullSubjectResolver),
        identity: Arc::new(IdentityCell::new()),
        config: ExportConfig::default(),
    });

    TestHarness {
        ctx,
        repo,
        pool,
        storage_dir,
    }
}

/// Swap the context's event sink for a channel and return the receiver.
pub fn with_channel_events(
    harness: &mut TestHarness,
) -> tokio::sync::mpsc::UnboundedReceiver<ExportEvent> {
    let (sink, receiver) = ChannelEventSink::new();
    let ctx = Arc::get_mut(&mut harness.ctx).expect("context not yet shared");
    ctx.events = Arc::new(sink);
    receiver
}

/// Swap the context's subject resolver.
pub fn with_subjects(harness: &mut TestHarness, owner: OwnerRef, user_id: uuid::Uuid) {
    let resolver = MapSubjectResolver::default()
        .with(owner, AuthContext::new(user_id, UserRole::Member));
    let ctx = Arc::get_mut(&mut harness.ctx).expect("context not yet shared");
    ctx.subjects = Arc::new(resolver);
}

/// Drain a download stream into one byte buffer.
pub async fn read_download(download: Download) -> Vec<u8> {
    let mut stream = download.stream;
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend(chunk.expect("download chunk"));
    }
    bytes
}
