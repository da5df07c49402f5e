pub mod column;
pub mod downloader;
pub mod events;
pub mod exporter;
pub mod jobs;
pub mod manager;
pub mod record;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use column::{AggregateFunction, AggregateSpec, ConfigValue, EvalContext, ExportColumn};
pub use downloader::{download, Download};
pub use events::{ChannelEventSink, EventSink, ExportEvent, NullEventSink};
pub use exporter::Exporter;
pub use jobs::{CreateXlsxFile, ExportCompletion, ExportCsv};
pub use manager::{ExportContext, ExportManager, StartedExport};
pub use record::{Record, RelationValue, SegmentKind};
pub use repository::{ExportJobRepository, SqliteExportJobRepository};
pub use scheduler::{
    ExecutionPlan, ExecutionStatus, ExportTask, JobScheduler, ScheduleHandle, TaskSpec,
    TokioScheduler,
};
pub use source::{DataSource, QueryPlan, SerializedQuery, StaticDataSource};
pub use types::{ExportConfig, ExportFormat, ExportJob, ExportRequest, ExportStatus};
