use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::auth::SubjectResolver;
use crate::errors::DomainResult;

use super::super::events::{EventSink, ExportEvent};
use super::super::exporter::Exporter;
use super::super::manager::ExportContext;
use super::super::repository::ExportJobRepository;
use super::super::scheduler::{ExportTask, TaskSpec};
use super::super::types::{ExportJob, ExportStatus};

/// Marks an export terminal and emits the completion event.
pub struct ExportCompletion {
    ctx: Arc<ExportContext>,
    exporter: Arc<dyn Exporter>,
    export: ExportJob,
}

impl ExportCompletion {
    pub fn new(ctx: Arc<ExportContext>, exporter: Arc<dyn Exporter>, export: ExportJob) -> Self {
        Self {
            ctx,
            exporter,
            export,
        }
    }
}

#[async_trait]
impl ExportTask for ExportCompletion {
    fn spec(&self) -> TaskSpec {
        TaskSpec {
            label: format!("export-completion:{}", self.export.id),
            tags: self.exporter.job_tags(&self.export),
            backoff: self.exporter.job_backoff(),
            retry_deadline: Utc::now() + self.exporter.job_retry_ttl(),
            lock_key: Some(format!("export:{}", self.export.id)),
        }
    }

    async fn run(&self) -> DomainResult<()> {
        self.ctx
            .repo
            .update_status(self.export.id, ExportStatus::Completed, Some(Utc::now()))
            .await?;
        log::debug!("export {} completed", self.export.id);

        // Notify only when the owner resolves to an authenticatable subject.
        let Some(owner) = &self.export.owner else {
            return Ok(());
        };
        if self.ctx.subjects.resolve(owner).await?.is_none() {
            return Ok(());
        }

        let export = self.ctx.repo.find_by_id(self.export.id).await?;
        let title = self.exporter.completed_notification_title(&export);
        let body = self.exporter.completed_notification_body(&export);
        self.ctx
            .events
            .dispatch(ExportEvent::Completed {
                export,
                title,
                body,
            })
            .await?;
        Ok(())
    }
}
