use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domains::core::file_storage_service::{FileStorage, FileStorageResult};
use crate::errors::{DomainError, DomainResult};

use super::exporter::Exporter;
use super::jobs::create_xlsx::build_workbook;
use super::manager::ExportContext;
use super::types::{ExportFormat, ExportJob};

/// A downloadable byte stream plus the metadata a transport layer needs.
pub struct Download {
    pub file_name: String,
    pub content_type: &'static str,
    pub stream: ReceiverStream<FileStorageResult<Vec<u8>>>,
}

/// Stream a completed export in the requested format.
///
/// A missing export directory is reported as not-found.
pub async fn download(
    ctx: &ExportContext,
    exporter: Arc<dyn Exporter>,
    export: &ExportJob,
    format: ExportFormat,
) -> DomainResult<Download> {
    let disk = ctx
        .storage
        .disk(&export.file_disk)
        .ok_or_else(|| DomainError::UnknownDisk(export.file_disk.clone()))?;

    if !disk.directory_exists(&export.file_directory()).await? {
        return Err(DomainError::EntityNotFound(
            "export file directory".to_string(),
            export.id,
        ));
    }

    match format {
        ExportFormat::Csv => stream_csv(disk, export, format),
        ExportFormat::Xlsx => stream_xlsx(disk, exporter, export, format).await,
    }
}

/// Emit `headers.csv` first, then every other shard in ascending numeric
/// order, chunk by chunk, skipping non-CSV files.
fn stream_csv(
    disk: Arc<dyn FileStorage>,
    export: &ExportJob,
    format: ExportFormat,
) -> DomainResult<Download> {
    let (tx, rx) = mpsc::channel::<FileStorageResult<Vec<u8>>>(8);
    let directory = export.file_directory();
    let headers_path = export.headers_path();
    let file_name = format!("{}.{}", export.file_name, format.extension());

    tokio::spawn(async move {
        match disk.get(&headers_path).await {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = tx.send(Err(error)).await;
                return;
            }
        }

        let names = match disk.list(&directory).await {
            Ok(names) => names,
            Err(error) => {
                let _ = tx.send(Err(error)).await;
                return;
            }
        };

        for name in names {
            if name == "headers.csv" || !name.ends_with(".csv") {
                continue;
            }
            let result = disk.get(&format!("{}/{}", directory, name)).await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                return;
            }
        }
    });

    Ok(Download {
        file_name,
        content_type: format.mime_type(),
        stream: ReceiverStream::new(rx),
    })
}

/// Stream the materialized workbook when it exists; otherwise assemble one
/// from the CSV shards on the fly.
async fn stream_xlsx(
    disk: Arc<dyn FileStorage>,
    exporter: Arc<dyn Exporter>,
    export: &ExportJob,
    format: ExportFormat,
) -> DomainResult<Download> {
    let xlsx_path = export.xlsx_path();
    let bytes = if disk.exists(&xlsx_path).await? {
        disk.get(&xlsx_path).await?
    } else {
        build_workbook(disk.as_ref(), exporter.as_ref(), export).await?
    };

    let (tx, rx) = mpsc::channel::<FileStorageResult<Vec<u8>>>(1);
    tokio::spawn(async move {
        let _ = tx.send(Ok(bytes)).await;
    });

    Ok(Download {
        file_name: format!("{}.{}", export.file_name, format.extension()),
        content_type: format.mime_type(),
        stream: ReceiverStream::new(rx),
    })
}
