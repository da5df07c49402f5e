// Public modules
pub mod auth;
pub mod domains;
pub mod errors;
pub mod types;

pub use domains::export::{
    downloader::{download, Download},
    manager::{ExportContext, ExportManager, StartedExport},
    types::{ExportConfig, ExportFormat, ExportJob, ExportRequest, ExportStatus},
};
