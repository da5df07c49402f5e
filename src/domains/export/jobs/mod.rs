pub mod completion;
pub mod create_xlsx;
pub mod export_csv;

pub use completion::ExportCompletion;
pub use create_xlsx::CreateXlsxFile;
pub use export_csv::ExportCsv;
