pub mod file_storage_service;

// Re-export the traits and core types, not specific implementations usually
pub use file_storage_service::{FileStorage, FileStorageError, FileStorageResult, LocalFileStorage, StorageManager};
