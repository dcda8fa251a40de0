//! Progress registry: sessions and the store publish per-file byte
//! counters and a status tag; the terminal renderer polls snapshots.
//! Keeping the registry here avoids a reverse dependency from the core
//! into any UI.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    Unknown = 0,
    Initializing = 1,
    Downloading = 2,
    Uploading = 3,
    Comparing = 4,
    Done = 5,
    Failed = 6,
}

impl From<u8> for TransferStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Downloading,
            3 => Self::Uploading,
            4 => Self::Comparing,
            5 => Self::Done,
            6 => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Counters for one file. Updated with atomics so sessions never block
/// on the registry lock mid-transfer.
pub struct FileProgress {
    pub file_name: String,
    pub size: u64,
    bytes_transferred: AtomicU64,
    status: AtomicU8,
}

impl FileProgress {
    fn new(file_name: &str, size: u64) -> Self {
        Self {
            file_name: file_name.to_string(),
            size,
            bytes_transferred: AtomicU64::new(0),
            status: AtomicU8::new(TransferStatus::Unknown as u8),
        }
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: TransferStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus::from(self.status.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
pub struct ProgressRegistry {
    files: Mutex<HashMap<String, Arc<FileProgress>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `file_name`, created on first use. Repeated calls for
    /// the same name return the same entry.
    pub fn create(&self, file_name: &str, size: u64) -> Arc<FileProgress> {
        let mut files = self.files.lock().expect("progress lock poisoned");
        Arc::clone(
            files
                .entry(file_name.to_string())
                .or_insert_with(|| Arc::new(FileProgress::new(file_name, size))),
        )
    }

    pub fn snapshot(&self) -> Vec<Arc<FileProgress>> {
        let files = self.files.lock().expect("progress lock poisoned");
        let mut entries: Vec<Arc<FileProgress>> = files.values().cloned().collect();
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent_per_name() {
        let registry = ProgressRegistry::new();
        let first = registry.create("file.bin", 100);
        first.set_bytes(42);
        let second = registry.create("file.bin", 100);
        assert_eq!(second.bytes(), 42);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn status_roundtrips_through_atomic() {
        let registry = ProgressRegistry::new();
        let entry = registry.create("file.bin", 10);
        assert_eq!(entry.status(), TransferStatus::Unknown);
        entry.set_status(TransferStatus::Downloading);
        assert_eq!(entry.status(), TransferStatus::Downloading);
        entry.set_status(TransferStatus::Done);
        assert_eq!(entry.status(), TransferStatus::Done);
    }
}
