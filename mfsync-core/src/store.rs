//! Storage handler: enumerates the storage root, tracks which files are
//! stored, available from peers or currently being written, and owns
//! the temp-file / rename lifecycle of incoming transfers.
//!
//! A file is identified by its relative path and size. Incoming data is
//! written to `<root>/<name>.mfsync` and atomically renamed into place
//! on finalize; partially written temps survive a crash and seed the
//! resume offset of the next attempt.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::progress::{ProgressRegistry, TransferStatus};

/// Suffix of in-flight temp files; scan skips them.
pub const TMP_SUFFIX: &str = ".mfsync";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("file is already stored")]
    AlreadyStored,
    #[error("file is already locked by another writer")]
    AlreadyLocked,
    #[error("file is not locked for writing")]
    NotLocked,
    #[error("file is not stored")]
    NotStored,
    #[error("sha256 mismatch after transfer")]
    HashMismatch,
    #[error("not enough free space")]
    InsufficientSpace,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Identity and metadata of one shared file. Equality is
/// `(file_name, size)`; the hash only participates in finalize
/// verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name && self.size == other.size
    }
}

impl Eq for FileInfo {}

impl std::hash::Hash for FileInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.file_name.hash(state);
        self.size.hash(state);
    }
}

impl FileInfo {
    /// Build a `FileInfo` for a regular file under `base`. The name is
    /// the path relative to `base`; the hash stays empty until someone
    /// asks for a comparison.
    pub fn from_path(path: &Path, base: &Path) -> io::Result<Self> {
        let metadata = path.metadata()?;
        let relative = path.strip_prefix(base).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "path escapes the storage root")
        })?;
        Ok(Self {
            file_name: relative.to_string_lossy().replace('\\', "/"),
            size: metadata.len(),
            sha256sum: None,
        })
    }
}

/// Streaming sha256 of a file, hex encoded.
pub fn sha256sum(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// A file a peer announced but we do not hold yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableFile {
    pub file_info: FileInfo,
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub public_key: String,
}

/// A concrete pull request: which file, from which byte, in which
/// chunk granularity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedFile {
    pub file_info: FileInfo,
    pub offset: u64,
    #[serde(rename = "chunksize")]
    pub chunk_size: u32,
}

/// Relative names come from the network; refuse anything that could
/// escape the storage root.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let path = Path::new(name);
    let sane = !name.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if sane {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[derive(Default)]
struct StoreState {
    stored: BTreeMap<String, FileInfo>,
    available: BTreeMap<String, AvailableFile>,
    in_flight: HashMap<String, Arc<AtomicBool>>,
}

pub struct Store {
    root: PathBuf,
    state: Mutex<StoreState>,
    new_available: Notify,
    progress: Arc<ProgressRegistry>,
    verify_hash: bool,
}

impl Store {
    pub fn new(root: PathBuf, verify_hash: bool, progress: Arc<ProgressRegistry>) -> Self {
        Self {
            root,
            state: Mutex::new(StoreState::default()),
            new_available: Notify::new(),
            progress,
            verify_hash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_path(&self, info: &FileInfo) -> PathBuf {
        self.root.join(format!("{}{}", info.file_name, TMP_SUFFIX))
    }

    pub fn store_path(&self, info: &FileInfo) -> PathBuf {
        self.root.join(&info.file_name)
    }

    /// Scan the storage root and replace the stored set. Enumeration
    /// runs on the blocking pool; the store lock is only taken to merge
    /// the result.
    pub async fn init(&self) -> Result<(), StoreError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .expect("storage scan task panicked")?;

        for info in &files {
            let entry = self.progress.create(&info.file_name, info.size);
            entry.set_status(TransferStatus::Initializing);
            entry.set_bytes(info.size);
        }

        {
            let mut state = self.state.lock().expect("store lock poisoned");
            state.stored = files
                .into_iter()
                .map(|info| (info.file_name.clone(), info))
                .collect();
            let StoreState {
                stored, available, ..
            } = &mut *state;
            available.retain(|name, _| !stored.contains_key(name));
        }

        for entry in self.progress.snapshot() {
            if entry.status() == TransferStatus::Initializing {
                entry.set_status(TransferStatus::Done);
            }
        }
        Ok(())
    }

    /// Free-space check against the file size.
    pub fn can_store(&self, info: &FileInfo) -> bool {
        match free_space(&self.root) {
            Some(free) => free >= info.size,
            None => true,
        }
    }

    pub fn is_stored(&self, info: &FileInfo) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .stored
            .get(&info.file_name)
            .is_some_and(|stored| stored == info)
    }

    pub fn is_name_stored(&self, name: &str) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        state.stored.contains_key(name)
    }

    pub fn is_available(&self, name: &str) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        state.available.contains_key(name)
    }

    /// Whether some writer currently holds the name. A dropped writer
    /// releases its lock through the alive-token without calling back
    /// into the store.
    pub fn in_progress(&self, info: &FileInfo) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .in_flight
            .get(&info.file_name)
            .is_some_and(|token| token.load(Ordering::Acquire))
    }

    pub fn add_available_file(&self, file: AvailableFile) {
        self.add_available_files(vec![file]);
    }

    /// Insert peer announcements, dropping anything already stored, and
    /// wake the scheduler if the set grew.
    pub fn add_available_files(&self, files: Vec<AvailableFile>) {
        let mut state = self.state.lock().expect("store lock poisoned");
        let mut inserted = false;
        for file in files {
            if state.stored.contains_key(&file.file_info.file_name) {
                continue;
            }
            inserted |= state
                .available
                .insert(file.file_info.file_name.clone(), file)
                .is_none();
        }
        drop(state);
        if inserted {
            self.new_available.notify_waiters();
        }
    }

    pub fn get_stored_files(&self) -> Vec<FileInfo> {
        let state = self.state.lock().expect("store lock poisoned");
        state.stored.values().cloned().collect()
    }

    pub fn get_available_files(&self) -> Vec<AvailableFile> {
        let state = self.state.lock().expect("store lock poisoned");
        state.available.values().cloned().collect()
    }

    /// Resolves when new available files have been inserted.
    pub async fn wait_new_available(&self) {
        self.new_available.notified().await;
    }

    /// Stored files with their hashes filled in, computing and caching
    /// any that are still missing. Served to peers that verify on
    /// finalize.
    pub async fn stored_files_with_hashes(&self) -> Vec<FileInfo> {
        let missing: Vec<FileInfo> = {
            let state = self.state.lock().expect("store lock poisoned");
            state
                .stored
                .values()
                .filter(|info| info.sha256sum.is_none())
                .cloned()
                .collect()
        };

        for info in missing {
            let path = self.store_path(&info);
            let computed = tokio::task::spawn_blocking(move || sha256sum(&path))
                .await
                .expect("hash task panicked");
            match computed {
                Ok(hash) => {
                    let mut state = self.state.lock().expect("store lock poisoned");
                    if let Some(entry) = state.stored.get_mut(&info.file_name) {
                        entry.sha256sum = Some(hash);
                    }
                }
                Err(error) => {
                    debug!(file = %info.file_name, %error, "hashing stored file failed");
                }
            }
        }
        self.get_stored_files()
    }

    /// Open (or re-open) the temp file for `req` and lock the name.
    /// Sets `req.offset` to the temp file's current size so interrupted
    /// transfers resume where they stopped.
    pub fn create_file(&self, req: &mut RequestedFile) -> Result<FileWriter, StoreError> {
        validate_name(&req.file_info.file_name)?;
        if !self.can_store(&req.file_info) {
            return Err(StoreError::InsufficientSpace);
        }

        let token = {
            let mut state = self.state.lock().expect("store lock poisoned");
            if state.stored.contains_key(&req.file_info.file_name) {
                return Err(StoreError::AlreadyStored);
            }
            if state
                .in_flight
                .get(&req.file_info.file_name)
                .is_some_and(|token| token.load(Ordering::Acquire))
            {
                return Err(StoreError::AlreadyLocked);
            }
            let token = Arc::new(AtomicBool::new(true));
            state
                .in_flight
                .insert(req.file_info.file_name.clone(), Arc::clone(&token));
            token
        };

        match self.open_tmp(req) {
            Ok(file) => Ok(FileWriter {
                file: tokio::fs::File::from_std(file),
                token,
            }),
            Err(error) => {
                token.store(false, Ordering::Release);
                let mut state = self.state.lock().expect("store lock poisoned");
                state.in_flight.remove(&req.file_info.file_name);
                Err(error.into())
            }
        }
    }

    fn open_tmp(&self, req: &mut RequestedFile) -> io::Result<std::fs::File> {
        let path = self.tmp_path(&req.file_info);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        req.offset = file.metadata()?.len();
        Ok(file)
    }

    /// Move a completed transfer into place: verify the hash when
    /// enabled, rename temp to final, update the sets.
    pub async fn finalize_file(&self, info: &FileInfo) -> Result<(), StoreError> {
        {
            let state = self.state.lock().expect("store lock poisoned");
            if !state.in_flight.contains_key(&info.file_name) {
                debug!(file = %info.file_name, "refusing finalize of unlocked file");
                return Err(StoreError::NotLocked);
            }
            if state.stored.contains_key(&info.file_name) {
                debug!(file = %info.file_name, "refusing finalize of stored file");
                return Err(StoreError::AlreadyStored);
            }
        }

        let tmp = self.tmp_path(info);
        let mut finalized = info.clone();
        if self.verify_hash {
            if let Some(expected) = &info.sha256sum {
                let path = tmp.clone();
                let computed = tokio::task::spawn_blocking(move || sha256sum(&path))
                    .await
                    .expect("hash task panicked")?;
                if &computed != expected {
                    return Err(StoreError::HashMismatch);
                }
                finalized.sha256sum = Some(computed);
            }
        }

        std::fs::rename(&tmp, self.store_path(info))?;

        let mut state = self.state.lock().expect("store lock poisoned");
        state.in_flight.remove(&info.file_name);
        state.available.remove(&info.file_name);
        state
            .stored
            .insert(finalized.file_name.clone(), finalized);
        Ok(())
    }

    /// Open a stored file for streaming to a peer.
    pub async fn read_file(&self, info: &FileInfo) -> Result<tokio::fs::File, StoreError> {
        if !self.is_stored(info) {
            return Err(StoreError::NotStored);
        }
        Ok(tokio::fs::File::open(self.store_path(info)).await?)
    }
}

/// Writer half of an in-flight transfer. Owns the alive-token: dropping
/// the writer releases the name lock and closes the temp file, which is
/// what keeps aborted sessions from wedging the store.
pub struct FileWriter {
    file: tokio::fs::File,
    token: Arc<AtomicBool>,
}

impl FileWriter {
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.token.store(false, Ordering::Release);
    }
}

/// Recursive enumeration of the storage root. Temp files, symlinks and
/// hidden entries are skipped.
fn scan_directory(root: &Path) -> io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let file_type = std::fs::symlink_metadata(&path)?.file_type();
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                match FileInfo::from_path(&path, root) {
                    Ok(info) => files.push(info),
                    Err(error) => {
                        debug!(path = %path.display(), %error, "skipping unreadable entry")
                    }
                }
            }
        }
    }
    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(files)
}

#[cfg(unix)]
fn free_space(root: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let target = if root.exists() {
        root
    } else {
        root.parent().filter(|p| p.exists())?
    };
    let path = CString::new(target.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn free_space(_root: &Path) -> Option<u64> {
    None
}
