//! File storage driver
//!
//! One file per graph at `<data_dir>/<project>/<document>/<owner>.<ext>`.
//!
//! A write first checks the file's current version against the version the
//! caller loaded. A mismatch rejects the write without touching the disk.
//! Otherwise the current file is renamed to `<file>.old` and the new content is
//! streamed into the primary path. On success the backup is removed (or kept
//! as history); on failure the partial file is removed and the backup renamed
//! back, so the primary file keeps its original content and modification time.
//! No `.old` file outlives a write.
//!
//! Within the process, every access to one file goes through striped
//! reader/writer locks, so a reader never sees a file that is still being
//! streamed or briefly moved aside. Writers from other processes are only
//! caught by the version check.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use crate::core::config::{ConcurrencyCheck, StorageConfig};
use crate::storage::backup::{BackupHistory, HistoryEntry};
use crate::system::metrics::Metrics;
use crate::types::{
    ContentDigest, DocumentKey, Error, FileRecord, FileVersion, Result, StorageError, Timestamp,
};

/// Number of striped locks serializing file access per key
const FILE_STRIPES: usize = 64;

/// Suffix of the transient pre-write backup
const BACKUP_SUFFIX: &str = ".old";

/// Outcome of a startup recovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Backups renamed back because the primary file was missing
    pub restored: Vec<PathBuf>,
    /// Backups removed because the primary file was intact
    pub discarded: Vec<PathBuf>,
}

/// Persists graph files with backup-and-restore writes and an optimistic
/// concurrency check
pub struct FileStorageDriver {
    root: PathBuf,
    extension: &'static str,
    check: ConcurrencyCheck,
    history: BackupHistory,
    stripes: Vec<RwLock<()>>,
    metrics: Option<&'static Metrics>,
}

impl FileStorageDriver {
    /// Create a driver rooted at `config.data_dir`, writing files with `extension`
    pub fn new(config: &StorageConfig, extension: &'static str) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            root: config.data_dir.clone(),
            extension,
            check: config.concurrency_check,
            history: BackupHistory::new(config.backup.clone()),
            stripes: (0..FILE_STRIPES).map(|_| RwLock::new(())).collect(),
            metrics: None,
        })
    }

    /// Record disk activity in the global metrics
    pub fn with_metrics(mut self, metrics: &'static Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Root data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Concurrency check in effect
    pub fn concurrency_check(&self) -> ConcurrencyCheck {
        self.check
    }

    /// Location of the graph file for `key`
    pub fn graph_path(&self, key: &DocumentKey) -> PathBuf {
        self.root
            .join(key.project().to_string())
            .join(key.document().to_string())
            .join(format!("{}.{}", key.owner(), self.extension))
    }

    /// Location of the transient backup of `key` during a write
    pub fn backup_path(&self, key: &DocumentKey) -> PathBuf {
        with_suffix(&self.graph_path(key), BACKUP_SUFFIX)
    }

    /// True if a graph file exists for `key`
    pub fn exists(&self, key: &DocumentKey) -> bool {
        let _stripe = self.stripe(key).read();
        self.graph_path(key).is_file()
    }

    /// Modification time of the graph file, `None` if there is no file
    pub fn timestamp(&self, key: &DocumentKey) -> Result<Option<Timestamp>> {
        let _stripe = self.stripe(key).read();
        match fs::metadata(self.graph_path(key)) {
            Ok(meta) => Ok(Some(Timestamp::from_system_time(meta.modified()?))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current version of the graph file, including a digest when digest
    /// checking is enabled
    pub fn version(&self, key: &DocumentKey) -> Result<Option<FileVersion>> {
        let _stripe = self.stripe(key).read();
        self.current_version(&self.graph_path(key), self.check == ConcurrencyCheck::TimestampAndDigest)
    }

    /// Read the complete graph file
    pub fn read(&self, key: &DocumentKey) -> Result<FileRecord> {
        let path = self.graph_path(key);
        let _stripe = self.stripe(key).read();
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata()?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes)?;

        let version = FileVersion {
            timestamp: Timestamp::from_system_time(meta.modified()?),
            size: bytes.len() as u64,
            digest: self.digest_enabled().then(|| ContentDigest::of(&bytes)),
        };
        if let Some(metrics) = self.metrics {
            metrics.disk.reads.inc();
        }
        debug!("Read {} ({} bytes) {}", key, bytes.len(), version);
        Ok(FileRecord { bytes, version })
    }

    /// Replace the graph file for `key` with the output of `encode`.
    ///
    /// `expected` is the version the caller loaded. When a file exists and its
    /// version differs, the write is rejected with
    /// [`StorageError::ConcurrentModification`] and nothing is written. Without
    /// an expected version, or when the file does not exist yet, the write
    /// proceeds unconditionally.
    pub fn write<F>(&self, key: &DocumentKey, expected: Option<&FileVersion>, encode: F) -> Result<FileVersion>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let path = self.graph_path(key);
        let backup = with_suffix(&path, BACKUP_SUFFIX);
        let _stripe = self.stripe(key).write();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let with_digest = expected.map_or(false, |v| v.digest.is_some());
        let current = self.current_version(&path, with_digest)?;
        if let (Some(expected), Some(actual)) = (expected, current) {
            if !expected.matches(&actual) {
                if let Some(metrics) = self.metrics {
                    metrics.disk.rejected_writes.inc();
                }
                warn!("Rejected write of {}: loaded {}, on disk {}", key, expected, actual);
                return Err(StorageError::ConcurrentModification {
                    key: key.to_string(),
                    expected: *expected,
                    actual,
                }
                .into());
            }
        } else if expected.is_some() {
            debug!("Graph file of {} vanished since it was loaded, writing it anew", key);
        }

        let has_backup = current.is_some();
        if has_backup {
            fs::rename(&path, &backup)?;
        }

        match self.stream_to(&path, encode, false) {
            Ok(version) => {
                if has_backup {
                    self.retire_backup(&path, &backup);
                }
                if let Some(metrics) = self.metrics {
                    metrics.disk.writes.inc();
                }
                debug!("Wrote {} {}", key, version);
                Ok(version)
            }
            Err(write_error) => {
                remove_if_present(&path);
                if has_backup {
                    if let Err(restore_error) = fs::rename(&backup, &path) {
                        warn!("Restoring {} failed: {}", backup.display(), restore_error);
                        return Err(StorageError::RestoreFailed {
                            key: key.to_string(),
                            write_error: write_error.to_string(),
                            restore_error,
                        }
                        .into());
                    }
                    if let Some(metrics) = self.metrics {
                        metrics.disk.restored_backups.inc();
                    }
                }
                warn!("Write of {} failed, previous state kept: {}", key, write_error);
                Err(write_error)
            }
        }
    }

    /// Write raw bytes; see [`FileStorageDriver::write`]
    pub fn write_bytes(&self, key: &DocumentKey, expected: Option<&FileVersion>, bytes: &[u8]) -> Result<FileVersion> {
        self.write(key, expected, |out| Ok(out.write_all(bytes)?))
    }

    /// Create the graph file for `key`, failing with [`Error::AlreadyExists`]
    /// if it is already present. A failed encode leaves no file behind.
    pub fn create<F>(&self, key: &DocumentKey, encode: F) -> Result<FileVersion>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let path = self.graph_path(key);
        let _stripe = self.stripe(key).write();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.stream_to(&path, encode, true) {
            Ok(version) => {
                if let Some(metrics) = self.metrics {
                    metrics.disk.writes.inc();
                }
                debug!("Created {} {}", key, version);
                Ok(version)
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::already_exists(key.to_string()))
            }
            Err(e) => {
                remove_if_present(&path);
                Err(e)
            }
        }
    }

    /// Delete the graph file. Returns false if there was nothing to delete.
    pub fn delete(&self, key: &DocumentKey) -> Result<bool> {
        let path = self.graph_path(key);
        let _stripe = self.stripe(key).write();
        remove_if_present(&with_suffix(&path, BACKUP_SUFFIX));
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(metrics) = self.metrics {
                    metrics.disk.deletes.inc();
                }
                debug!("Deleted {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// History copies of the graph file, newest first
    pub fn list_history(&self, key: &DocumentKey) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.list(&self.graph_path(key))?)
    }

    /// Resolve backups left behind by an interrupted process.
    ///
    /// A backup whose primary file is missing is renamed back; a backup next
    /// to an intact primary file is removed.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                let Some(primary_name) = name.to_string_lossy().strip_suffix(BACKUP_SUFFIX).map(str::to_owned)
                else {
                    continue;
                };
                let primary = dir.join(primary_name);
                if primary.exists() {
                    fs::remove_file(&path)?;
                    report.discarded.push(path);
                } else {
                    fs::rename(&path, &primary)?;
                    report.restored.push(primary);
                }
            }
        }

        if !report.restored.is_empty() || !report.discarded.is_empty() {
            info!(
                "Recovery restored {} and discarded {} leftover backups",
                report.restored.len(),
                report.discarded.len()
            );
        }
        Ok(report)
    }

    fn digest_enabled(&self) -> bool {
        self.check == ConcurrencyCheck::TimestampAndDigest
    }

    fn stripe(&self, key: &DocumentKey) -> &RwLock<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn current_version(&self, path: &Path, with_digest: bool) -> Result<Option<FileVersion>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let digest = if with_digest {
            match fs::read(path) {
                Ok(bytes) => Some(ContentDigest::of(&bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        Ok(Some(FileVersion {
            timestamp: Timestamp::from_system_time(meta.modified()?),
            size: meta.len(),
            digest,
        }))
    }

    fn stream_to<F>(&self, path: &Path, encode: F, create_new: bool) -> Result<FileVersion>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let mut options = OpenOptions::new();
        options.write(true);
        if create_new {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options.open(path)?;

        let mut writer = DigestWriter::new(BufWriter::new(file), self.digest_enabled());
        encode(&mut writer)?;
        let (file, size, digest) = writer.finish()?;
        file.sync_all()?;

        let meta = file.metadata()?;
        Ok(FileVersion {
            timestamp: Timestamp::from_system_time(meta.modified()?),
            size,
            digest,
        })
    }

    fn retire_backup(&self, path: &Path, backup: &Path) {
        match self.history.retire(path, backup) {
            Ok(Some(_)) => {
                if let Some(metrics) = self.metrics {
                    metrics.disk.history_backups.inc();
                }
            }
            Ok(None) => {}
            Err(e) => {
                // The write itself succeeded; a stale backup is resolved by recovery
                warn!("Could not dispose of {}: {}", backup.display(), e);
                remove_if_present(backup);
            }
        }
    }
}

/// Counts and optionally hashes everything written through it
struct DigestWriter {
    inner: BufWriter<File>,
    hasher: Option<blake3::Hasher>,
    written: u64,
}

impl DigestWriter {
    fn new(inner: BufWriter<File>, hash: bool) -> Self {
        Self {
            inner,
            hasher: hash.then(blake3::Hasher::new),
            written: 0,
        }
    }

    fn finish(self) -> io::Result<(File, u64, Option<ContentDigest>)> {
        let digest = self.hasher.as_ref().map(ContentDigest::from_hasher);
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        Ok((file, self.written, digest))
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
