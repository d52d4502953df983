//! History backups
//!
//! After a successful write the driver hands the `.old` file to
//! [`BackupHistory::retire`]. With history disabled it is removed. With history
//! enabled it is kept as `<file>.<millis>.bak` when the newest kept copy is
//! older than the configured interval, and the history is pruned by count and
//! age. Either way no `.old` file remains.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::core::config::BackupConfig;
use crate::types::Timestamp;

/// One retained pre-write copy of a graph file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Location of the copy
    pub path: PathBuf,
    /// When the copy was retained, in milliseconds since the epoch
    pub created_millis: u64,
}

/// Retention policy for pre-write copies
#[derive(Debug, Clone)]
pub struct BackupHistory {
    config: BackupConfig,
}

impl BackupHistory {
    /// Create a history manager for the given retention settings
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Retention settings
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Dispose of the backup left by a successful write of `primary`.
    ///
    /// Returns the history copy if one was retained.
    pub fn retire(&self, primary: &Path, backup: &Path) -> io::Result<Option<PathBuf>> {
        if !self.config.enabled() {
            fs::remove_file(backup)?;
            return Ok(None);
        }

        let now = Timestamp::now().as_millis();
        let due = match self.list(primary)?.first() {
            Some(newest) => now.saturating_sub(newest.created_millis) >= duration_millis(self.config.interval),
            None => true,
        };

        let target = history_path(primary, now);
        if !due || target.exists() {
            fs::remove_file(backup)?;
            return Ok(None);
        }

        fs::rename(backup, &target)?;
        tracing::debug!("Retained history copy {}", target.display());
        self.prune(primary, now)?;
        Ok(Some(target))
    }

    /// History copies of `primary`, newest first
    pub fn list(&self, primary: &Path) -> io::Result<Vec<HistoryEntry>> {
        let (Some(dir), Some(name)) = (primary.parent(), primary.file_name()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", name.to_string_lossy());

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut history = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(stamp) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".bak"))
            else {
                continue;
            };
            if let Ok(created_millis) = stamp.parse::<u64>() {
                history.push(HistoryEntry {
                    path: entry.path(),
                    created_millis,
                });
            }
        }
        history.sort_by(|a, b| b.created_millis.cmp(&a.created_millis));
        Ok(history)
    }

    fn prune(&self, primary: &Path, now_millis: u64) -> io::Result<()> {
        let keep_age = duration_millis(self.config.keep_age);
        for (index, entry) in self.list(primary)?.into_iter().enumerate() {
            let over_count = self.config.keep_number > 0 && index >= self.config.keep_number;
            let too_old = keep_age > 0 && now_millis.saturating_sub(entry.created_millis) > keep_age;
            if over_count || too_old {
                match fs::remove_file(&entry.path) {
                    Ok(()) => tracing::debug!("Pruned history copy {}", entry.path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn history_path(primary: &Path, millis: u64) -> PathBuf {
    let mut name = OsString::from(primary.as_os_str());
    name.push(format!(".{}.bak", millis));
    PathBuf::from(name)
}

fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn history(interval: Duration, keep_number: usize) -> BackupHistory {
        BackupHistory::new(BackupConfig {
            interval,
            keep_number,
            keep_age: Duration::ZERO,
        })
    }

    #[test]
    fn disabled_history_removes_backup() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("anna.bin");
        let backup = dir.path().join("anna.bin.old");
        fs::write(&backup, b"previous").unwrap();

        let kept = history(Duration::ZERO, 3).retire(&primary, &backup).unwrap();
        assert!(kept.is_none());
        assert!(!backup.exists());
    }

    #[test]
    fn enabled_history_keeps_first_copy_then_waits_for_interval() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("anna.bin");
        let backup = dir.path().join("anna.bin.old");
        let policy = history(Duration::from_secs(3600), 3);

        fs::write(&backup, b"v1").unwrap();
        let kept = policy.retire(&primary, &backup).unwrap().unwrap();
        assert_eq!(fs::read(&kept).unwrap(), b"v1");
        assert!(!backup.exists());

        // Within the interval the next backup is simply discarded
        fs::write(&backup, b"v2").unwrap();
        assert!(policy.retire(&primary, &backup).unwrap().is_none());
        assert!(!backup.exists());
        assert_eq!(policy.list(&primary).unwrap().len(), 1);
    }

    #[test]
    fn pruning_keeps_newest_copies() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("anna.bin");
        for millis in [1_000u64, 2_000, 3_000] {
            fs::write(history_path(&primary, millis), b"old").unwrap();
        }
        // Unrelated files in the same directory are ignored
        fs::write(dir.path().join("bob.bin.4000.bak"), b"other").unwrap();

        let backup = dir.path().join("anna.bin.old");
        fs::write(&backup, b"latest").unwrap();
        let policy = history(Duration::from_millis(1), 2);
        let kept = policy.retire(&primary, &backup).unwrap().unwrap();

        let remaining = policy.list(&primary).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].path, kept);
        assert_eq!(remaining[1].created_millis, 3_000);
        assert!(dir.path().join("bob.bin.4000.bak").exists());
    }
}
