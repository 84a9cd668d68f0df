//! Per-case log sink.
//!
//! Provisioning suites run for a long time, so every case gets its own log
//! file under the configured log directory that can be tailed while the case
//! is still running. Retry attempts, script output and teardown errors all
//! land here.
//!
//! Each call to [`CaseLog::line`] appends one complete line under a lock and
//! flushes it, so concurrent writers (the retrier and a script's stdout and
//! stderr readers) never interleave partial lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Append-only log destination for one test case.
///
/// Cloning is cheap and every clone writes to the same file.
#[derive(Clone)]
pub struct CaseLog {
    case: Arc<str>,
    path: Option<PathBuf>,
    file: Option<Arc<Mutex<File>>>,
}

impl CaseLog {
    /// Creates (or truncates) `<dir>/<case>.log`.
    ///
    /// The directory is created if it does not exist yet.
    pub fn create(dir: &Path, case: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log dir: {}", dir.display()))?;

        let path = dir.join(format!("{}.log", file_stem(case)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open case log: {}", path.display()))?;

        Ok(Self {
            case: Arc::from(case),
            path: Some(path),
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// A log that only forwards to `tracing`.
    pub fn discard(case: &str) -> Self {
        Self {
            case: Arc::from(case),
            path: None,
            file: None,
        }
    }

    /// Name of the case this log belongs to.
    pub fn case(&self) -> &str {
        &self.case
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends a single line with a UTC timestamp.
    ///
    /// Write failures are reported through `tracing` and otherwise ignored.
    pub fn line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!(case = %self.case, "{}", msg);

        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            let result = writeln!(file, "{} {}", stamp, msg).and_then(|_| file.flush());
            if let Err(e) = result {
                tracing::warn!(case = %self.case, "Failed to write case log: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for CaseLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseLog")
            .field("case", &self.case)
            .field("path", &self.path)
            .finish()
    }
}

/// File name (without `.log`) used for `case`.
pub(crate) fn file_stem(case: &str) -> String {
    case.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lines_are_appended() {
        let temp_dir = TempDir::new().unwrap();
        let log = CaseLog::create(&temp_dir.path().join("logs"), "StorageCreate").unwrap();

        log.line("first");
        log.clone().line("second");

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }

    #[test]
    fn test_case_name_is_made_file_safe() {
        let temp_dir = TempDir::new().unwrap();
        let log = CaseLog::create(temp_dir.path(), "blob fs/list dirs").unwrap();

        assert_eq!(
            log.path().unwrap().file_name().unwrap().to_str().unwrap(),
            "blob_fs_list_dirs.log"
        );
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let temp_dir = TempDir::new().unwrap();
        let log = CaseLog::create(temp_dir.path(), "concurrent").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        log.line(format!("writer-{}-line-{}", i, j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 400);
        assert!(content.lines().all(|l| l.contains(" writer-")));
    }

    #[test]
    fn test_discard_has_no_path() {
        let log = CaseLog::discard("nothing");
        log.line("ignored");
        assert!(log.path().is_none());
        assert_eq!(log.case(), "nothing");
    }
}
