//! Crash-safe persistence of operation state.
//!
//! Each operation is one pretty-printed JSON record under
//! `<state_root>/KopioRapido/Operations/<uuid>.json`, written via a sibling
//! temp file, fsync and rename so an interrupted write can never corrupt
//! the canonical record. Every operation also gets a plain-text log file
//! under `Logs/<uuid>.log`.

use crate::operation::{CopyOperation, OperationStatus};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Subdirectory of the state root owned by this engine.
const APP_DIR: &str = "KopioRapido";

/// Persist state every this many completed files.
pub const CHECKPOINT_INTERVAL_FILES: u64 = 10;

/// Store of durable operation records and per-operation logs.
pub struct ResumeStore {
    root: PathBuf,
}

impl ResumeStore {
    /// Open (and create) the store under `state_dir`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let root = state_dir.join(APP_DIR);
        fs::create_dir_all(root.join("Operations"))
            .map_err(|e| EngineError::Store(format!("cannot create state directory: {e}")))?;
        fs::create_dir_all(root.join("Logs"))
            .map_err(|e| EngineError::Store(format!("cannot create log directory: {e}")))?;
        Ok(Self { root })
    }

    fn operations_dir(&self) -> PathBuf {
        self.root.join("Operations")
    }

    fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.operations_dir().join(format!("{id}.json"))
    }

    fn log_path(&self, id: Uuid) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    /// Persist a record atomically: temp file, fsync, rename over canonical.
    pub fn save(&self, operation: &CopyOperation) -> Result<()> {
        let canonical = self.record_path(operation.id);
        let temp = self
            .operations_dir()
            .join(format!("{}.json.tmp", operation.id));

        {
            let mut file = fs::File::create(&temp)?;
            serde_json::to_writer_pretty(&mut file, operation)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        fs::rename(&temp, &canonical)?;
        Ok(())
    }

    /// Load one record; Ok(None) when it does not exist.
    pub fn load(&self, id: Uuid) -> Result<Option<CopyOperation>> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Remove a record and its log. Idempotent.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        for path in [self.record_path(id), self.log_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// All parseable records. Corrupted files are skipped with a warning,
    /// never a failure.
    pub fn list_all(&self) -> Result<Vec<CopyOperation>> {
        let mut operations = Vec::new();

        for entry in fs::read_dir(self.operations_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(EngineError::from)
                .and_then(|content| Ok(serde_json::from_str::<CopyOperation>(&content)?))
            {
                Ok(op) => operations.push(op),
                Err(e) => {
                    tracing::warn!(
                        "skipping unreadable operation record {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok(operations)
    }

    /// Operations worth offering for resume: a resumable status, the resume
    /// flag still set, and a source tree that still exists.
    pub fn list_resumable(&self) -> Result<Vec<CopyOperation>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|op| {
                op.status.is_resumable() && op.can_resume && op.source_path.exists()
            })
            .collect())
    }

    /// Whether `id` can be resumed right now.
    pub fn can_resume(&self, id: Uuid) -> bool {
        match self.load(id) {
            Ok(Some(op)) => op.status.is_resumable() && op.can_resume && op.source_path.exists(),
            _ => false,
        }
    }

    /// Open (appending) the operation's log file.
    pub fn open_log(&self, id: Uuid) -> Result<OperationLog> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))
            .map_err(|e| EngineError::Store(format!("cannot open operation log: {e}")))?;
        Ok(OperationLog {
            file: Mutex::new(file),
        })
    }
}

/// Line-per-event plain-text log for one operation.
///
/// Format: `YYYY-MM-DD HH:MM:SS.fff [LEVEL] message [| File: <path>]` with
/// an indented `Exception:` continuation for error details.
pub struct OperationLog {
    file: Mutex<fs::File>,
}

impl OperationLog {
    fn write_line(&self, level: &str, message: &str, file_path: Option<&Path>, detail: Option<&str>) {
        let mut line = format!(
            "{} [{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
        if let Some(path) = file_path {
            line.push_str(&format!(" | File: {}", path.display()));
        }
        if let Some(detail) = detail {
            line.push_str(&format!("\n    Exception: {detail}"));
        }
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.write_all(line.as_bytes());
    }

    pub fn info(&self, message: &str) {
        self.write_line("INFO", message, None, None);
    }

    pub fn warn(&self, message: &str) {
        self.write_line("WARN", message, None, None);
    }

    pub fn error(&self, message: &str) {
        self.write_line("ERROR", message, None, None);
    }

    pub fn file_event(&self, level: &str, message: &str, path: &Path) {
        self.write_line(level, message, Some(path), None);
    }

    pub fn exception(&self, message: &str, path: Option<&Path>, error: &dyn std::fmt::Display) {
        self.write_line("ERROR", message, path, Some(&error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use tempfile::TempDir;

    fn operation() -> CopyOperation {
        CopyOperation::new(
            std::env::temp_dir(),
            PathBuf::from("/dst"),
            OperationType::Copy,
        )
    }

    #[test]
    fn test_save_and_load_round_trip() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;

        let loaded = store.load(op.id)?.unwrap();
        assert_eq!(loaded.id, op.id);
        assert_eq!(loaded.operation_type, OperationType::Copy);

        Ok(())
    }

    #[test]
    fn test_record_is_indented_json() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;

        let raw = fs::read_to_string(store.record_path(op.id)).unwrap();
        assert!(raw.contains("\n  \"id\""), "expected 2-space indentation");

        Ok(())
    }

    #[test]
    fn test_save_leaves_no_temp_files() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;
        store.save(&op)?;

        let names: Vec<String> = fs::read_dir(store.operations_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", op.id)]);

        Ok(())
    }

    #[test]
    fn test_load_missing_is_none() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;
        assert!(store.load(Uuid::new_v4())?.is_none());
        Ok(())
    }

    #[test]
    fn test_delete_is_idempotent() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;
        store.delete(op.id)?;
        store.delete(op.id)?;

        assert!(store.load(op.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupted_record_skipped_in_listing() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;
        fs::write(
            store.operations_dir().join(format!("{}.json", Uuid::new_v4())),
            b"{ not json",
        )
        .unwrap();

        let all = store.list_all()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, op.id);

        Ok(())
    }

    #[test]
    fn test_list_resumable_filters() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        // Paused with live source: resumable
        let mut paused = operation();
        paused.status = OperationStatus::Paused;
        store.save(&paused)?;

        // Completed: not resumable
        let mut done = operation();
        done.status = OperationStatus::Completed;
        store.save(&done)?;

        // In progress but source gone: not resumable
        let mut gone = operation();
        gone.status = OperationStatus::InProgress;
        gone.source_path = dir.path().join("vanished");
        store.save(&gone)?;

        // Failed but resume disabled: not resumable
        let mut no_resume = operation();
        no_resume.status = OperationStatus::Failed;
        no_resume.can_resume = false;
        store.save(&no_resume)?;

        let resumable = store.list_resumable()?;
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, paused.id);

        assert!(store.can_resume(paused.id));
        assert!(!store.can_resume(done.id));
        assert!(!store.can_resume(gone.id));

        Ok(())
    }

    #[test]
    fn test_stale_temp_file_never_corrupts_canonical_record() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;

        let op = operation();
        store.save(&op)?;

        // A crash between serialise and rename leaves a half-written temp
        // next to the record; the canonical file must stay readable and
        // the temp must never be listed.
        fs::write(
            store.operations_dir().join(format!("{}.json.tmp", op.id)),
            b"{ \"id\": \"trunca",
        )
        .unwrap();

        let loaded = store.load(op.id)?.unwrap();
        assert_eq!(loaded.id, op.id);
        let all = store.list_all()?;
        assert_eq!(all.len(), 1);

        // The next save replaces the stale temp and still lands atomically
        store.save(&op)?;
        assert!(store.load(op.id)?.is_some());

        Ok(())
    }

    #[test]
    fn test_operation_log_format() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path())?;
        let id = Uuid::new_v4();

        let log = store.open_log(id)?;
        log.info("operation started");
        log.file_event("WARN", "retrying transfer", Path::new("/src/a.bin"));
        log.exception(
            "transfer failed",
            Some(Path::new("/src/b.bin")),
            &"disk unplugged",
        );

        let content = fs::read_to_string(store.logs_dir().join(format!("{id}.log"))).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert!(lines[0].contains("[INFO] operation started"));
        assert!(lines[1].contains("[WARN] retrying transfer | File: /src/a.bin"));
        assert!(lines[2].contains("[ERROR] transfer failed | File: /src/b.bin"));
        assert!(lines[3].contains("    Exception: disk unplugged"));

        // Timestamp prefix: YYYY-MM-DD HH:MM:SS.fff
        assert_eq!(&lines[0][4..5], "-");
        assert_eq!(&lines[0][19..20], ".");

        Ok(())
    }
}
