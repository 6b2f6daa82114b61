//! Operation records: the durable state of a transfer.
//!
//! A `CopyOperation` is created by the orchestrator, owned by it for the
//! operation's duration and serialised to the resume store at checkpoints.
//! Completed-file entries are append-only while the operation is running
//! and are what makes an interrupted operation resumable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// What the operation does with the two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Copy everything source -> destination
    Copy,
    /// Copy everything, then delete the sources
    Move,
    /// Copy new and newer files only
    Sync,
    /// Sync plus deletion of destination-only files
    Mirror,
    /// Sync in both directions, conflicts logged
    BiDirectionalSync,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Copy => "copy",
            OperationType::Move => "move",
            OperationType::Sync => "sync",
            OperationType::Mirror => "mirror",
            OperationType::BiDirectionalSync => "bidirectional-sync",
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Terminal states are never resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed)
    }

    /// States a resume may continue from.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            OperationStatus::InProgress | OperationStatus::Paused | OperationStatus::Failed
        )
    }
}

/// Record of one successfully transferred file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedFileInfo {
    /// Path relative to the operation roots; unique within an operation
    pub relative_path: String,

    /// Source size at completion time
    pub file_size: u64,

    /// Source mtime at completion time (UTC)
    pub last_modified: DateTime<Utc>,

    /// When the transfer finished (UTC)
    pub completed_at: DateTime<Utc>,
}

/// Durable state of a transfer operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOperation {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub operation_type: OperationType,
    pub status: OperationStatus,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub total_files: u64,
    pub files_transferred: u64,

    pub current_file: Option<String>,
    pub error_message: Option<String>,
    pub can_resume: bool,

    pub completed_files: Vec<CompletedFileInfo>,

    pub files_deleted: u64,
    pub files_skipped: u64,
    pub files_failed: u64,

    pub total_compressed_bytes: u64,
    pub total_uncompressed_bytes: u64,
    pub files_compressed: u64,
}

impl CopyOperation {
    pub fn new(source: PathBuf, destination: PathBuf, operation_type: OperationType) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path: source,
            destination_path: destination,
            operation_type,
            status: OperationStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            total_bytes: 0,
            bytes_transferred: 0,
            total_files: 0,
            files_transferred: 0,
            current_file: None,
            error_message: None,
            can_resume: true,
            completed_files: Vec::new(),
            files_deleted: 0,
            files_skipped: 0,
            files_failed: 0,
            total_compressed_bytes: 0,
            total_uncompressed_bytes: 0,
            files_compressed: 0,
        }
    }

    /// Append a completion record, replacing any stale entry for the same
    /// relative path (re-copies after a mismatch).
    pub fn record_completed_file(
        &mut self,
        relative_path: String,
        file_size: u64,
        last_modified: DateTime<Utc>,
    ) {
        self.completed_files
            .retain(|f| f.relative_path != relative_path);
        self.completed_files.push(CompletedFileInfo {
            relative_path,
            file_size,
            last_modified,
            completed_at: Utc::now(),
        });
    }

    pub fn find_completed(&self, relative_path: &str) -> Option<&CompletedFileInfo> {
        self.completed_files
            .iter()
            .find(|f| f.relative_path == relative_path)
    }

    pub fn remove_completed(&mut self, relative_path: &str) {
        self.completed_files
            .retain(|f| f.relative_path != relative_path);
    }

    /// Seconds the operation has been (or was) running.
    pub fn duration_secs(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_defaults() {
        let op = CopyOperation::new(
            PathBuf::from("/src"),
            PathBuf::from("/dst"),
            OperationType::Copy,
        );

        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.can_resume);
        assert!(op.completed_files.is_empty());
        assert_eq!(op.bytes_transferred, 0);
        assert!(op.end_time.is_none());
    }

    #[test]
    fn test_status_predicates() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(!OperationStatus::Failed.is_terminal());

        assert!(OperationStatus::InProgress.is_resumable());
        assert!(OperationStatus::Paused.is_resumable());
        assert!(OperationStatus::Failed.is_resumable());
        assert!(!OperationStatus::Completed.is_resumable());
        assert!(!OperationStatus::Pending.is_resumable());
        assert!(!OperationStatus::Cancelled.is_resumable());
    }

    #[test]
    fn test_completed_files_unique_by_relative_path() {
        let mut op = CopyOperation::new(
            PathBuf::from("/src"),
            PathBuf::from("/dst"),
            OperationType::Copy,
        );

        op.record_completed_file("a/b.txt".to_string(), 100, Utc::now());
        op.record_completed_file("a/b.txt".to_string(), 200, Utc::now());

        assert_eq!(op.completed_files.len(), 1);
        assert_eq!(op.find_completed("a/b.txt").unwrap().file_size, 200);

        op.remove_completed("a/b.txt");
        assert!(op.find_completed("a/b.txt").is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let mut op = CopyOperation::new(
            PathBuf::from("/data/in"),
            PathBuf::from("/data/out"),
            OperationType::Mirror,
        );
        op.record_completed_file("x.bin".to_string(), 42, Utc::now());
        op.status = OperationStatus::Paused;

        let json = serde_json::to_string_pretty(&op).unwrap();
        let back: CopyOperation = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, op.id);
        assert_eq!(back.status, OperationStatus::Paused);
        assert_eq!(back.operation_type, OperationType::Mirror);
        assert_eq!(back.completed_files.len(), 1);
        assert_eq!(back.completed_files[0].relative_path, "x.bin");
    }
}
