//! Per-file transfer machinery: progress records, aggregation, adaptive
//! monitoring and the file operator itself.

pub mod monitor;
pub mod operator;
pub mod progress;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Snapshot of one file transfer, emitted to the progress sink.
#[derive(Debug, Clone, Serialize)]
pub struct FileTransferProgress {
    pub operation_id: Uuid,
    pub file_name: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,

    pub file_size: u64,
    pub bytes_transferred: u64,

    pub compressed_bytes_transferred: u64,
    pub is_compressed: bool,
    /// uncompressed / compressed for this file; 1.0 when not compressing
    pub compression_ratio: f64,

    pub current_speed_bytes_per_second: u64,
    pub average_speed_bytes_per_second: u64,

    pub retry_attempt: u32,
    pub max_retry_attempts: u32,
    pub is_retrying: bool,
    pub last_error: Option<String>,
}

impl FileTransferProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.file_size > 0 {
            (self.bytes_transferred as f64 / self.file_size as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Callback receiving progress events. The engine may drop intermediate
/// events under load but always delivers the final per-file event.
pub type ProgressSink = Arc<dyn Fn(FileTransferProgress) + Send + Sync>;

/// A sink that discards everything.
pub fn null_sink() -> ProgressSink {
    Arc::new(|_| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_complete() {
        let mut progress = FileTransferProgress {
            operation_id: Uuid::new_v4(),
            file_name: "f.bin".to_string(),
            source_path: PathBuf::from("/src/f.bin"),
            destination_path: PathBuf::from("/dst/f.bin"),
            file_size: 200,
            bytes_transferred: 50,
            compressed_bytes_transferred: 0,
            is_compressed: false,
            compression_ratio: 1.0,
            current_speed_bytes_per_second: 0,
            average_speed_bytes_per_second: 0,
            retry_attempt: 0,
            max_retry_attempts: 3,
            is_retrying: false,
            last_error: None,
        };

        assert!((progress.percent_complete() - 25.0).abs() < f64::EPSILON);

        progress.file_size = 0;
        assert_eq!(progress.percent_complete(), 0.0);
    }
}
