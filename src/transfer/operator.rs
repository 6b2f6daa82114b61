//! Single-file transfer execution.
//!
//! Routes each file down one of three paths: a buffered direct copy, the
//! delta pipeline against an existing destination, or stream-compression
//! through a temp file for slow remote links. The whole attempt runs under
//! the retry executor; retries surface to the progress sink with
//! `is_retrying` set.

use crate::compress;
use crate::config::RetryConfig;
use crate::retry::execute_with_retry;
use crate::store::OperationLog;
use crate::sync;
use crate::transfer::progress::ProgressTracker;
use crate::transfer::{FileTransferProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Write-side buffering for the direct path.
const WRITE_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Minimum interval between non-terminal progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Suffix for the compressed intermediate next to the destination.
const COMPRESSED_TEMP_SUFFIX: &str = "tmp.zst";

/// One file the orchestrator wants moved.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub operation_id: Uuid,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub relative: PathBuf,
    pub file_size: u64,
}

/// Strategy-level switches applied per file.
#[derive(Debug, Clone, Copy)]
pub struct TransferFlags {
    pub allow_compression: bool,
    pub allow_delta: bool,
    pub buffer_size_kib: usize,
}

/// What actually happened to one file.
#[derive(Debug, Clone, Copy)]
pub struct TransferOutcome {
    pub file_size: u64,
    pub was_compressed: bool,
    pub used_delta: bool,
    /// On-the-wire bytes when compressed (0 otherwise)
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
}

/// Removes a temp file on every exit path.
struct TempGuard(PathBuf);

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Executes single-file transfers for an operation.
pub struct FileOperator {
    retry: RetryConfig,
    tracker: Arc<ProgressTracker>,
    sink: ProgressSink,
}

impl FileOperator {
    pub fn new(retry: RetryConfig, tracker: Arc<ProgressTracker>, sink: ProgressSink) -> Self {
        Self {
            retry,
            tracker,
            sink,
        }
    }

    /// Transfer one file, choosing the path from the flags and the file
    /// itself. Compression wins over delta when both would apply.
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        flags: &TransferFlags,
        cancel: &CancellationToken,
        log: &OperationLog,
    ) -> Result<TransferOutcome> {
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let use_compression = flags.allow_compression && compress::should_compress(&request.source);
        let use_delta = !use_compression
            && flags.allow_delta
            && sync::should_use_delta(&request.source, &request.destination)
                .map(|(use_delta, _)| use_delta)
                .unwrap_or(false);

        let outcome = execute_with_retry(
            &self.retry,
            cancel,
            |attempt, error, _delay| {
                log.file_event(
                    "WARN",
                    &format!("attempt {attempt} failed, retrying: {error}"),
                    &request.source,
                );
                self.emit_retry(request, attempt, error);
            },
            {
                let this = self;
                let buffer_size_kib = flags.buffer_size_kib;
                move |_attempt| async move {
                    if use_compression {
                        this.compressed_copy(request, cancel).await
                    } else if use_delta {
                        this.delta_copy(request, cancel).await
                    } else {
                        this.direct_copy(request, buffer_size_kib, cancel).await
                    }
                }
            },
        )
        .await?;

        // Destination mirrors the source's modification time so later sync
        // runs classify it as identical.
        crate::fs::metadata::copy_mtime(&request.source, &request.destination)?;

        self.tracker
            .add_completed_file(request.operation_id, outcome.file_size);
        self.emit_terminal(request, &outcome);

        log.file_event(
            "INFO",
            &format!(
                "transferred {} bytes ({})",
                outcome.file_size,
                if outcome.was_compressed {
                    "compressed"
                } else if outcome.used_delta {
                    "delta"
                } else {
                    "direct"
                }
            ),
            &request.source,
        );

        Ok(outcome)
    }

    /// Buffered sequential copy with time-based progress.
    async fn direct_copy(
        &self,
        request: &TransferRequest,
        buffer_size_kib: usize,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let mut reader = tokio::fs::File::open(&request.source).await?;
        let writer = tokio::fs::File::create(&request.destination).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, writer);

        let mut buf = vec![0u8; buffer_size_kib.max(1) * 1024];
        let mut transferred = 0u64;
        let mut last_emit = Instant::now();
        let mut last_bytes = 0u64;

        loop {
            if cancel.is_cancelled() {
                // The partial destination stays behind for a delta resume
                return Err(EngineError::Cancelled);
            }

            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            writer.write_all(&buf[..n]).await?;
            transferred += n as u64;

            let elapsed = last_emit.elapsed();
            if elapsed >= PROGRESS_INTERVAL {
                let speed =
                    ((transferred - last_bytes) as f64 / elapsed.as_secs_f64()) as u64;
                self.emit_running(request, transferred, speed, false, 0);
                last_emit = Instant::now();
                last_bytes = transferred;
            }
        }

        writer.flush().await?;

        Ok(TransferOutcome {
            file_size: transferred,
            was_compressed: false,
            used_delta: false,
            compressed_bytes: 0,
            uncompressed_bytes: transferred,
        })
    }

    /// Delta pipeline over the existing destination.
    async fn delta_copy(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let outcome = sync::sync_file(&request.source, &request.destination, cancel).await?;

        debug!(
            file = %request.relative.display(),
            delta_bytes = outcome.delta_bytes,
            fallback = outcome.used_fallback,
            "delta path finished"
        );

        Ok(TransferOutcome {
            file_size: outcome.file_size,
            was_compressed: false,
            used_delta: !outcome.used_fallback,
            compressed_bytes: 0,
            uncompressed_bytes: outcome.file_size,
        })
    }

    /// Stream-compress into a sibling temp, then decompress into the final
    /// destination. The destination ends up byte-identical to the source;
    /// compression only saves on-the-wire bytes.
    async fn compressed_copy(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let temp = temp_compressed_path(&request.destination);
        let _guard = TempGuard(temp.clone());

        // Compress source -> temp
        let compress_totals = {
            let mut reader = tokio::fs::File::open(&request.source).await?;
            let writer = tokio::fs::File::create(&temp).await?;

            let mut last_instant = Instant::now();
            let mut last_bytes = 0u64;
            let totals = compress::compress_stream(
                &mut reader,
                writer,
                |uncompressed, compressed, _ratio| {
                    let elapsed = last_instant.elapsed().as_secs_f64();
                    let speed = if elapsed > 0.0 {
                        ((uncompressed - last_bytes) as f64 / elapsed) as u64
                    } else {
                        0
                    };
                    last_instant = Instant::now();
                    last_bytes = uncompressed;
                    self.emit_running(request, uncompressed, speed, true, compressed);
                },
                cancel,
            )
            .await?;
            totals
        };

        // Decompress temp -> destination
        {
            let mut reader = tokio::fs::File::open(&temp).await?;
            let writer = tokio::fs::File::create(&request.destination).await?;
            compress::decompress_stream(&mut reader, writer, |_, _, _| {}, cancel).await?;
        }

        Ok(TransferOutcome {
            file_size: compress_totals.bytes_in,
            was_compressed: true,
            used_delta: false,
            compressed_bytes: compress_totals.bytes_out,
            uncompressed_bytes: compress_totals.bytes_in,
        })
    }

    fn base_progress(&self, request: &TransferRequest) -> FileTransferProgress {
        FileTransferProgress {
            operation_id: request.operation_id,
            file_name: request
                .relative
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            source_path: request.source.clone(),
            destination_path: request.destination.clone(),
            file_size: request.file_size,
            bytes_transferred: 0,
            compressed_bytes_transferred: 0,
            is_compressed: false,
            compression_ratio: 1.0,
            current_speed_bytes_per_second: 0,
            average_speed_bytes_per_second: 0,
            retry_attempt: 0,
            max_retry_attempts: self.retry.max_attempts,
            is_retrying: false,
            last_error: None,
        }
    }

    fn emit_running(
        &self,
        request: &TransferRequest,
        bytes: u64,
        speed: u64,
        is_compressed: bool,
        compressed_bytes: u64,
    ) {
        self.tracker.record_file_progress(
            request.operation_id,
            &request.relative.to_string_lossy(),
            speed,
        );
        let average = self
            .tracker
            .snapshot(request.operation_id)
            .map(|s| s.average_speed_bps)
            .unwrap_or(0);

        let mut progress = self.base_progress(request);
        progress.bytes_transferred = bytes;
        progress.is_compressed = is_compressed;
        progress.compressed_bytes_transferred = compressed_bytes;
        progress.compression_ratio = if compressed_bytes > 0 {
            bytes as f64 / compressed_bytes as f64
        } else {
            1.0
        };
        progress.current_speed_bytes_per_second = speed;
        progress.average_speed_bytes_per_second = average;
        (self.sink)(progress);
    }

    /// Final per-file event: always delivered, bytes pinned to the total.
    fn emit_terminal(&self, request: &TransferRequest, outcome: &TransferOutcome) {
        let mut progress = self.base_progress(request);
        progress.file_size = outcome.file_size;
        progress.bytes_transferred = outcome.file_size;
        progress.is_compressed = outcome.was_compressed;
        progress.compressed_bytes_transferred = outcome.compressed_bytes;
        progress.compression_ratio = if outcome.compressed_bytes > 0 {
            outcome.uncompressed_bytes as f64 / outcome.compressed_bytes as f64
        } else {
            1.0
        };
        (self.sink)(progress);
    }

    fn emit_retry(&self, request: &TransferRequest, attempt: u32, error: &EngineError) {
        let mut progress = self.base_progress(request);
        progress.retry_attempt = attempt;
        progress.is_retrying = true;
        progress.last_error = Some(error.to_string());
        (self.sink)(progress);
    }
}

fn temp_compressed_path(destination: &std::path::Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    name.push('.');
    name.push_str(COMPRESSED_TEMP_SUFFIX);
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResumeStore;
    use crate::transfer::null_sink;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn operator_with_sink(sink: ProgressSink) -> FileOperator {
        FileOperator::new(RetryConfig::default(), Arc::new(ProgressTracker::new()), sink)
    }

    fn request(dir: &TempDir, rel: &str, size: u64) -> TransferRequest {
        TransferRequest {
            operation_id: Uuid::new_v4(),
            source: dir.path().join("src").join(rel),
            destination: dir.path().join("dst").join(rel),
            relative: PathBuf::from(rel),
            file_size: size,
        }
    }

    fn flags() -> TransferFlags {
        TransferFlags {
            allow_compression: false,
            allow_delta: true,
            buffer_size_kib: 64,
        }
    }

    fn test_log(dir: &TempDir) -> OperationLog {
        ResumeStore::new(dir.path())
            .unwrap()
            .open_log(Uuid::new_v4())
            .unwrap()
    }

    fn write_source(req: &TransferRequest, content: &[u8]) {
        fs::create_dir_all(req.source.parent().unwrap()).unwrap();
        fs::write(&req.source, content).unwrap();
    }

    #[tokio::test]
    async fn test_direct_copy_byte_identical() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 255) as u8).collect();
        let req = request(&dir, "sub/file.bin", content.len() as u64);
        write_source(&req, &content);

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);
        let cancel = CancellationToken::new();

        let outcome = operator.transfer(&req, &flags(), &cancel, &log).await?;

        assert_eq!(outcome.file_size, content.len() as u64);
        assert!(!outcome.was_compressed);
        assert!(!outcome.used_delta);
        assert_eq!(fs::read(&req.destination).unwrap(), content);

        Ok(())
    }

    #[tokio::test]
    async fn test_mtime_copied_to_destination() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "f.txt", 4);
        write_source(&req, b"data");
        filetime::set_file_mtime(
            &req.source,
            filetime::FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, 4, 1);
        let log = test_log(&dir);

        operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await?;

        let src_stamp = crate::fs::metadata::FileStamp::from_path(&req.source).unwrap();
        let dst_stamp = crate::fs::metadata::FileStamp::from_path(&req.destination).unwrap();
        assert!(crate::fs::metadata::mtime_eq(
            src_stamp.modified,
            dst_stamp.modified
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_compressed_path_destination_uncompressed() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = b"log line: everything is fine\n".repeat(20_000);
        let req = request(&dir, "server.log", content.len() as u64);
        write_source(&req, &content);

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);

        let with_compression = TransferFlags {
            allow_compression: true,
            ..flags()
        };
        let outcome = operator
            .transfer(&req, &with_compression, &CancellationToken::new(), &log)
            .await?;

        assert!(outcome.was_compressed);
        assert!(outcome.compressed_bytes > 0);
        assert!(outcome.compressed_bytes < outcome.uncompressed_bytes);
        // Destination holds the original bytes, not the compressed stream
        assert_eq!(fs::read(&req.destination).unwrap(), content);

        // The .tmp.zst intermediate is gone
        let names: Vec<String> = fs::read_dir(req.destination.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["server.log".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_compression_gate_skips_precompressed() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content = vec![0x11u8; 50_000];
        let req = request(&dir, "photo.jpg", content.len() as u64);
        write_source(&req, &content);

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);

        let with_compression = TransferFlags {
            allow_compression: true,
            ..flags()
        };
        let outcome = operator
            .transfer(&req, &with_compression, &CancellationToken::new(), &log)
            .await?;

        // Strategy allows compression, but a .jpg never takes that path
        assert!(!outcome.was_compressed);
        assert_eq!(fs::read(&req.destination).unwrap(), content);

        Ok(())
    }

    #[tokio::test]
    async fn test_partial_destination_takes_delta_path() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
        let req = request(&dir, "big.bin", content.len() as u64);
        write_source(&req, &content);

        // Simulate an interrupted earlier copy: a shorter prefix at the
        // destination
        fs::create_dir_all(req.destination.parent().unwrap()).unwrap();
        fs::write(&req.destination, &content[..150_000]).unwrap();

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);

        let outcome = operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await?;

        assert!(outcome.used_delta);
        assert_eq!(fs::read(&req.destination).unwrap(), content);

        Ok(())
    }

    #[tokio::test]
    async fn test_progress_events_monotonic_with_final_total() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content = vec![7u8; 900_000];
        let req = request(&dir, "file.bin", content.len() as u64);
        write_source(&req, &content);

        let events: Arc<Mutex<Vec<FileTransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |p| {
            events_clone.lock().unwrap().push(p);
        });

        let operator = operator_with_sink(sink);
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);

        operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await?;

        let events = events.lock().unwrap();
        assert!(!events.is_empty());

        let mut last = 0u64;
        for event in events.iter() {
            assert!(event.bytes_transferred >= last);
            last = event.bytes_transferred;
        }

        // Final event pins bytes to the file size
        let terminal = events.last().unwrap();
        assert_eq!(terminal.bytes_transferred, content.len() as u64);
        assert!(!terminal.is_retrying);

        Ok(())
    }

    #[tokio::test]
    async fn test_zero_byte_file() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "empty.txt", 0);
        write_source(&req, b"");

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, 0, 1);
        let log = test_log(&dir);

        let outcome = operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await?;

        assert_eq!(outcome.file_size, 0);
        assert_eq!(fs::read(&req.destination).unwrap(), b"");

        Ok(())
    }

    #[tokio::test]
    async fn test_small_delta_ineligible_file_copies_direct() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let content = vec![5u8; 4096];
        let req = request(&dir, "small.bin", content.len() as u64);
        write_source(&req, &content);

        // Same-size destination with different bytes: too small for delta
        fs::create_dir_all(req.destination.parent().unwrap()).unwrap();
        fs::write(&req.destination, vec![6u8; 4096]).unwrap();

        let operator = operator_with_sink(null_sink());
        operator.tracker.register(req.operation_id, content.len() as u64, 1);
        let log = test_log(&dir);

        let outcome = operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await?;

        assert!(!outcome.used_delta);
        assert_eq!(fs::read(&req.destination).unwrap(), content);

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_retry_storm() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "ghost.bin", 10);
        // No source written

        let operator = operator_with_sink(null_sink());
        let log = test_log(&dir);

        let result = operator
            .transfer(&req, &flags(), &CancellationToken::new(), &log)
            .await;
        assert!(matches!(result, Err(EngineError::Io(_))));
    }
}
