//! Per-operation progress aggregation.
//!
//! Many workers update one operation's counters concurrently; presenters
//! and the performance sampler read them. Counters are atomics, the
//! current-file slot sits behind a mutex, and speed formulas live on the
//! snapshot so readers get a consistent view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The file a worker is currently transferring.
#[derive(Debug, Clone)]
struct CurrentFile {
    name: String,
    speed_bps: u64,
}

/// Shared progress state for one operation.
struct OperationProgress {
    start: Mutex<Instant>,
    total_bytes_expected: AtomicU64,
    total_files_expected: AtomicU64,
    bytes_transferred: AtomicU64,
    files_transferred: AtomicU64,
    current_file: Mutex<Option<CurrentFile>>,
}

impl OperationProgress {
    fn new(total_bytes: u64, total_files: u64) -> Self {
        Self {
            start: Mutex::new(Instant::now()),
            total_bytes_expected: AtomicU64::new(total_bytes),
            total_files_expected: AtomicU64::new(total_files),
            bytes_transferred: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            current_file: Mutex::new(None),
        }
    }
}

/// Read-side view of an operation's progress.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total_bytes_expected: u64,
    pub total_files_expected: u64,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub current_file: Option<String>,
    /// Speed reported by the worker on the current file
    pub current_speed_bps: u64,
    /// bytes transferred / wall time since (re)start
    pub average_speed_bps: u64,
    /// 0-100 across expected bytes
    pub overall_percent: f64,
    /// None when the average speed or expected total is unknown
    pub eta: Option<Duration>,
    pub elapsed: Duration,
}

/// Aggregates progress across all live operations.
#[derive(Default)]
pub struct ProgressTracker {
    operations: RwLock<HashMap<Uuid, Arc<OperationProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation with its expected totals.
    pub fn register(&self, id: Uuid, total_bytes: u64, total_files: u64) {
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.insert(id, Arc::new(OperationProgress::new(total_bytes, total_files)));
    }

    fn get(&self, id: Uuid) -> Option<Arc<OperationProgress>> {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        ops.get(&id).cloned()
    }

    /// Re-seed counters on resume. The start instant resets so average
    /// speed reflects the continuation, not the original run.
    pub fn set_progress(&self, id: Uuid, bytes: u64, files: u64) {
        if let Some(op) = self.get(id) {
            op.bytes_transferred.store(bytes, Ordering::Relaxed);
            op.files_transferred.store(files, Ordering::Relaxed);
            *op.start.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        }
    }

    /// Worker reports mid-file progress.
    pub fn record_file_progress(&self, id: Uuid, file_name: &str, speed_bps: u64) {
        if let Some(op) = self.get(id) {
            let mut current = op.current_file.lock().unwrap_or_else(|e| e.into_inner());
            *current = Some(CurrentFile {
                name: file_name.to_string(),
                speed_bps,
            });
        }
    }

    /// Worker finished a file: fold it into the aggregate and clear the
    /// current-file slot.
    pub fn add_completed_file(&self, id: Uuid, bytes: u64) {
        if let Some(op) = self.get(id) {
            op.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
            op.files_transferred.fetch_add(1, Ordering::Relaxed);
            let mut current = op.current_file.lock().unwrap_or_else(|e| e.into_inner());
            *current = None;
        }
    }

    pub fn snapshot(&self, id: Uuid) -> Option<ProgressSnapshot> {
        let op = self.get(id)?;

        let elapsed = op
            .start
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        let bytes = op.bytes_transferred.load(Ordering::Relaxed);
        let files = op.files_transferred.load(Ordering::Relaxed);
        let total_bytes = op.total_bytes_expected.load(Ordering::Relaxed);
        let total_files = op.total_files_expected.load(Ordering::Relaxed);

        let (current_file, current_speed_bps) = {
            let current = op.current_file.lock().unwrap_or_else(|e| e.into_inner());
            match current.as_ref() {
                Some(c) => (Some(c.name.clone()), c.speed_bps),
                None => (None, 0),
            }
        };

        let average_speed_bps = if elapsed.as_secs_f64() > 0.0 {
            (bytes as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        let overall_percent = if total_bytes > 0 {
            ((bytes as f64 / total_bytes as f64) * 100.0).min(100.0)
        } else {
            0.0
        };

        let eta = if total_bytes == 0 || average_speed_bps == 0 {
            None
        } else if bytes >= total_bytes {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_secs(
                (total_bytes - bytes) / average_speed_bps,
            ))
        };

        Some(ProgressSnapshot {
            total_bytes_expected: total_bytes,
            total_files_expected: total_files,
            bytes_transferred: bytes,
            files_transferred: files,
            current_file,
            current_speed_bps,
            average_speed_bps,
            overall_percent,
            eta,
            elapsed,
        })
    }

    pub fn remove(&self, id: Uuid) {
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_operation_yields_none() {
        let tracker = ProgressTracker::new();
        assert!(tracker.snapshot(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_aggregation_and_percent() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 1000, 4);

        tracker.add_completed_file(id, 250);
        tracker.add_completed_file(id, 250);

        let snap = tracker.snapshot(id).unwrap();
        assert_eq!(snap.bytes_transferred, 500);
        assert_eq!(snap.files_transferred, 2);
        assert!((snap.overall_percent - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_current_file_cleared_on_completion() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 100, 1);

        tracker.record_file_progress(id, "big.bin", 1024);
        let snap = tracker.snapshot(id).unwrap();
        assert_eq!(snap.current_file.as_deref(), Some("big.bin"));
        assert_eq!(snap.current_speed_bps, 1024);

        tracker.add_completed_file(id, 100);
        let snap = tracker.snapshot(id).unwrap();
        assert!(snap.current_file.is_none());
        assert_eq!(snap.current_speed_bps, 0);
    }

    #[test]
    fn test_eta_rules() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();

        // Unknown total: no ETA
        tracker.register(id, 0, 0);
        tracker.add_completed_file(id, 10);
        assert!(tracker.snapshot(id).unwrap().eta.is_none());
        tracker.remove(id);

        // Complete: zero ETA
        tracker.register(id, 100, 1);
        tracker.add_completed_file(id, 100);
        std::thread::sleep(Duration::from_millis(10));
        let snap = tracker.snapshot(id).unwrap();
        assert_eq!(snap.eta, Some(Duration::ZERO));
    }

    #[test]
    fn test_resume_reseeds_counters() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 1000, 10);

        tracker.set_progress(id, 600, 6);
        let snap = tracker.snapshot(id).unwrap();
        assert_eq!(snap.bytes_transferred, 600);
        assert_eq!(snap.files_transferred, 6);
        // Clock restarted: elapsed is tiny again
        assert!(snap.elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let tracker = Arc::new(ProgressTracker::new());
        let id = Uuid::new_v4();
        tracker.register(id, 8 * 1000 * 100, 8 * 1000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.add_completed_file(id, 100);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = tracker.snapshot(id).unwrap();
        assert_eq!(snap.files_transferred, 8 * 1000);
        assert_eq!(snap.bytes_transferred, 8 * 1000 * 100);
    }

    #[test]
    fn test_monotonic_aggregate() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 10_000, 100);

        let mut last_bytes = 0;
        for _ in 0..50 {
            tracker.add_completed_file(id, 100);
            let snap = tracker.snapshot(id).unwrap();
            assert!(snap.bytes_transferred >= last_bytes);
            last_bytes = snap.bytes_transferred;
        }
    }
}
