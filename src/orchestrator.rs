//! Operation orchestration.
//!
//! Owns the lifecycle of a `CopyOperation`: strategy selection, planning,
//! execution under a bounded adaptive pool, the per-type post phase, and
//! persistence at every status transition. Status changes are written to
//! the resume store before they are announced through progress.

use crate::config::Config;
use crate::fs::walker::{collect_directories, WalkOptions};
use crate::operation::{CopyOperation, OperationStatus, OperationType};
use crate::planner::{self, Plan, PlannedCopy, SyncOperationSummary};
use crate::profile::fileset::{analyse_file_set, FileSetProfile};
use crate::profile::storage::{StorageProfile, StorageProfiler};
use crate::store::{OperationLog, ResumeStore, CHECKPOINT_INTERVAL_FILES};
use crate::strategy::{select_strategy, TransferStrategy};
use crate::transfer::monitor::PerformanceMonitor;
use crate::transfer::operator::{FileOperator, TransferFlags, TransferRequest};
use crate::transfer::progress::ProgressTracker;
use crate::transfer::{FileTransferProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Performance sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Minimum spacing between adjustment checks.
const ADJUST_INTERVAL: Duration = Duration::from_secs(5);

/// Lower pool capacity bound; the upper bound comes from configuration.
const MIN_CONCURRENCY: usize = 1;

/// The engine: composition root for all shared transfer services.
pub struct Engine {
    config: Config,
    store: Arc<ResumeStore>,
    tracker: Arc<ProgressTracker>,
    monitor: Arc<PerformanceMonitor>,
    profiler: StorageProfiler,
    /// Cancellation handles for operations currently executing
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ResumeStore::new(&config.engine.state_dir)?);
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        Ok(Self {
            config,
            store,
            tracker: Arc::new(ProgressTracker::new()),
            monitor,
            profiler: StorageProfiler::new(),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Operation-level concurrency ceiling: the configured engine cap,
    /// bounded by the monitor's growth cap.
    fn concurrency_ceiling(&self) -> usize {
        self.config
            .engine
            .max_concurrent_files
            .clamp(MIN_CONCURRENCY, self.config.performance.max_concurrency)
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            follow_links: false,
            max_depth: None,
            exclude_patterns: self.config.engine.exclude_patterns.clone(),
        }
    }

    /// Profile both endpoints and the file set, then pick a strategy.
    pub async fn analyse_and_select_strategy(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<(
        StorageProfile,
        StorageProfile,
        FileSetProfile,
        TransferStrategy,
    )> {
        if !source.exists() {
            return Err(EngineError::SourceMissing(source.to_path_buf()));
        }

        let source_profile = self.profiler.profile(source).await?;
        let destination_profile = self.profiler.profile(destination).await?;
        let file_set = analyse_file_set(source, &self.walk_options()).await?;

        let mut strategy = select_strategy(&source_profile, &destination_profile, &file_set);
        self.apply_config_overrides(&mut strategy);

        info!(
            mode = ?strategy.mode,
            concurrency = strategy.max_concurrent_files,
            compression = strategy.use_compression,
            "selected strategy: {}",
            strategy.reasoning
        );

        Ok((source_profile, destination_profile, file_set, strategy))
    }

    /// Dry-run a sync-family operation.
    pub async fn analyse_sync(
        &self,
        source: &Path,
        destination: &Path,
        operation_type: OperationType,
    ) -> Result<SyncOperationSummary> {
        planner::analyse_sync(source, destination, operation_type, &self.walk_options()).await
    }

    /// Configuration gates beat the strategy's enthusiasm.
    fn apply_config_overrides(&self, strategy: &mut TransferStrategy) {
        if !self.config.sync.compression {
            strategy.use_compression = false;
        }
        if !self.config.sync.delta_sync {
            strategy.use_delta_sync = false;
        }
        if let Some(buffer_kib) = self.config.sync.buffer_size_kib {
            strategy.buffer_size_kib = buffer_kib;
        }
        strategy.max_concurrent_files = strategy
            .max_concurrent_files
            .clamp(MIN_CONCURRENCY, self.concurrency_ceiling());
    }

    /// Start a new operation and run it to a terminal or paused state.
    pub async fn start_operation(
        &self,
        source: &Path,
        destination: &Path,
        operation_type: OperationType,
        sink: ProgressSink,
        cancel: CancellationToken,
        strategy: Option<TransferStrategy>,
    ) -> Result<CopyOperation> {
        if !source.exists() {
            return Err(EngineError::SourceMissing(source.to_path_buf()));
        }

        let strategy = match strategy {
            Some(mut s) => {
                self.apply_config_overrides(&mut s);
                s
            }
            None => {
                let (_, _, _, s) = self
                    .analyse_and_select_strategy(source, destination)
                    .await?;
                s
            }
        };

        let operation = CopyOperation::new(
            source.to_path_buf(),
            destination.to_path_buf(),
            operation_type,
        );
        let id = operation.id;
        self.store.save(&operation)?;

        let log = Arc::new(self.store.open_log(id)?);
        log.info(&format!(
            "operation {} created: {} -> {} ({})",
            id,
            source.display(),
            destination.display(),
            operation_type.as_str()
        ));
        log.info(&format!(
            "strategy: {:?} x{}, buffer {} KiB, compression {}, delta {} ({})",
            strategy.mode,
            strategy.max_concurrent_files,
            strategy.buffer_size_kib,
            strategy.use_compression,
            strategy.use_delta_sync,
            strategy.reasoning
        ));

        self.run_operation(operation, strategy, sink, cancel, log)
            .await
    }

    /// Resume a persisted operation from its completed-file records.
    pub async fn resume_operation(
        &self,
        id: Uuid,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<CopyOperation> {
        let operation = self
            .store
            .load(id)?
            .ok_or(EngineError::OperationNotFound(id))?;

        if !operation.status.is_resumable() || !operation.can_resume {
            return Err(EngineError::OperationFatal(format!(
                "operation {id} is not resumable"
            )));
        }
        if !operation.source_path.exists() {
            return Err(EngineError::SourceMissing(operation.source_path.clone()));
        }

        let (_, _, _, strategy) = self
            .analyse_and_select_strategy(&operation.source_path, &operation.destination_path)
            .await?;

        let log = Arc::new(self.store.open_log(id)?);
        log.info(&format!(
            "resuming operation {} with {} completed files on record",
            id,
            operation.completed_files.len()
        ));

        self.run_operation(operation, strategy, sink, cancel, log)
            .await
    }

    /// Request cooperative cancellation of a running operation.
    pub fn cancel_operation(&self, id: Uuid) -> Result<()> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let token = active
            .get(&id)
            .ok_or(EngineError::OperationNotFound(id))?;
        token.cancel();
        Ok(())
    }

    /// Cancel (if running) and remove all durable state for `id`.
    pub fn cancel_and_delete(&self, id: Uuid) -> Result<()> {
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(token) = active.get(&id) {
                token.cancel();
            }
        }
        self.store.delete(id)
    }

    pub fn list_resumable(&self) -> Result<Vec<CopyOperation>> {
        self.store.list_resumable()
    }

    pub fn can_resume(&self, id: Uuid) -> bool {
        self.store.can_resume(id)
    }

    pub fn get_operation(&self, id: Uuid) -> Result<Option<CopyOperation>> {
        self.store.load(id)
    }

    /// Plan, execute and finalise one operation.
    async fn run_operation(
        &self,
        mut operation: CopyOperation,
        strategy: TransferStrategy,
        sink: ProgressSink,
        cancel: CancellationToken,
        log: Arc<OperationLog>,
    ) -> Result<CopyOperation> {
        let id = operation.id;

        let plan = planner::build_plan(
            &operation.source_path,
            &operation.destination_path,
            operation.operation_type,
            &self.walk_options(),
        )
        .await?;

        operation.total_files = plan.total_files_to_copy();
        operation.total_bytes = plan.total_bytes_to_copy();
        operation.files_skipped = plan.identical_skipped.len() as u64;
        operation.status = OperationStatus::InProgress;
        operation.start_time = Utc::now();
        operation.end_time = None;
        self.store.save(&operation)?;

        self.tracker
            .register(id, operation.total_bytes, operation.total_files);
        if operation.bytes_transferred > 0 {
            self.tracker
                .set_progress(id, operation.bytes_transferred, operation.files_transferred);
        }
        self.monitor.register(id, strategy.max_concurrent_files);

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(id, cancel.clone());
        }

        log.info(&format!(
            "plan: {} files / {} bytes to copy, {} to delete, {} identical skipped",
            plan.total_files_to_copy(),
            plan.total_bytes_to_copy(),
            plan.total_files_to_delete(),
            plan.identical_skipped.len()
        ));
        for conflict in &plan.conflicts {
            log.file_event("WARN", "conflict: same mtime, different size", conflict);
        }

        let shared = Arc::new(Mutex::new(operation));
        let result = self
            .execute_plan(&shared, &plan, &strategy, &sink, &cancel, &log)
            .await;

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&id);
        }
        self.monitor.remove(id);

        let mut operation = Arc::try_unwrap(shared)
            .map_err(|_| EngineError::OperationFatal("operation state still shared".into()))?
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());

        match result {
            Ok(()) => {
                operation.status = OperationStatus::Completed;
                operation.end_time = Some(Utc::now());
                operation.current_file = None;
                if operation.files_failed > 0 {
                    log.warn(&format!(
                        "completed with {} failed files",
                        operation.files_failed
                    ));
                }
                log.info(&format!(
                    "operation completed: {} files, {} bytes in {}s",
                    operation.files_transferred,
                    operation.bytes_transferred,
                    operation.duration_secs()
                ));
            }
            Err(EngineError::Cancelled) => {
                // Cancelled state stays resumable; only cancel-and-delete
                // is terminal.
                operation.status = OperationStatus::Paused;
                operation.current_file = None;
                log.info("operation paused by cancellation; state kept for resume");
            }
            Err(error) => {
                operation.status = OperationStatus::Failed;
                operation.error_message = Some(error.to_string());
                operation.current_file = None;
                log.exception("operation failed", None, &error);
            }
        }

        self.store.save(&operation)?;
        self.tracker.remove(id);
        self.emit_operation_summary(&sink, &operation);

        match operation.status {
            OperationStatus::Failed => {
                warn!("operation {} failed: {:?}", id, operation.error_message)
            }
            status => info!("operation {} finished as {:?}", id, status),
        }

        Ok(operation)
    }

    async fn execute_plan(
        &self,
        operation: &Arc<Mutex<CopyOperation>>,
        plan: &Plan,
        strategy: &TransferStrategy,
        sink: &ProgressSink,
        cancel: &CancellationToken,
        log: &Arc<OperationLog>,
    ) -> Result<()> {
        let operator = Arc::new(FileOperator::new(
            self.config.retry.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(sink),
        ));
        let flags = TransferFlags {
            allow_compression: strategy.use_compression,
            allow_delta: strategy.use_delta_sync,
            buffer_size_kib: strategy.buffer_size_kib,
        };

        self.run_pool(
            operation,
            &plan.to_copy,
            strategy.max_concurrent_files,
            &operator,
            flags,
            cancel,
            log,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Post phase per operation type
        let operation_type = {
            let op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.operation_type
        };

        match operation_type {
            OperationType::Move => {
                let failed = {
                    let op = operation.lock().unwrap_or_else(|e| e.into_inner());
                    op.files_failed
                };
                if failed == 0 {
                    self.delete_move_sources(operation, plan, log).await?;
                } else {
                    log.warn("move left sources in place: not all files transferred");
                }
            }
            OperationType::Mirror => {
                self.delete_mirror_targets(operation, plan, log).await?;
            }
            OperationType::BiDirectionalSync => {
                // Reverse copies run as a second pool in the same shape
                self.run_pool(
                    operation,
                    &plan.to_copy_reverse,
                    strategy.max_concurrent_files,
                    &operator,
                    flags,
                    cancel,
                    log,
                )
                .await?;
            }
            _ => {}
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Checkpoint the final counters before the terminal transition
        self.checkpoint(operation)?;
        Ok(())
    }

    /// Run one copy list under a bounded pool with adaptive capacity, or
    /// inline when the strategy is sequential.
    #[allow(clippy::too_many_arguments)]
    async fn run_pool(
        &self,
        operation: &Arc<Mutex<CopyOperation>>,
        files: &[PlannedCopy],
        concurrency: usize,
        operator: &Arc<FileOperator>,
        flags: TransferFlags,
        cancel: &CancellationToken,
        log: &Arc<OperationLog>,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let id = {
            let op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.id
        };

        if concurrency <= 1 {
            for (index, file) in files.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                match self
                    .transfer_one(operation, file, operator, flags, cancel, log)
                    .await
                {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(error @ (EngineError::OperationFatal(_) | EngineError::Store(_))) => {
                        return Err(error)
                    }
                    // Per-file failure: counted, logged, the operation goes on
                    Err(_) => {}
                }
                if index % 8 == 7 {
                    tokio::task::yield_now().await;
                }
            }
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let granted = Arc::new(AtomicUsize::new(concurrency));
        let sampler_stop = CancellationToken::new();
        let sampler = self.spawn_sampler(
            id,
            Arc::clone(&semaphore),
            Arc::clone(&granted),
            self.concurrency_ceiling(),
            sampler_stop.clone(),
            Arc::clone(log),
        );

        let mut handles = Vec::with_capacity(files.len());
        for file in files.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let operation = Arc::clone(operation);
            let operator = Arc::clone(operator);
            let log = Arc::clone(log);
            let store = Arc::clone(&self.store);

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.map_err(|_| EngineError::Cancelled)?,
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                };

                if cancel.is_cancelled() {
                    drop(permit);
                    return Err(EngineError::Cancelled);
                }

                let result =
                    transfer_one_inner(&operation, &file, &operator, flags, &cancel, &log, &store)
                        .await;
                drop(permit);
                result
            });
            handles.push(handle);
        }

        let mut first_error: Option<EngineError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(EngineError::Cancelled)) => {
                    first_error.get_or_insert(EngineError::Cancelled);
                }
                Ok(Err(error)) => {
                    // Per-file failures were already counted; only
                    // operation-fatal errors travel up.
                    if matches!(
                        error,
                        EngineError::OperationFatal(_) | EngineError::Store(_)
                    ) {
                        first_error.get_or_insert(error);
                    }
                }
                Err(join_error) => {
                    first_error.get_or_insert(EngineError::OperationFatal(format!(
                        "transfer task panicked: {join_error}"
                    )));
                }
            }
        }

        sampler_stop.cancel();
        let _ = sampler.await;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Sequential-path transfer of one file.
    async fn transfer_one(
        &self,
        operation: &Arc<Mutex<CopyOperation>>,
        file: &PlannedCopy,
        operator: &Arc<FileOperator>,
        flags: TransferFlags,
        cancel: &CancellationToken,
        log: &Arc<OperationLog>,
    ) -> Result<()> {
        transfer_one_inner(operation, file, operator, flags, cancel, log, &self.store).await
    }

    /// Periodic performance sampling plus capacity adjustment. Capacity
    /// only grows mid-flight, never past the configured ceiling; a
    /// recommended shrink is recorded and takes effect as workers drain.
    fn spawn_sampler(
        &self,
        id: Uuid,
        semaphore: Arc<Semaphore>,
        granted: Arc<AtomicUsize>,
        ceiling: usize,
        stop: CancellationToken,
        log: Arc<OperationLog>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let monitor = Arc::clone(&self.monitor);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_bytes: Option<u64> = None;
            let mut last_adjust_check = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                let Some(snapshot) = tracker.snapshot(id) else {
                    continue;
                };

                let concurrency = granted.load(Ordering::Relaxed);
                if let Some(previous) = last_bytes {
                    let delta = snapshot.bytes_transferred.saturating_sub(previous);
                    let speed_mbps =
                        delta as f64 / SAMPLE_INTERVAL.as_secs_f64() / (1024.0 * 1024.0);
                    monitor.record_sample(id, speed_mbps, concurrency);
                }
                last_bytes = Some(snapshot.bytes_transferred);

                if last_adjust_check.elapsed() < ADJUST_INTERVAL {
                    continue;
                }
                last_adjust_check = tokio::time::Instant::now();

                let decision = monitor.should_adjust(id);
                if !decision.adjust {
                    continue;
                }

                let current = granted.load(Ordering::Relaxed);
                let target = decision.new_concurrency.clamp(MIN_CONCURRENCY, ceiling);
                if target == current {
                    continue;
                }
                if target > current {
                    semaphore.add_permits(target - current);
                    granted.store(target, Ordering::Relaxed);
                    log.info(&format!(
                        "concurrency raised {} -> {} ({})",
                        current, target, decision.reason
                    ));
                } else {
                    // Semaphores cannot take permits back; the lower target
                    // is recorded and applies as workers finish.
                    granted.store(target, Ordering::Relaxed);
                    log.info(&format!(
                        "concurrency target lowered {} -> {} ({})",
                        current, target, decision.reason
                    ));
                }
                monitor.record_adaptation(id, target);
            }
        })
    }

    async fn delete_move_sources(
        &self,
        operation: &Arc<Mutex<CopyOperation>>,
        plan: &Plan,
        log: &Arc<OperationLog>,
    ) -> Result<()> {
        let mut deleted = 0u64;
        for path in &plan.to_delete {
            match tokio::fs::remove_file(path).await {
                Ok(()) => deleted += 1,
                Err(e) => log.exception("failed to delete source file", Some(path), &e),
            }
        }

        // Remove emptied source directories, deepest first
        let source_root = {
            let op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.source_path.clone()
        };
        if let Ok(dirs) = collect_directories(&source_root) {
            for dir in dirs {
                let _ = std::fs::remove_dir(&dir);
            }
        }

        let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
        op.files_deleted += deleted;
        log.info(&format!("move post-phase deleted {deleted} source files"));
        Ok(())
    }

    async fn delete_mirror_targets(
        &self,
        operation: &Arc<Mutex<CopyOperation>>,
        plan: &Plan,
        log: &Arc<OperationLog>,
    ) -> Result<()> {
        let mut deleted = 0u64;
        for path in &plan.to_delete {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    deleted += 1;
                    log.file_event("INFO", "deleted destination-only file", path);
                }
                Err(e) => log.exception("failed to delete destination file", Some(path), &e),
            }
        }

        let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
        op.files_deleted += deleted;
        Ok(())
    }

    fn checkpoint(&self, operation: &Arc<Mutex<CopyOperation>>) -> Result<()> {
        let snapshot = {
            let op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.clone()
        };
        self.store.save(&snapshot)
    }

    /// Final per-operation event on the progress stream.
    fn emit_operation_summary(&self, sink: &ProgressSink, operation: &CopyOperation) {
        sink(FileTransferProgress {
            operation_id: operation.id,
            file_name: String::new(),
            source_path: operation.source_path.clone(),
            destination_path: operation.destination_path.clone(),
            file_size: operation.total_bytes,
            bytes_transferred: operation.bytes_transferred,
            compressed_bytes_transferred: operation.total_compressed_bytes,
            is_compressed: operation.files_compressed > 0,
            compression_ratio: if operation.total_compressed_bytes > 0 {
                operation.total_uncompressed_bytes as f64
                    / operation.total_compressed_bytes as f64
            } else {
                1.0
            },
            current_speed_bytes_per_second: 0,
            average_speed_bytes_per_second: 0,
            retry_attempt: 0,
            max_retry_attempts: self.config.retry.max_attempts,
            is_retrying: false,
            last_error: operation.error_message.clone(),
        });
    }
}

/// Convert a source mtime into the UTC stamp stored in completion records.
fn to_utc(time: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Transfer one planned file with resume skip-logic and counter updates.
/// Shared between the sequential path and pool workers.
#[allow(clippy::too_many_arguments)]
async fn transfer_one_inner(
    operation: &Arc<Mutex<CopyOperation>>,
    file: &PlannedCopy,
    operator: &Arc<FileOperator>,
    flags: TransferFlags,
    cancel: &CancellationToken,
    log: &Arc<OperationLog>,
    store: &Arc<ResumeStore>,
) -> Result<()> {
    let relative = file.relative.to_string_lossy().to_string();
    let id = {
        let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
        op.current_file = Some(relative.clone());
        op.id
    };

    // Resume skip-logic: trust the record only when source and destination
    // still look exactly as they did at completion time.
    let source_stamp = match crate::fs::metadata::FileStamp::from_path(&file.source) {
        Ok(stamp) => stamp,
        Err(_) => {
            let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.current_file = None;
            if !op.source_path.exists() {
                // The whole source tree is gone, not just this file
                return Err(EngineError::OperationFatal(format!(
                    "source path disappeared: {}",
                    op.source_path.display()
                )));
            }
            op.files_failed += 1;
            drop(op);
            log.file_event("ERROR", "source file vanished before transfer", &file.source);
            return Err(EngineError::SourceMissing(file.source.clone()));
        }
    };

    let skip = {
        let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
        match op.find_completed(&relative) {
            Some(record) => {
                let unchanged = record.file_size == source_stamp.size
                    && record.last_modified.timestamp() == to_utc(source_stamp.modified).timestamp()
                    && file
                        .destination
                        .metadata()
                        .map(|m| m.len() == record.file_size)
                        .unwrap_or(false);
                if unchanged {
                    true
                } else {
                    // Stale record: forget it and re-copy, deducting the
                    // previously counted totals.
                    let previous_size = record.file_size;
                    op.remove_completed(&relative);
                    op.files_transferred = op.files_transferred.saturating_sub(1);
                    op.bytes_transferred = op.bytes_transferred.saturating_sub(previous_size);
                    false
                }
            }
            None => false,
        }
    };

    if skip {
        log.file_event("INFO", "skipping file already completed", &file.source);
        let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
        op.current_file = None;
        return Ok(());
    }

    let request = TransferRequest {
        operation_id: id,
        source: file.source.clone(),
        destination: file.destination.clone(),
        relative: file.relative.clone(),
        file_size: file.size,
    };

    match operator.transfer(&request, &flags, cancel, log).await {
        Ok(outcome) => {
            let checkpoint_due = {
                let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
                op.files_transferred += 1;
                op.bytes_transferred += outcome.file_size;
                if outcome.was_compressed {
                    op.files_compressed += 1;
                    op.total_compressed_bytes += outcome.compressed_bytes;
                    op.total_uncompressed_bytes += outcome.uncompressed_bytes;
                }
                op.record_completed_file(
                    relative,
                    source_stamp.size,
                    to_utc(source_stamp.modified),
                );
                op.current_file = None;
                op.files_transferred % CHECKPOINT_INTERVAL_FILES == 0
            };

            if checkpoint_due {
                let snapshot = {
                    let op = operation.lock().unwrap_or_else(|e| e.into_inner());
                    op.clone()
                };
                if let Err(e) = store.save(&snapshot) {
                    log.exception("checkpoint failed", None, &e);
                }
            }
            Ok(())
        }
        Err(EngineError::Cancelled) => {
            let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.current_file = None;
            Err(EngineError::Cancelled)
        }
        Err(error) => {
            // A single failed file does not fail the operation
            log.exception("file transfer failed", Some(&file.source), &error);
            let mut op = operation.lock().unwrap_or_else(|e| e.into_inner());
            op.files_failed += 1;
            op.current_file = None;
            Err(error)
        }
    }
}
