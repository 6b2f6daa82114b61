//! Transfer strategy selection.
//!
//! A pure decision over the two storage profiles and the file-set profile.
//! The rule ladder is ordered: remote links dominate, spinning destinations
//! force sequential, then the file-set shape picks the pool size.

use crate::profile::fileset::FileSetProfile;
use crate::profile::storage::{StorageKind, StorageProfile};
use serde::{Deserialize, Serialize};

/// Pool shape for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    Sequential,
    ParallelConservative,
    ParallelModerate,
    ParallelAggressive,
}

impl TransferMode {
    pub fn concurrency(&self) -> usize {
        match self {
            TransferMode::Sequential => 1,
            TransferMode::ParallelConservative => 4,
            TransferMode::ParallelModerate => 8,
            TransferMode::ParallelAggressive => 16,
        }
    }

    pub fn buffer_size_kib(&self) -> usize {
        match self {
            TransferMode::Sequential => 1024,
            TransferMode::ParallelConservative => 512,
            TransferMode::ParallelModerate => 512,
            TransferMode::ParallelAggressive => 256,
        }
    }
}

/// Totals already known from analysis, saving the orchestrator a re-walk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreCalculatedTotals {
    pub total_files: u64,
    pub total_bytes: u64,
}

/// The chosen execution plan parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStrategy {
    pub mode: TransferMode,
    pub max_concurrent_files: usize,
    pub buffer_size_kib: usize,
    pub use_compression: bool,
    pub use_delta_sync: bool,
    pub reasoning: String,
    pub pre_calculated_totals: Option<PreCalculatedTotals>,
}

impl TransferStrategy {
    /// Strategy with a caller-forced mode (CLI `--strategy`).
    pub fn with_mode(mode: TransferMode, reasoning: impl Into<String>) -> Self {
        Self {
            mode,
            max_concurrent_files: mode.concurrency(),
            buffer_size_kib: mode.buffer_size_kib(),
            use_compression: false,
            use_delta_sync: true,
            reasoning: reasoning.into(),
            pre_calculated_totals: None,
        }
    }
}

/// Remote-side write throughput below which compression pays for itself.
const COMPRESSION_WRITE_MBPS: f64 = 100.0;

fn strategy(mode: TransferMode, reasoning: &str) -> TransferStrategy {
    TransferStrategy {
        mode,
        max_concurrent_files: mode.concurrency(),
        buffer_size_kib: mode.buffer_size_kib(),
        use_compression: false,
        use_delta_sync: true,
        reasoning: reasoning.to_string(),
        pre_calculated_totals: None,
    }
}

/// Compression pays off when a slow remote link is involved and the file
/// set actually contains compressible content.
fn compression_gate(
    source: &StorageProfile,
    destination: &StorageProfile,
    files: &FileSetProfile,
) -> bool {
    let remote_write_mbps = match (source.is_remote, destination.is_remote) {
        (true, true) => source.seq_write_mbps.min(destination.seq_write_mbps),
        (true, false) => source.seq_write_mbps,
        (false, true) => destination.seq_write_mbps,
        (false, false) => return false,
    };

    remote_write_mbps < COMPRESSION_WRITE_MBPS && files.compressible_files > 0
}

/// Select the strategy for this (source, destination, file set) triple.
///
/// Pure: identical profiles always yield the identical strategy, including
/// its reasoning string.
pub fn select_strategy(
    source: &StorageProfile,
    destination: &StorageProfile,
    files: &FileSetProfile,
) -> TransferStrategy {
    let mut selected = select_mode(source, destination, files);

    selected.use_compression = compression_gate(source, destination, files);
    selected.pre_calculated_totals = Some(PreCalculatedTotals {
        total_files: files.total_files,
        total_bytes: files.total_bytes,
    });

    selected
}

fn select_mode(
    source: &StorageProfile,
    destination: &StorageProfile,
    files: &FileSetProfile,
) -> TransferStrategy {
    let total = files.total_files;
    let both_parallel = source.supports_parallel_io && destination.supports_parallel_io;

    // Remote link with enough files to keep the pipe full
    if (source.is_remote || destination.is_remote) && total > 50 {
        if total > 500 {
            return strategy(
                TransferMode::ParallelAggressive,
                "remote endpoint, very large file set: high parallelism masks latency",
            );
        }
        if total > 200 {
            return strategy(
                TransferMode::ParallelModerate,
                "remote endpoint, large file set: moderate parallelism masks latency",
            );
        }
        return strategy(
            TransferMode::ParallelConservative,
            "remote endpoint: conservative parallelism masks latency",
        );
    }

    if destination.kind == StorageKind::LocalHdd {
        return strategy(
            TransferMode::Sequential,
            "spinning destination: sequential writes avoid seek penalties",
        );
    }

    // Many small files: parallelism pays only when both ends can take it
    if total > 100 && files.tiny_and_small_fraction() > 0.7 {
        if both_parallel {
            return strategy(
                TransferMode::ParallelAggressive,
                "many small files on parallel-capable endpoints",
            );
        }
        return strategy(
            TransferMode::Sequential,
            "many small files but an endpoint serialises I/O",
        );
    }

    if source.kind == StorageKind::LocalSsd && destination.kind == StorageKind::LocalSsd {
        if total > 20 {
            return strategy(
                TransferMode::ParallelModerate,
                "SSD to SSD with a moderate file count",
            );
        }
        return strategy(
            TransferMode::Sequential,
            "SSD to SSD, few large files: sequential is fastest",
        );
    }

    if files.huge_files > total / 2 {
        return strategy(
            TransferMode::Sequential,
            "mostly huge files: large files already saturate bandwidth",
        );
    }

    if source.kind == StorageKind::ExternalUsb2 || destination.kind == StorageKind::ExternalUsb2 {
        return strategy(
            TransferMode::Sequential,
            "USB2 endpoint: sequential for bus compatibility",
        );
    }

    if total > 10 && both_parallel {
        return strategy(
            TransferMode::ParallelConservative,
            "parallel-capable endpoints with a modest file set",
        );
    }

    strategy(TransferMode::Sequential, "default: sequential transfer")
}
