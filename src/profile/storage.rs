//! Endpoint storage profiling.
//!
//! Combines OS-level medium detection with a small on-disk micro-benchmark
//! to produce the `StorageProfile` that drives strategy selection. Paths
//! that do not exist yet are profiled through their nearest existing
//! ancestor so destination endpoints can be measured before the first copy.

use crate::profile::platform::{platform_probe, PlatformProbe};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Benchmark payload: 10 MiB written and read back in 1 MiB chunks.
const BENCH_TOTAL_BYTES: usize = 10 * 1024 * 1024;
const BENCH_CHUNK_BYTES: usize = 1024 * 1024;
const BENCH_LATENCY_READ_BYTES: usize = 4 * 1024;

/// Fallback throughput when the benchmark cannot run.
const DEFAULT_MBPS: f64 = 50.0;

/// Measured write speed below which an external-volume mount is assumed to
/// be a misdetected network share.
const SLOW_EXTERNAL_WRITE_MBPS: f64 = 50.0;

/// Prefix for benchmark scratch files.
const BENCH_FILE_PREFIX: &str = ".kopiorapido_bench_";

/// Classified storage medium of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    LocalSsd,
    LocalHdd,
    NetworkShare,
    ExternalUsb2,
    ExternalUsb3,
    ExternalThunderbolt,
    CloudMount,
    Unknown,
}

impl StorageKind {
    /// Whether concurrent file streams help on this medium. Spinning media
    /// and USB2 serialise anyway; everything fast benefits.
    pub fn supports_parallel_io(&self) -> bool {
        match self {
            StorageKind::LocalSsd
            | StorageKind::ExternalUsb3
            | StorageKind::ExternalThunderbolt
            | StorageKind::NetworkShare
            | StorageKind::CloudMount => true,
            StorageKind::LocalHdd | StorageKind::ExternalUsb2 | StorageKind::Unknown => false,
        }
    }
}

/// Measured and classified description of a storage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProfile {
    pub path: PathBuf,
    pub kind: StorageKind,
    pub fs_type: Option<String>,
    pub seq_read_mbps: f64,
    pub seq_write_mbps: f64,
    pub random_read_mbps: f64,
    pub latency_ms: f64,
    pub supports_parallel_io: bool,
    pub is_remote: bool,
    pub profiled_at: DateTime<Utc>,
}

/// Raw micro-benchmark output.
#[derive(Debug, Clone, Copy)]
struct BenchResult {
    write_mbps: f64,
    read_mbps: f64,
    random_read_mbps: f64,
    latency_ms: f64,
}

/// Removes the benchmark scratch file on every exit path.
struct ScratchGuard(PathBuf);

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Profiles storage endpoints via the platform probe plus a micro-benchmark.
pub struct StorageProfiler {
    probe: Arc<dyn PlatformProbe>,
}

impl Default for StorageProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageProfiler {
    pub fn new() -> Self {
        Self {
            probe: Arc::from(platform_probe()),
        }
    }

    /// Profile the endpoint at `path`.
    pub async fn profile(&self, path: &Path) -> Result<StorageProfile> {
        let probe = Arc::clone(&self.probe);
        let path = path.to_path_buf();

        let profile = tokio::task::spawn_blocking(move || profile_blocking(&probe, &path))
            .await
            .map_err(|e| {
                crate::utils::errors::EngineError::OperationFatal(format!(
                    "profiling task failed: {e}"
                ))
            })?;

        Ok(profile)
    }
}

fn profile_blocking(probe: &Arc<dyn PlatformProbe>, path: &Path) -> StorageProfile {
    let bench_dir = nearest_existing_dir(path);

    let is_remote = probe.is_network(path);
    let fs_type = probe.fs_type(path);
    let mut kind = if is_remote {
        StorageKind::NetworkShare
    } else {
        probe.detect_kind(path)
    };

    let bench = match run_micro_benchmark(&bench_dir) {
        Ok(bench) => bench,
        Err(e) => {
            warn!("storage benchmark failed for {}: {}", bench_dir.display(), e);
            BenchResult {
                write_mbps: DEFAULT_MBPS,
                read_mbps: DEFAULT_MBPS,
                random_read_mbps: DEFAULT_MBPS,
                latency_ms: 1.0,
            }
        }
    };

    let under_external_root = path.starts_with(probe.external_volumes_root());
    kind = apply_heuristics(kind, bench.write_mbps, bench.read_mbps, under_external_root);

    let is_remote = is_remote || (kind == StorageKind::NetworkShare && under_external_root);

    debug!(
        path = %path.display(),
        ?kind,
        write_mbps = bench.write_mbps,
        read_mbps = bench.read_mbps,
        latency_ms = bench.latency_ms,
        "profiled endpoint"
    );

    StorageProfile {
        path: path.to_path_buf(),
        kind,
        fs_type,
        seq_read_mbps: bench.read_mbps,
        seq_write_mbps: bench.write_mbps,
        random_read_mbps: bench.random_read_mbps,
        latency_ms: bench.latency_ms,
        supports_parallel_io: kind.supports_parallel_io(),
        is_remote,
        profiled_at: Utc::now(),
    }
}

/// Kind adjustments after measurement.
///
/// A slow external-volume mount that did not classify as a share is treated
/// as one (network mounts under the external root often masquerade as local
/// disks). An `Unknown` medium is classified from measured throughput.
fn apply_heuristics(
    kind: StorageKind,
    write_mbps: f64,
    read_mbps: f64,
    under_external_root: bool,
) -> StorageKind {
    if under_external_root
        && write_mbps < SLOW_EXTERNAL_WRITE_MBPS
        && kind != StorageKind::NetworkShare
    {
        return StorageKind::NetworkShare;
    }

    if kind == StorageKind::Unknown {
        if write_mbps >= 150.0 && read_mbps >= 150.0 {
            return StorageKind::LocalSsd;
        }
        if write_mbps > 0.0 && write_mbps <= 60.0 {
            return StorageKind::LocalHdd;
        }
    }

    kind
}

/// Closest ancestor of `path` that exists as a directory.
fn nearest_existing_dir(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();

    loop {
        if current.is_dir() {
            return current;
        }
        if current.is_file() {
            if let Some(parent) = current.parent() {
                return parent.to_path_buf();
            }
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
            _ => return PathBuf::from("."),
        }
    }
}

/// Write, read back and seek a scratch file to measure the medium.
fn run_micro_benchmark(dir: &Path) -> std::io::Result<BenchResult> {
    let scratch = dir.join(format!("{}{}", BENCH_FILE_PREFIX, uuid::Uuid::new_v4()));
    let _guard = ScratchGuard(scratch.clone());

    let mut chunk = vec![0u8; BENCH_CHUNK_BYTES];
    rand::rng().fill_bytes(&mut chunk);
    let chunks = BENCH_TOTAL_BYTES / BENCH_CHUNK_BYTES;

    // Sequential write with explicit flush
    let write_started = Instant::now();
    {
        let mut file = std::fs::File::create(&scratch)?;
        for _ in 0..chunks {
            file.write_all(&chunk)?;
            file.flush()?;
        }
        file.sync_all()?;
    }
    let write_secs = write_started.elapsed().as_secs_f64();

    // Sequential read-back
    let read_started = Instant::now();
    {
        let mut file = std::fs::File::open(&scratch)?;
        let mut buf = vec![0u8; BENCH_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
        }
    }
    let read_secs = read_started.elapsed().as_secs_f64();

    // One seek + small read approximates access latency
    let latency_started = Instant::now();
    {
        let mut file = std::fs::File::open(&scratch)?;
        file.seek(SeekFrom::Start((BENCH_TOTAL_BYTES / 2) as u64))?;
        let mut buf = vec![0u8; BENCH_LATENCY_READ_BYTES];
        file.read_exact(&mut buf)?;
    }
    let latency_secs = latency_started.elapsed().as_secs_f64();

    let total_mib = (BENCH_TOTAL_BYTES / (1024 * 1024)) as f64;
    let latency_ms = latency_secs * 1000.0;
    let random_read_mbps = if latency_secs > 0.0 {
        (BENCH_LATENCY_READ_BYTES as f64 / (1024.0 * 1024.0)) / latency_secs
    } else {
        DEFAULT_MBPS
    };

    Ok(BenchResult {
        write_mbps: if write_secs > 0.0 {
            total_mib / write_secs
        } else {
            DEFAULT_MBPS
        },
        read_mbps: if read_secs > 0.0 {
            total_mib / read_secs
        } else {
            DEFAULT_MBPS
        },
        random_read_mbps,
        latency_ms,
    })
}
