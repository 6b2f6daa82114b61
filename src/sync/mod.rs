//! Delta synchronisation against an existing destination file.
//!
//! When a destination already holds an older or partial copy, only the
//! changed regions are worth writing. The pipeline runs in three phases
//! with on-disk intermediates: signature of the destination, delta of the
//! source against it, and application over a temp copy that is atomically
//! renamed into place. Any phase failure falls back to a direct copy.

pub mod apply;
pub mod delta;
pub mod signature;

use crate::fs::metadata::{mtime_eq, FileStamp};
use crate::utils::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sources below this size are cheaper to copy whole than to diff.
const DELTA_MIN_SOURCE_BYTES: u64 = 10 * 1024 * 1024;

/// Outcome of a delta-sync pass over one file.
#[derive(Debug, Clone, Copy)]
pub struct DeltaOutcome {
    /// Final size of the destination file
    pub file_size: u64,
    /// Size of the delta that was applied (0 on fallback)
    pub delta_bytes: u64,
    /// Whether the pipeline fell back to a direct copy
    pub used_fallback: bool,
}

/// Decide whether delta sync applies to this (source, destination) pair.
///
/// Returns `(use_delta, is_partial)`. A destination shorter than the source
/// is treated as a partially-written file worth resuming; an existing
/// destination differing in size or mtime is refreshed via delta when the
/// source is large enough to make diffing worthwhile.
pub fn should_use_delta(source: &Path, destination: &Path) -> std::io::Result<(bool, bool)> {
    if !destination.exists() {
        return Ok((false, false));
    }

    let src = FileStamp::from_path(source)?;
    let dst = FileStamp::from_path(destination)?;

    if dst.size < src.size {
        return Ok((true, true));
    }

    if src.size >= DELTA_MIN_SOURCE_BYTES
        && (src.size != dst.size || !mtime_eq(src.modified, dst.modified))
    {
        return Ok((true, false));
    }

    Ok((false, false))
}

/// Removes a set of intermediate files on every exit path.
struct TempCleanup(Vec<PathBuf>);

impl Drop for TempCleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Run the three-phase delta pipeline, falling back to a direct copy if any
/// phase fails. Returns the outcome including whether fallback was taken.
pub async fn sync_file(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<DeltaOutcome> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || sync_file_blocking(&source, &destination, &cancel))
        .await
        .map_err(|e| EngineError::OperationFatal(format!("delta task failed: {e}")))?
}

fn sync_file_blocking(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<DeltaOutcome> {
    match run_delta_pipeline(source, destination, cancel) {
        Ok(outcome) => Ok(outcome),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(error) => {
            warn!(
                source = %source.display(),
                destination = %destination.display(),
                "delta sync failed, falling back to direct copy: {}",
                error
            );

            let file_size = std::fs::copy(source, destination)?;
            Ok(DeltaOutcome {
                file_size,
                delta_bytes: 0,
                used_fallback: true,
            })
        }
    }
}

fn run_delta_pipeline(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<DeltaOutcome> {
    let sig_path = temp_sibling(destination, "sig");
    let delta_path = temp_sibling(destination, "delta");
    let tmp_path = temp_sibling(destination, "tmp");
    let _cleanup = TempCleanup(vec![sig_path.clone(), delta_path.clone(), tmp_path.clone()]);

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Phase 1: signature of what the destination currently holds
    let baseline = std::fs::read(destination)?;
    let sig = signature::generate_signature_from_bytes(&baseline, None);
    std::fs::write(&sig_path, signature::serialize_signature(&sig))?;

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Phase 2: delta of the new source against that signature
    let new_data = std::fs::read(source)?;
    let delta_bytes = delta::compute_delta(&sig, &new_data)?;
    std::fs::write(&delta_path, &delta_bytes)?;

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Phase 3: apply over a temp copy, then rename into place. The rename
    // replaces the destination atomically; there is no window with the
    // destination missing.
    let reconstructed = apply::apply_delta(&baseline, &delta_bytes)?;
    std::fs::write(&tmp_path, &reconstructed)?;
    std::fs::rename(&tmp_path, destination)?;

    debug!(
        destination = %destination.display(),
        delta_bytes = delta_bytes.len(),
        file_size = reconstructed.len(),
        "delta applied"
    );

    Ok(DeltaOutcome {
        file_size: reconstructed.len() as u64,
        delta_bytes: delta_bytes.len() as u64,
        used_fallback: false,
    })
}

fn temp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    name.push('.');
    name.push_str(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_should_use_delta_missing_destination() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        fs::write(&src, b"data")?;

        let (use_delta, _) = should_use_delta(&src, &dir.path().join("absent.bin"))?;
        assert!(!use_delta);
        Ok(())
    }

    #[test]
    fn test_should_use_delta_partial_destination() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, vec![7u8; 4096])?;
        fs::write(&dst, vec![7u8; 1024])?;

        let (use_delta, is_partial) = should_use_delta(&src, &dst)?;
        assert!(use_delta);
        assert!(is_partial);
        Ok(())
    }

    #[test]
    fn test_should_use_delta_small_source_skipped() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        // Same length, different content, well under the floor
        fs::write(&src, vec![1u8; 2048])?;
        fs::write(&dst, vec![2u8; 2048])?;

        let (use_delta, _) = should_use_delta(&src, &dst)?;
        assert!(!use_delta);
        Ok(())
    }

    #[test]
    fn test_should_use_delta_large_changed_source() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, vec![1u8; (DELTA_MIN_SOURCE_BYTES + MIB) as usize])?;
        fs::write(&dst, vec![2u8; (DELTA_MIN_SOURCE_BYTES + 2 * MIB) as usize])?;

        let (use_delta, is_partial) = should_use_delta(&src, &dst)?;
        assert!(use_delta);
        assert!(!is_partial);
        Ok(())
    }

    #[tokio::test]
    async fn test_pipeline_reconstructs_source_exactly() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");

        // Destination holds an older variant of the same data
        let new_data = patterned(512 * 1024, 3);
        let mut old_data = new_data.clone();
        old_data[100_000..100_100].fill(0xEE);
        old_data.truncate(400 * 1024);

        fs::write(&src, &new_data).unwrap();
        fs::write(&dst, &old_data).unwrap();

        let cancel = CancellationToken::new();
        let outcome = sync_file(&src, &dst, &cancel).await?;

        assert!(!outcome.used_fallback);
        assert_eq!(outcome.file_size, new_data.len() as u64);
        assert_eq!(fs::read(&dst).unwrap(), new_data);

        Ok(())
    }

    #[tokio::test]
    async fn test_pipeline_cleans_intermediates() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("f.bin");
        let dst = dir.path().join("out/f.bin");
        fs::create_dir(dir.path().join("out")).unwrap();
        fs::write(&src, patterned(128 * 1024, 1)).unwrap();
        fs::write(&dst, patterned(64 * 1024, 1)).unwrap();

        let cancel = CancellationToken::new();
        sync_file(&src, &dst, &cancel).await?;

        let out_entries: Vec<String> = fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(out_entries, vec!["f.bin".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_destination_falls_back_to_copy() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let data = patterned(64 * 1024, 9);
        fs::write(&src, &data).unwrap();
        // No destination file: phase 1 fails, fallback copies directly

        let cancel = CancellationToken::new();
        let outcome = sync_file(&src, &dst, &cancel).await?;

        assert!(outcome.used_fallback);
        assert_eq!(fs::read(&dst).unwrap(), data);

        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_preserves_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, patterned(64 * 1024, 2)).unwrap();
        let old = patterned(32 * 1024, 5);
        fs::write(&dst, &old).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = sync_file(&src, &dst, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(fs::read(&dst).unwrap(), old);
    }
}
