//! File-set analysis for strategy selection.
//!
//! Buckets the files under a root by size and compressibility. Large trees
//! are sampled: the first and last entries are always inspected and the
//! rest randomly down-sampled to a cap, with bucket counts extrapolated
//! back to the full population.

use crate::compress::{is_compressible_extension, is_precompressed_extension};
use crate::fs::walker::{walk_directory, FileEntry, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Sample cap for large file sets.
const SAMPLE_CAP: usize = 1000;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Aggregate shape of a file set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSetProfile {
    pub total_files: u64,
    pub total_bytes: u64,

    /// < 1 MiB
    pub tiny_files: u64,
    /// 1 MiB - 10 MiB
    pub small_files: u64,
    /// 10 MiB - 100 MiB
    pub medium_files: u64,
    /// 100 MiB - 1 GiB
    pub large_files: u64,
    /// >= 1 GiB
    pub huge_files: u64,

    pub avg_file_size_mib: f64,
    pub max_depth: usize,

    pub compressible_files: u64,
    pub already_compressed_files: u64,

    pub extension_histogram: HashMap<String, u64>,
}

impl FileSetProfile {
    /// Share of files below the 10 MiB line.
    pub fn tiny_and_small_fraction(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        (self.tiny_files + self.small_files) as f64 / self.total_files as f64
    }
}

/// Analyse the file set under `root`.
pub async fn analyse_file_set(root: &Path, options: &WalkOptions) -> Result<FileSetProfile> {
    let root = root.to_path_buf();
    let options = options.clone();

    tokio::task::spawn_blocking(move || {
        let entries = walk_directory(&root, &options)?;
        Ok(profile_entries(&entries))
    })
    .await
    .map_err(|e| EngineError::OperationFatal(format!("analysis task failed: {e}")))?
}

fn size_bucket(size: u64) -> usize {
    match size {
        s if s < MIB => 0,
        s if s < 10 * MIB => 1,
        s if s < 100 * MIB => 2,
        s if s < GIB => 3,
        _ => 4,
    }
}

fn classify_extension(entry: &FileEntry) -> (Option<String>, bool, bool) {
    let ext = entry
        .path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());

    match &ext {
        Some(e) => {
            let pre = is_precompressed_extension(e);
            let comp = !pre && is_compressible_extension(e);
            (ext, comp, pre)
        }
        None => (None, false, false),
    }
}

/// Build the profile. Exact for small sets; sampled and extrapolated past
/// the cap.
pub fn profile_entries(entries: &[FileEntry]) -> FileSetProfile {
    let total_files = entries.len() as u64;
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    let max_depth = entries.iter().map(|e| e.depth).max().unwrap_or(0);

    let sampled: Vec<&FileEntry> = if entries.len() > SAMPLE_CAP {
        sample_entries(entries, SAMPLE_CAP)
    } else {
        entries.iter().collect()
    };

    let factor = if sampled.is_empty() {
        0.0
    } else {
        total_files as f64 / sampled.len() as f64
    };

    let mut buckets = [0u64; 5];
    let mut compressible = 0u64;
    let mut precompressed = 0u64;
    let mut histogram: HashMap<String, u64> = HashMap::new();

    for entry in &sampled {
        buckets[size_bucket(entry.size)] += 1;

        let (ext, comp, pre) = classify_extension(entry);
        if comp {
            compressible += 1;
        }
        if pre {
            precompressed += 1;
        }
        if let Some(ext) = ext {
            *histogram.entry(ext).or_insert(0) += 1;
        }
    }

    let scale = |count: u64| (count as f64 * factor).round() as u64;

    FileSetProfile {
        total_files,
        total_bytes,
        tiny_files: scale(buckets[0]),
        small_files: scale(buckets[1]),
        medium_files: scale(buckets[2]),
        large_files: scale(buckets[3]),
        huge_files: scale(buckets[4]),
        avg_file_size_mib: if total_files > 0 {
            (total_bytes as f64 / total_files as f64) / MIB as f64
        } else {
            0.0
        },
        max_depth,
        compressible_files: scale(compressible),
        already_compressed_files: scale(precompressed),
        extension_histogram: histogram
            .into_iter()
            .map(|(ext, count)| (ext, scale(count)))
            .collect(),
    }
}

/// First and last entries always included; the middle randomly sampled.
fn sample_entries(entries: &[FileEntry], cap: usize) -> Vec<&FileEntry> {
    let mut sampled = Vec::with_capacity(cap);
    sampled.push(&entries[0]);

    let middle = &entries[1..entries.len() - 1];
    let middle_take = cap.saturating_sub(2).min(middle.len());
    let indices = rand::seq::index::sample(&mut rand::rng(), middle.len(), middle_take);
    for idx in indices.iter() {
        sampled.push(&middle[idx]);
    }

    sampled.push(&entries[entries.len() - 1]);
    sampled
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn entry(name: &str, size: u64, depth: usize) -> FileEntry {
        FileEntry {
            path: PathBuf::from(name),
            relative_path: PathBuf::from(name),
            size,
            modified: SystemTime::UNIX_EPOCH,
            depth,
        }
    }

    #[test]
    fn test_size_buckets() {
        assert_eq!(size_bucket(0), 0);
        assert_eq!(size_bucket(MIB - 1), 0);
        assert_eq!(size_bucket(MIB), 1);
        assert_eq!(size_bucket(10 * MIB - 1), 1);
        assert_eq!(size_bucket(10 * MIB), 2);
        assert_eq!(size_bucket(100 * MIB), 3);
        assert_eq!(size_bucket(GIB), 4);
    }

    #[test]
    fn test_exact_profile_small_set() {
        let entries = vec![
            entry("a.txt", 100, 1),
            entry("b.log", 2 * MIB, 2),
            entry("c.jpg", 15 * MIB, 1),
            entry("d.iso", 2 * GIB, 3),
        ];

        let profile = profile_entries(&entries);

        assert_eq!(profile.total_files, 4);
        assert_eq!(profile.total_bytes, 100 + 2 * MIB + 15 * MIB + 2 * GIB);
        assert_eq!(profile.tiny_files, 1);
        assert_eq!(profile.small_files, 1);
        assert_eq!(profile.medium_files, 1);
        assert_eq!(profile.huge_files, 1);
        assert_eq!(profile.max_depth, 3);

        // a.txt and b.log compressible; c.jpg and d.iso precompressed
        assert_eq!(profile.compressible_files, 2);
        assert_eq!(profile.already_compressed_files, 2);
        assert_eq!(profile.extension_histogram.get("txt"), Some(&1));
        assert_eq!(profile.extension_histogram.get("log"), Some(&1));
    }

    #[test]
    fn test_empty_set() {
        let profile = profile_entries(&[]);
        assert_eq!(profile.total_files, 0);
        assert_eq!(profile.total_bytes, 0);
        assert_eq!(profile.avg_file_size_mib, 0.0);
        assert_eq!(profile.tiny_and_small_fraction(), 0.0);
    }

    #[test]
    fn test_sampled_buckets_extrapolate() {
        // 5000 tiny files: sampling must still report roughly all of them
        let entries: Vec<FileEntry> = (0..5000)
            .map(|i| entry(&format!("f{}.txt", i), 1024, 1))
            .collect();

        let profile = profile_entries(&entries);

        assert_eq!(profile.total_files, 5000);
        // All sampled entries land in the tiny bucket, so extrapolation
        // recovers the full count exactly.
        assert_eq!(profile.tiny_files, 5000);
        assert_eq!(profile.small_files, 0);
    }

    #[test]
    fn test_bucket_sum_tolerance_under_sampling() {
        // Mixed set large enough to trigger sampling
        let entries: Vec<FileEntry> = (0..3000)
            .map(|i| {
                let size = if i % 3 == 0 { 512 } else { 2 * MIB };
                entry(&format!("f{}.dat", i), size, 1)
            })
            .collect();

        let profile = profile_entries(&entries);
        let bucket_sum = profile.tiny_files
            + profile.small_files
            + profile.medium_files
            + profile.large_files
            + profile.huge_files;

        let tolerance = profile.total_files / 10;
        assert!(
            bucket_sum.abs_diff(profile.total_files) <= tolerance,
            "bucket sum {} too far from total {}",
            bucket_sum,
            profile.total_files
        );
    }

    #[test]
    fn test_tiny_and_small_fraction() {
        let entries = vec![
            entry("a.txt", 100, 1),
            entry("b.txt", 200, 1),
            entry("c.bin", 50 * MIB, 1),
            entry("d.bin", 60 * MIB, 1),
        ];

        let profile = profile_entries(&entries);
        assert!((profile.tiny_and_small_fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_analyse_real_tree() -> crate::Result<()> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("a.log"), vec![b'x'; 2048]).unwrap();
        std::fs::write(temp_dir.path().join("sub/b.zip"), vec![b'y'; 1024]).unwrap();

        let profile = analyse_file_set(temp_dir.path(), &WalkOptions::default()).await?;

        assert_eq!(profile.total_files, 2);
        assert_eq!(profile.total_bytes, 3072);
        assert_eq!(profile.tiny_files, 2);
        assert_eq!(profile.compressible_files, 1);
        assert_eq!(profile.already_compressed_files, 1);

        Ok(())
    }
}
