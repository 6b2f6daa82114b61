//! Directory comparison and transfer planning.
//!
//! Walks both trees, classifies every relative path, and materialises the
//! work list for the requested operation type. Change detection uses size
//! plus whole-second mtime, the same heuristic the resume checks use.

use crate::fs::metadata::{mtime_eq, mtime_newer};
use crate::fs::walker::{walk_directory, FileEntry, WalkOptions};
use crate::operation::OperationType;
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// How a source-relative path compares across the two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Same size, same mtime
    Identical,
    SourceNewer,
    DestNewer,
    /// Same mtime, different size: neither side can win
    Conflicting,
    SourceOnly,
    DestOnly,
}

/// One file the plan wants copied.
#[derive(Debug, Clone)]
pub struct PlannedCopy {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
}

/// Work list for one operation.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub to_copy: Vec<PlannedCopy>,
    /// BiDirectionalSync only: destination -> source copies
    pub to_copy_reverse: Vec<PlannedCopy>,
    /// Destination paths to delete (Mirror) or source paths (Move post-phase)
    pub to_delete: Vec<PathBuf>,
    pub identical_skipped: Vec<PathBuf>,
    pub conflicts: Vec<PathBuf>,
}

impl Plan {
    pub fn total_files_to_copy(&self) -> u64 {
        (self.to_copy.len() + self.to_copy_reverse.len()) as u64
    }

    pub fn total_bytes_to_copy(&self) -> u64 {
        self.to_copy.iter().map(|c| c.size).sum::<u64>()
            + self.to_copy_reverse.iter().map(|c| c.size).sum::<u64>()
    }

    pub fn total_files_to_delete(&self) -> u64 {
        self.to_delete.len() as u64
    }
}

/// Dry-run summary of what an operation would do.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOperationSummary {
    pub operation_type: OperationType,
    pub files_to_copy: u64,
    pub files_to_delete: u64,
    pub identical: u64,
    pub conflicts: u64,
    pub total_bytes_to_copy: u64,
    pub total_bytes_to_delete: u64,
}

/// Classify one relative path present in the source tree.
fn classify(src: &FileEntry, dst: Option<&FileEntry>) -> FileClass {
    let Some(dst) = dst else {
        return FileClass::SourceOnly;
    };

    let same_mtime = mtime_eq(src.modified, dst.modified);
    if same_mtime {
        if src.size == dst.size {
            return FileClass::Identical;
        }
        return FileClass::Conflicting;
    }

    if mtime_newer(src.modified, dst.modified) {
        FileClass::SourceNewer
    } else {
        FileClass::DestNewer
    }
}

/// Build the plan for `operation_type` between the two roots.
pub async fn build_plan(
    source_root: &Path,
    destination_root: &Path,
    operation_type: OperationType,
    options: &WalkOptions,
) -> Result<Plan> {
    let source_root = source_root.to_path_buf();
    let destination_root = destination_root.to_path_buf();
    let options = options.clone();

    tokio::task::spawn_blocking(move || {
        build_plan_blocking(&source_root, &destination_root, operation_type, &options)
    })
    .await
    .map_err(|e| EngineError::OperationFatal(format!("planning task failed: {e}")))?
}

fn build_plan_blocking(
    source_root: &Path,
    destination_root: &Path,
    operation_type: OperationType,
    options: &WalkOptions,
) -> Result<Plan> {
    if !source_root.exists() {
        return Err(EngineError::SourceMissing(source_root.to_path_buf()));
    }

    let source_files = walk_directory(source_root, options)?;

    // A destination that does not exist yet is simply an empty tree
    let dest_files = if destination_root.exists() {
        walk_directory(destination_root, options)?
    } else {
        Vec::new()
    };

    let dest_by_relative: HashMap<&Path, &FileEntry> = dest_files
        .iter()
        .map(|f| (f.relative_path.as_path(), f))
        .collect();

    let mut plan = Plan::default();
    let mut source_by_relative: HashMap<&Path, &FileEntry> = HashMap::new();

    let planned = |entry: &FileEntry| PlannedCopy {
        source: entry.path.clone(),
        destination: destination_root.join(&entry.relative_path),
        relative: entry.relative_path.clone(),
        size: entry.size,
    };

    for src in &source_files {
        source_by_relative.insert(src.relative_path.as_path(), src);
        let class = classify(src, dest_by_relative.get(src.relative_path.as_path()).copied());

        match operation_type {
            // Copy and Move take everything, changed or not
            OperationType::Copy | OperationType::Move => {
                plan.to_copy.push(planned(src));
            }
            OperationType::Sync | OperationType::Mirror | OperationType::BiDirectionalSync => {
                match class {
                    FileClass::SourceOnly | FileClass::SourceNewer => {
                        plan.to_copy.push(planned(src));
                    }
                    FileClass::Identical => {
                        plan.identical_skipped.push(src.relative_path.clone());
                    }
                    FileClass::Conflicting => {
                        if operation_type == OperationType::BiDirectionalSync {
                            plan.conflicts.push(src.relative_path.clone());
                        }
                    }
                    FileClass::DestNewer | FileClass::DestOnly => {}
                }
            }
        }
    }

    // Destination-only files: deleted by Mirror, copied back by BiSync
    for dst in &dest_files {
        if source_by_relative.contains_key(dst.relative_path.as_path()) {
            continue;
        }
        match operation_type {
            OperationType::Mirror => {
                plan.to_delete.push(dst.path.clone());
            }
            OperationType::BiDirectionalSync => {
                plan.to_copy_reverse.push(PlannedCopy {
                    source: dst.path.clone(),
                    destination: source_root.join(&dst.relative_path),
                    relative: dst.relative_path.clone(),
                    size: dst.size,
                });
            }
            _ => {}
        }
    }

    // BiSync also pulls back files the destination has newer
    if operation_type == OperationType::BiDirectionalSync {
        for dst in &dest_files {
            let Some(src) = source_by_relative.get(dst.relative_path.as_path()).copied() else {
                continue;
            };
            if classify(src, Some(dst)) == FileClass::DestNewer {
                plan.to_copy_reverse.push(PlannedCopy {
                    source: dst.path.clone(),
                    destination: source_root.join(&dst.relative_path),
                    relative: dst.relative_path.clone(),
                    size: dst.size,
                });
            }
        }
    }

    // Move deletes its sources after a fully successful copy phase
    if operation_type == OperationType::Move {
        plan.to_delete = source_files.iter().map(|f| f.path.clone()).collect();
    }

    Ok(plan)
}

/// Dry-run: plan without executing, summarised.
pub async fn analyse_sync(
    source_root: &Path,
    destination_root: &Path,
    operation_type: OperationType,
    options: &WalkOptions,
) -> Result<SyncOperationSummary> {
    let plan = build_plan(source_root, destination_root, operation_type, options).await?;

    let total_bytes_to_delete = plan
        .to_delete
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    Ok(SyncOperationSummary {
        operation_type,
        files_to_copy: plan.total_files_to_copy(),
        files_to_delete: plan.total_files_to_delete(),
        identical: plan.identical_skipped.len() as u64,
        conflicts: plan.conflicts.len() as u64,
        total_bytes_to_copy: plan.total_bytes_to_copy(),
        total_bytes_to_delete,
    })
}
