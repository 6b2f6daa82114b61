//! Directory traversal for transfer planning.
//!
//! Enumerates a source tree into flat file records carrying the size and
//! modification time the planner and analyzer need for change detection.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns matched against file names
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

/// A file discovered during enumeration
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the enumeration root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Depth from root
    pub depth: usize,
}

impl FileEntry {
    /// Create a FileEntry from a DirEntry.
    /// Symlinks are resolved to their target; symlinks to directories and
    /// broken symlinks are skipped.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let (size, modified) = if raw_metadata.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) => {
                    if resolved.is_dir() {
                        return Ok(None);
                    }
                    (resolved.len(), resolved.modified()?)
                }
                Err(_) => {
                    // Broken symlink
                    return Ok(None);
                }
            }
        } else {
            (raw_metadata.len(), raw_metadata.modified()?)
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            modified,
            depth: entry.depth(),
        }))
    }
}

/// Walk a directory tree and collect all regular files.
///
/// Enumeration order within a directory is platform-defined; callers must
/// not rely on any ordering across files.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileEntry>> {
    let mut files = Vec::new();

    walk_directory_with_callback(root, options, |file| {
        files.push(file.clone());
    })?;

    Ok(files)
}

/// Walk a directory tree invoking a callback per file.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileEntry),
{
    let mut walker = WalkDir::new(root).follow_links(options.follow_links);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_patterns) {
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file) = FileEntry::from_entry(&entry, root)? {
            callback(&file);
        }
    }

    Ok(())
}

/// Collect the empty directory skeleton of a tree, deepest first.
/// Used by Move post-processing to remove emptied source directories.
pub fn collect_directories(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            dirs.push(entry.path().to_path_buf());
        }
    }

    // Deepest first so children are removed before their parents
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    Ok(dirs)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();

    for pattern in patterns {
        if file_name.contains(pattern) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_files() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 2);

        Ok(())
    }

    #[test]
    fn test_relative_paths_cover_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;
        fs::write(temp_dir.path().join("sub/b.txt"), b"b")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let mut rels: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        rels.sort();

        assert_eq!(rels, vec!["a.txt", "sub/b.txt"]);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "file.txt");

        Ok(())
    }

    #[test]
    fn test_entries_carry_size_and_mtime() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("f.bin"), vec![0u8; 4096])?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 4096);
        assert!(files[0].modified > SystemTime::UNIX_EPOCH);

        Ok(())
    }

    #[test]
    fn test_max_depth_limits_enumeration() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("a/b"))?;
        fs::write(temp_dir.path().join("top.txt"), b"top")?;
        fs::write(temp_dir.path().join("a/mid.txt"), b"mid")?;
        fs::write(temp_dir.path().join("a/b/deep.txt"), b"deep")?;

        let options = WalkOptions {
            max_depth: Some(1),
            ..WalkOptions::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "top.txt");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_resolved_to_target_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("real.bin"), vec![0u8; 2048])?;
        std::os::unix::fs::symlink(
            temp_dir.path().join("real.bin"),
            temp_dir.path().join("link.bin"),
        )?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 2);
        for file in &files {
            assert_eq!(file.size, 2048);
        }

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        std::os::unix::fs::symlink(
            temp_dir.path().join("gone.bin"),
            temp_dir.path().join("dangling"),
        )?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "keep.txt");

        Ok(())
    }

    #[test]
    fn test_collect_directories_deepest_first() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("a/b/c"))?;

        let dirs = collect_directories(temp_dir.path())?;
        assert_eq!(dirs.len(), 3);
        assert!(dirs[0].ends_with("a/b/c"));
        assert!(dirs[2].ends_with("a"));

        Ok(())
    }
}
