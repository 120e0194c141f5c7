//! Filesystem helpers used by the lifecycle operations.
//!
//! - `copy_dirs`: merge one tree into another, overwriting files
//! - `remove_dirs`: undo a `copy_dirs` overlay
//! - `rmdirs`: delete a directory tree
//! - `is_really_writable`: probe write permission on a file or directory

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Recursively copy `source` into `dest`, creating directories as needed and
/// overwriting files that already exist.
pub fn copy_dirs(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).context(format!("Failed to create directory: {:?}", dest))?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.context(format!("Failed to walk directory: {:?}", source))?;
        let rel = entry.path().strip_prefix(source)?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .context(format!("Failed to create directory: {:?}", target))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {:?} -> {:?}", entry.path(), target)
            })?;
        }
    }

    Ok(())
}

/// Remove from `dest` every file that mirrors a file under `source`, then
/// prune the directories that mirrored `source` directories and are now empty.
///
/// Returns the number of files removed.
pub fn remove_dirs(source: &Path, dest: &Path) -> Result<usize> {
    if !source.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    let mut dirs = Vec::new();

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.context(format!("Failed to walk directory: {:?}", source))?;
        let rel = entry.path().strip_prefix(source)?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            dirs.push(target);
        } else if target.is_file() {
            fs::remove_file(&target).context(format!("Failed to remove file: {:?}", target))?;
            removed += 1;
        }
    }

    // Deepest first so children are gone before their parents are checked.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if is_empty_dir(&dir) {
            debug!("[FS] Pruning empty directory {:?}", dir);
            let _ = fs::remove_dir(&dir);
        }
    }

    Ok(removed)
}

/// Delete a directory and everything below it. A missing directory is not an error.
pub fn rmdirs(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    fs::remove_dir_all(dir).context(format!("Failed to remove directory: {:?}", dir))
}

fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Check whether a file or directory can actually be written.
///
/// Directories are probed by creating and deleting a uniquely named file.
/// Files are probed by opening them for append. Missing paths are not writable.
pub fn is_really_writable(path: &Path) -> bool {
    if path.is_dir() {
        let seed = format!(
            "{:?}{}",
            std::time::SystemTime::now(),
            std::process::id()
        );
        let probe = path.join(format!("{:x}", md5::compute(seed.as_bytes())));
        match OpenOptions::new().append(true).create(true).open(&probe) {
            Ok(file) => {
                drop(file);
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    } else if path.is_file() {
        OpenOptions::new().append(true).open(path).is_ok()
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_copy_dirs_merges_and_overwrites() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("css/site.css"), "new");
        write(&src.join("js/app.js"), "js");
        write(&dest.join("css/site.css"), "old");
        write(&dest.join("keep.txt"), "keep");

        copy_dirs(&src, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("css/site.css")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dest.join("js/app.js")).unwrap(), "js");
        assert!(dest.join("keep.txt").exists());
    }

    #[test]
    fn test_remove_dirs_only_touches_mirrored_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("addons/cms/cms.js"), "x");
        write(&dest.join("addons/cms/cms.js"), "x");
        write(&dest.join("addons/other/other.js"), "y");

        let removed = remove_dirs(&src, &dest).unwrap();

        assert_eq!(removed, 1);
        assert!(!dest.join("addons/cms").exists());
        assert!(dest.join("addons/other/other.js").exists());
    }

    #[test]
    fn test_remove_dirs_keeps_non_empty_shared_dirs() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("controller/Cms.rs"), "x");
        write(&dest.join("controller/Cms.rs"), "x");
        write(&dest.join("controller/Index.rs"), "host");

        remove_dirs(&src, &dest).unwrap();

        assert!(!dest.join("controller/Cms.rs").exists());
        assert!(dest.join("controller/Index.rs").exists());
    }

    #[test]
    fn test_rmdirs_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        rmdirs(&tmp.path().join("missing")).unwrap();

        let dir = tmp.path().join("tree");
        write(&dir.join("a/b.txt"), "b");
        rmdirs(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_is_really_writable() {
        let tmp = TempDir::new().unwrap();
        assert!(is_really_writable(tmp.path()));
        // The probe file must not be left behind.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);

        let file = tmp.path().join("config.json");
        assert!(!is_really_writable(&file));
        fs::write(&file, "[]").unwrap();
        assert!(is_really_writable(&file));
    }
}
