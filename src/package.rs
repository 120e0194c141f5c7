//! Addon archives: extraction, backups and distribution builds.
//!
//! Archive entry names are POSIX-style paths relative to the addon root.
//! Entries under `static/` are destined for the shared public assets tree.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AddonError, AddonResult};
use crate::fsutil::rmdirs;
use crate::info::{is_valid_name, is_valid_version, read_info, INFO_FILE};

/// Files never shipped in a distribution archive.
const SKIPPED_FILES: &[&str] = &[".git", ".DS_Store", "Thumbs.db"];

/// Result of the best-effort backup taken before an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Created(PathBuf),
    Failed(String),
}

impl BackupOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            BackupOutcome::Created(path) => Some(path),
            BackupOutcome::Failed(_) => None,
        }
    }
}

/// Working-copy location of a downloaded package.
pub fn temp_zip_path(temp_dir: &Path, name: &str) -> PathBuf {
    temp_dir.join(format!("{}.zip", name))
}

/// Extract an addon package into `dest`.
///
/// `dest` is created if absent, but its parent must already exist. Entries
/// that would escape `dest` count as extraction failures.
pub fn unzip(archive_path: &Path, dest: &Path) -> AddonResult<PathBuf> {
    let mut archive = File::open(archive_path)
        .map_err(anyhow::Error::from)
        .and_then(|file| ZipArchive::new(file).map_err(anyhow::Error::from))
        .map_err(|e| {
            debug!("[ADDON-UNZIP] Cannot open {:?}: {}", archive_path, e);
            AddonError::operation("Unable to open the zip file")
        })?;

    if !dest.is_dir() {
        fs::create_dir(dest).map_err(|e| {
            AddonError::Operation(format!("Unable to create addon directory {:?}: {}", dest, e))
        })?;
    }

    extract_entries(&mut archive, dest).map_err(|e| {
        debug!("[ADDON-UNZIP] Extraction into {:?} failed: {:#}", dest, e);
        AddonError::operation("Unable to extract the file")
    })?;

    info!("[ADDON-UNZIP] Extracted {} entries into {:?}", archive.len(), dest);
    Ok(dest.to_path_buf())
}

fn extract_entries(archive: &mut ZipArchive<File>, dest: &Path) -> Result<()> {
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel_path) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            bail!("Unsafe entry path: {}", entry.name());
        };
        let outpath = dest.join(rel_path);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)
                .context(format!("Failed to create file: {:?}", outpath))?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

/// Archive an addon directory as `<name>-backup-<YYYYmmddHHMMSS>.zip`.
pub fn backup(addon_dir: &Path, backup_dir: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)
        .context(format!("Failed to create backup directory: {:?}", backup_dir))?;

    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let backup_path = backup_dir.join(format!("{}-backup-{}.zip", name, timestamp));

    let file = File::create(&backup_path)
        .context(format!("Failed to create backup file: {:?}", backup_path))?;
    let mut zip = ZipWriter::new(file);
    let mut seen = HashSet::new();
    add_tree(&mut zip, addon_dir, "", &[], &mut seen)?;
    zip.finish()?;

    info!("[ADDON-BACKUP] {} backed up to {:?}", name, backup_path);
    Ok(backup_path)
}

/// Replace an addon directory with the contents of a backup archive.
pub fn restore_backup(backup_path: &Path, addon_dir: &Path) -> Result<()> {
    rmdirs(addon_dir)?;
    fs::create_dir_all(addon_dir)?;

    let file = File::open(backup_path)
        .context(format!("Failed to open backup: {:?}", backup_path))?;
    let mut archive = ZipArchive::new(file)?;
    extract_entries(&mut archive, addon_dir)?;

    info!("[ADDON-BACKUP] Restored {:?} from {:?}", addon_dir, backup_path);
    Ok(())
}

/// Build a distribution archive `<name>-<version>.zip` in `build_dir`.
///
/// The descriptor must declare a letters-only name equal to the directory
/// name and a `MAJOR.MINOR.PATCH` version; otherwise nothing is written.
/// Files under `<public_static>/addons/<name>` are added with a `static/`
/// prefix, mirroring where install copies them.
pub fn pack(addon_dir: &Path, public_static_dir: &Path, build_dir: &Path) -> AddonResult<PathBuf> {
    let dir_name = addon_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if !addon_dir.join(INFO_FILE).is_file() {
        return Err(AddonError::operation("Addon info file was not found"));
    }
    let info = read_info(addon_dir)
        .map_err(|_| AddonError::operation("Addon info file data incorrect"))?;

    if !is_valid_name(&info.name) || info.name != dir_name {
        return Err(AddonError::operation("Addon info name incorrect"));
    }
    if !is_valid_version(&info.version) {
        return Err(AddonError::operation("Addon info version incorrect"));
    }

    let archive_path = build_dir.join(format!("{}-{}.zip", info.name, info.version));
    write_distribution(addon_dir, public_static_dir, &info.name, build_dir, &archive_path)
        .map_err(AddonError::from)?;

    info!("[ADDON-PACK] Packed {} {} into {:?}", info.name, info.version, archive_path);
    Ok(archive_path)
}

fn write_distribution(
    addon_dir: &Path,
    public_static_dir: &Path,
    name: &str,
    build_dir: &Path,
    archive_path: &Path,
) -> Result<()> {
    fs::create_dir_all(build_dir)
        .context(format!("Failed to create build directory: {:?}", build_dir))?;

    let file = File::create(archive_path)
        .context(format!("Failed to create archive: {:?}", archive_path))?;
    let mut zip = ZipWriter::new(file);
    let mut seen = HashSet::new();

    add_tree(&mut zip, addon_dir, "", SKIPPED_FILES, &mut seen)?;

    let companion = public_static_dir.join("addons").join(name);
    if companion.is_dir() {
        add_tree_relative(&mut zip, &companion, public_static_dir, "static", &mut seen)?;
    }

    zip.finish()?;
    Ok(())
}

/// Add every regular file under `root` to the archive, named relative to `root`.
fn add_tree(
    zip: &mut ZipWriter<File>,
    root: &Path,
    prefix: &str,
    skip: &[&str],
    seen: &mut HashSet<String>,
) -> Result<()> {
    add_tree_relative_filtered(zip, root, root, prefix, skip, seen)
}

/// Add every regular file under `dir`, named relative to `base` with `prefix`.
fn add_tree_relative(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    base: &Path,
    prefix: &str,
    seen: &mut HashSet<String>,
) -> Result<()> {
    add_tree_relative_filtered(zip, dir, base, prefix, SKIPPED_FILES, seen)
}

fn add_tree_relative_filtered(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    base: &Path,
    prefix: &str,
    skip: &[&str],
    seen: &mut HashSet<String>,
) -> Result<()> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skip.iter().any(|s| e.file_name() == *s));

    for entry in walker {
        let entry = entry.context(format!("Failed to walk directory: {:?}", dir))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry.path().strip_prefix(base)?;
        let mut entry_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !prefix.is_empty() {
            entry_name = format!("{}/{}", prefix, entry_name);
        }

        if !seen.insert(entry_name.clone()) {
            debug!("[ADDON-PACK] Skipping duplicate entry {}", entry_name);
            continue;
        }

        zip.start_file(entry_name.as_str(), options)?;
        let mut source = File::open(entry.path())
            .context(format!("Failed to open {:?}", entry.path()))?;
        io::copy(&mut source, zip)?;
    }

    Ok(())
}
