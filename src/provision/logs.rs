//! Diagnostic log collection shared by the patch and seal stages.
//!
//! Several external tools drop log files beside the disk they service, and
//! the guest leaves setup logs inside its filesystem. Both get gathered
//! into the run's log directory with a stage suffix in the file name so
//! logs from different stages touching the same disk never collide.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Build the suffixed destination name: `setupact.log` + `panther`
/// → `setupact-panther.log`.
fn suffixed_name(file: &Path, suffix: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .unwrap_or_else(|| OsStr::new("log"))
        .to_string_lossy();
    match file.extension() {
        Some(ext) => PathBuf::from(format!("{stem}-{suffix}.{}", ext.to_string_lossy())),
        None => PathBuf::from(format!("{stem}-{suffix}")),
    }
}

/// `*.log` files directly inside `dir` (non-recursive). A missing directory
/// yields an empty list — external tools only create it when they have
/// something to say.
fn log_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read log source directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("log"))
        {
            found.push(path);
        }
    }
    Ok(found)
}

/// Copy every `*.log` in `src_dir` into `log_dir`, renamed with `suffix`.
/// Returns the number of files copied.
pub fn copy_logs_with_suffix(src_dir: &Path, log_dir: &Path, suffix: &str) -> Result<usize> {
    let files = log_files_in(src_dir)?;
    if files.is_empty() {
        debug!(dir = %src_dir.display(), "no log files to collect");
        return Ok(0);
    }

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;

    for file in &files {
        let dest = log_dir.join(suffixed_name(file, suffix));
        std::fs::copy(file, &dest)
            .with_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
    }

    info!(
        count = files.len(),
        from = %src_dir.display(),
        suffix,
        "collected log files"
    );
    Ok(files.len())
}

/// Like [`copy_logs_with_suffix`], but also deletes the originals so later
/// stages touching the same directory start clean.
pub fn relocate_logs(src_dir: &Path, log_dir: &Path, suffix: &str) -> Result<usize> {
    let files = log_files_in(src_dir)?;
    if files.is_empty() {
        return Ok(0);
    }

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;

    for file in &files {
        let dest = log_dir.join(suffixed_name(file, suffix));
        std::fs::copy(file, &dest)
            .with_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
        std::fs::remove_file(file)
            .with_context(|| format!("remove relocated log {}", file.display()))?;
    }

    info!(
        count = files.len(),
        from = %src_dir.display(),
        suffix,
        "relocated log files"
    );
    Ok(files.len())
}
