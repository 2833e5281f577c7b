//! Staging uploaded bundles and saved projects into a directory
//!
//! A single `.zip` upload is checked entry by entry before anything is
//! written; one unsafe entry rejects the whole archive. Loose files keep
//! only a sanitized basename.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use tm_core::api::UploadedFile;

use crate::error::{OrchestratorError, Result};

/// Upload extensions treated as archives
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip"];

/// Unix file type bits marking a symlink entry
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Whether an uploaded file name denotes a supported archive
pub fn is_archive(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ARCHIVE_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
        .unwrap_or(false)
}

/// Basename of an uploaded file with every character outside `[A-Za-z0-9._-]` replaced
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(OrchestratorError::validation(format!(
            "Invalid file name: {:?}",
            name
        )));
    }
    Ok(sanitized)
}

/// Check an archive entry name before extraction
pub fn validate_entry_name(name: &str) -> Result<()> {
    let unsafe_entry = || OrchestratorError::UnsafeArchive(name.to_string());

    if name.is_empty() || name.contains('\0') {
        return Err(unsafe_entry());
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(unsafe_entry());
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(unsafe_entry());
    }
    if name.split(['/', '\\']).any(|part| part == "..") {
        return Err(unsafe_entry());
    }
    Ok(())
}

/// Write an upload into `dest`, which must already exist
///
/// Returns the number of files written.
pub async fn stage_upload(files: &[UploadedFile], dest: &Path, max_bytes: u64) -> Result<usize> {
    let total: u64 = files.iter().map(|f| f.data.len() as u64).sum();
    if total > max_bytes {
        return Err(OrchestratorError::validation(format!(
            "Upload of {} bytes exceeds the {} byte limit",
            total, max_bytes
        )));
    }

    match files {
        [single] if is_archive(&single.name) => {
            let data = single.data.clone();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || extract_zip(data, &dest, max_bytes))
                .await
                .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))?
        }
        _ => {
            let mut written = 0;
            for file in files {
                let name = sanitize_file_name(&file.name)?;
                tokio::fs::write(dest.join(&name), &file.data).await?;
                written += 1;
            }
            Ok(written)
        }
    }
}

/// Validate every entry, then extract
///
/// Decompressed output across all entries is capped at `max_bytes`.
fn extract_zip(data: Vec<u8>, dest: &Path, max_bytes: u64) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| OrchestratorError::validation(format!("Invalid zip archive: {}", e)))?;

    let mut entries: Vec<(usize, PathBuf, bool)> = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| OrchestratorError::validation(format!("Invalid zip archive: {}", e)))?;
        let name = entry.name().to_string();
        validate_entry_name(&name)?;
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(OrchestratorError::UnsafeArchive(format!("{} (symlink)", name)));
        }
        let relative = entry
            .enclosed_name()
            .filter(|p| p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)))
            .ok_or_else(|| OrchestratorError::UnsafeArchive(name.clone()))?;
        entries.push((index, relative, entry.is_dir()));
    }

    let mut written = 0;
    let mut extracted: u64 = 0;
    for (index, relative, is_dir) in entries {
        let target = dest.join(&relative);
        if is_dir {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = archive
            .by_index(index)
            .map_err(|e| OrchestratorError::validation(format!("Invalid zip archive: {}", e)))?;
        let remaining = max_bytes - extracted;
        let mut out = std::fs::File::create(&target)?;
        let mut limited = (&mut entry).take(remaining.saturating_add(1));
        let copied = std::io::copy(&mut limited, &mut out)?;
        if copied > remaining {
            return Err(OrchestratorError::validation(format!(
                "Archive expands past the {} byte limit",
                max_bytes
            )));
        }
        extracted += copied;
        written += 1;
    }

    tracing::debug!("Extracted {} file(s) into {:?}", written, dest);
    Ok(written)
}

/// Recursively copy a saved project; symlinks are not followed or copied
pub async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        let dest_path = dst.join(entry.file_name());
        let file_type = entry.file_type().await?;

        if file_type.is_dir() {
            Box::pin(copy_tree(&entry_path, &dest_path)).await?;
        } else if file_type.is_file() {
            tokio::fs::copy(&entry_path, &dest_path).await?;
        } else {
            tracing::debug!("Skipping non-regular file {:?}", entry_path);
        }
    }
    Ok(())
}

/// Application root inside a staged directory
///
/// A directory holding exactly one subdirectory and no files is unwrapped
/// one level, for archives that wrap everything in a single folder.
pub async fn resolve_app_root(staged: &Path) -> std::io::Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(staged).await?;
    let mut only_dir = None;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        count += 1;
        if count > 1 {
            return Ok(staged.to_path_buf());
        }
        if entry.file_type().await?.is_dir() {
            only_dir = Some(entry.path());
        }
    }
    Ok(only_dir.unwrap_or_else(|| staged.to_path_buf()))
}
