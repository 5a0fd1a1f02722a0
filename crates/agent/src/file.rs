//! File materialisation: create, reconcile, delete.
//!
//! Writes are atomic (staged temp file + rename within the parent) and
//! checksum-free idempotent: when the existing bytes already match, the file
//! is left alone (preserving mtime) but mode and ownership are still
//! reconciled.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nix::unistd::{chown, Gid, Uid};
use sentinel_common::{File, FileAction};
use tracing::debug;

/// Mode applied to created files when the entry does not set one.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o600;
/// Mode applied to created directories when the entry does not set one.
pub const DEFAULT_DIRECTORY_PERMISSIONS: u32 = 0o755;

/// Mode for parent directories created on the way to a file path.
const PARENT_DIRECTORY_PERMISSIONS: u32 = 0o755;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("path was empty")]
    EmptyPath,
    #[error("content of {path} was not valid base64: {source}")]
    Base64 {
        path: String,
        source: base64::DecodeError,
    },
    #[error("invalid permission string {permissions:?} for {path}")]
    Permissions { path: String, permissions: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("ownership change on {path} failed: {source}")]
    Chown { path: String, source: nix::Error },
}

fn io_err(path: &str, source: std::io::Error) -> FileError {
    FileError::Io {
        path: path.to_string(),
        source,
    }
}

/// Apply one plan file entry.
pub fn apply_file(file: &File) -> Result<(), FileError> {
    if file.path.is_empty() {
        return Err(FileError::EmptyPath);
    }
    match &file.action {
        FileAction::CreateDirectory => create_directory(file),
        FileAction::CreateFile { content } => write_base64_content(file, content),
        FileAction::Delete => delete_path(&file.path),
    }
}

/// Parse an octal permission string. Empty strings are rejected; callers
/// substitute the per-action default before calling.
pub fn parse_perm(permissions: &str) -> Option<u32> {
    if permissions.is_empty() {
        return None;
    }
    u32::from_str_radix(permissions, 8).ok().filter(|m| *m <= 0o7777)
}

fn requested_mode(file: &File, default: u32) -> Result<u32, FileError> {
    if file.permissions.is_empty() {
        return Ok(default);
    }
    parse_perm(&file.permissions).ok_or_else(|| FileError::Permissions {
        path: file.path.clone(),
        permissions: file.permissions.clone(),
    })
}

fn create_directory(file: &File) -> Result<(), FileError> {
    let mode = requested_mode(file, DEFAULT_DIRECTORY_PERMISSIONS)?;
    debug!(path = %file.path, mode = format_args!("{mode:#o}"), "creating directory");
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(&file.path)
        .map_err(|e| io_err(&file.path, e))?;
    reconcile_permissions(&file.path, file.uid, file.gid, mode)
}

fn write_base64_content(file: &File, content: &str) -> Result<(), FileError> {
    let mode = requested_mode(file, DEFAULT_FILE_PERMISSIONS)?;
    let decoded = BASE64.decode(content).map_err(|source| FileError::Base64 {
        path: file.path.clone(),
        source,
    })?;

    let path = Path::new(&file.path);
    match fs::read(path) {
        Ok(existing) if existing == decoded => {
            debug!(path = %file.path, "content unchanged, skipping write");
            return reconcile_permissions(&file.path, file.uid, file.gid, mode);
        }
        _ => {}
    }

    if let Some(parent) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(PARENT_DIRECTORY_PERMISSIONS)
            .create(parent)
            .map_err(|e| io_err(&file.path, e))?;
    }

    // Stage next to the destination so the rename stays on one filesystem.
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_err(&file.path, e))?;
    staged
        .write_all(&decoded)
        .map_err(|e| io_err(&file.path, e))?;
    staged
        .persist(path)
        .map_err(|e| io_err(&file.path, e.error))?;

    reconcile_permissions(&file.path, file.uid, file.gid, mode)
}

fn delete_path(path: &str) -> Result<(), FileError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    debug!(%path, "deleting");
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Set mode, then ownership. Negative uid/gid components are left alone.
pub fn reconcile_permissions(path: &str, uid: i32, gid: i32, mode: u32) -> Result<(), FileError> {
    debug!(%path, %uid, %gid, mode = format_args!("{mode:#o}"), "reconciling permissions");
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))?;
    let owner = (uid >= 0).then(|| Uid::from_raw(uid as u32));
    let group = (gid >= 0).then(|| Gid::from_raw(gid as u32));
    if owner.is_none() && group.is_none() {
        return Ok(());
    }
    chown(Path::new(path), owner, group).map_err(|source| FileError::Chown {
        path: path.to_string(),
        source,
    })
}
