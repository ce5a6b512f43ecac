//! Crash-safe file replacement.
//!
//! Writes go to an owner-only temp file in the destination directory, are
//! flushed and fsynced, then renamed over the destination. A reader sees
//! either the old bytes or the new bytes, never a mix.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use super::path::{PathError, PathGuard, SecurePath};
use crate::observability::audit::{preview, SecurityEventType, Severity};

impl PathGuard {
    /// Atomically replace `path` with `content`.
    pub fn atomic_write(
        &self,
        path: impl AsRef<Path>,
        content: &[u8],
        base: Option<&Path>,
    ) -> Result<SecurePath, PathError> {
        let target = self.validate_safe_path(path, base)?;

        match write_atomically(target.as_path(), content) {
            Ok(()) => {
                self.audit.log_security_event(
                    SecurityEventType::FileWritten,
                    Severity::Info,
                    "File written atomically",
                    json!({
                        "path": self.path_preview(target.as_path()),
                        "bytes": content.len(),
                    }),
                );
                Ok(target)
            }
            Err(source) => {
                self.audit.log_security_event(
                    SecurityEventType::FileWriteFailed,
                    Severity::Error,
                    format!("Atomic write failed: {}", source),
                    json!({ "path": self.path_preview(target.as_path()) }),
                );
                Err(PathError::AtomicWrite {
                    path: target.into_path_buf(),
                    source,
                })
            }
        }
    }

    /// Copy the current contents of `path` to a timestamped sibling backup,
    /// then atomically write `new_content`. Returns the backup path.
    pub fn atomic_backup_and_write(
        &self,
        path: impl AsRef<Path>,
        new_content: &[u8],
        base: Option<&Path>,
    ) -> Result<PathBuf, PathError> {
        let target = self.validate_safe_path(path, base)?;
        let original = self.read_bounded(target.as_path())?;

        let backup_path = backup_path_for(target.as_path());
        let parent = target.parent().map(Path::to_path_buf);
        let backup = self.atomic_write(&backup_path, &original, parent.as_deref())?;

        self.atomic_write(target.as_path(), new_content, base)?;
        Ok(backup.into_path_buf())
    }

    /// Atomically write the contents of `backup` back over `target`.
    pub fn restore_backup(
        &self,
        backup: impl AsRef<Path>,
        target: impl AsRef<Path>,
        base: Option<&Path>,
    ) -> Result<SecurePath, PathError> {
        let backup = self.validate_safe_path(backup, base)?;
        let content = self.read_bounded(backup.as_path())?;
        self.atomic_write(target, &content, base)
    }

    fn read_bounded(&self, path: &Path) -> Result<Vec<u8>, PathError> {
        let metadata = match fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => {
                return Err(self.report(
                    path,
                    PathError::NotFound {
                        path: path.to_path_buf(),
                    },
                ))
            }
        };
        if metadata.len() > self.config.max_file_size {
            return Err(self.report(
                path,
                PathError::TooLarge {
                    size: metadata.len(),
                    max: self.config.max_file_size,
                },
            ));
        }
        fs::read(path).map_err(|source| PathError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn path_preview(&self, path: &Path) -> String {
        preview(&path.to_string_lossy(), self.config.preview_length)
    }
}

/// `<name>.<unix_millis>.bak` next to `path`.
fn backup_path_for(path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{millis}.bak"))
}

fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // tempfile creates the file 0600 on unix.
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    // On failure the temp file comes back inside the error and is removed on drop.
    tmp.persist(path).map_err(|e| e.error)?;

    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
