//! Path validation.
//!
//! # Check Order
//! ```text
//! raw input
//!     → length ceiling
//!     → null-byte sequences (raw, %00, double-encoded, overlong UTF-8)
//!     → encoded traversal (backslash, %2e%2e%2f, %252e%252e%252f, ...)
//!     → resolve against base (or cwd), canonicalize existing prefix
//!     → strict-descendant check against base
//!     → literal `..` components
//!     → reserved device names (all platforms)
//! ```

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::json;

use crate::config::PathConfig;
use crate::observability::audit::{preview, AuditSink, SecurityEventType, Severity};
use crate::observability::metrics;

const NULL_BYTE_PATTERNS: &[&str] = &["\0", "%00", "%2500", "%c0%80", "\\x00", "\\u0000"];

const ENCODED_TRAVERSAL_PATTERNS: &[&str] = &[
    "..\\",
    "%2e%2e%2f",
    "%2e%2e/",
    "..%2f",
    "%2e%2e%5c",
    "%2e%2e\\",
    "..%5c",
    "%252e%252e%252f",
    "%252e%252e/",
    "..%252f",
    "%252e%252e%255c",
    "..%255c",
    "..%c0%af",
    "%c0%ae%c0%ae",
];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Machine-readable path error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathErrorKind {
    Traversal,
    NullByte,
    DangerousComponent,
    TooLong,
    OutsideBase,
    AbsoluteComponent,
    NotFound,
    TooLarge,
    AtomicWrite,
    Io,
}

impl PathErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traversal => "traversal",
            Self::NullByte => "null_byte",
            Self::DangerousComponent => "dangerous_component",
            Self::TooLong => "too_long",
            Self::OutsideBase => "outside_base",
            Self::AbsoluteComponent => "absolute_component",
            Self::NotFound => "not_found",
            Self::TooLarge => "too_large",
            Self::AtomicWrite => "atomic_write",
            Self::Io => "io",
        }
    }
}

/// Errors raised by the path and file boundary.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path traversal detected in '{preview}'")]
    Traversal { preview: String },

    #[error("null byte sequence detected in '{preview}'")]
    NullByte { preview: String },

    #[error("reserved device name '{component}' in path")]
    DangerousComponent { component: String },

    #[error("path length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },

    #[error("{} is outside base directory {}", .path.display(), .base.display())]
    OutsideBase { path: PathBuf, base: PathBuf },

    #[error("path component '{component}' must be relative")]
    AbsoluteComponent { component: String },

    #[error("file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("file size {size} exceeds maximum {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("atomic write to {} failed: {source}", .path.display())]
    AtomicWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PathError {
    pub fn kind(&self) -> PathErrorKind {
        match self {
            Self::Traversal { .. } => PathErrorKind::Traversal,
            Self::NullByte { .. } => PathErrorKind::NullByte,
            Self::DangerousComponent { .. } => PathErrorKind::DangerousComponent,
            Self::TooLong { .. } => PathErrorKind::TooLong,
            Self::OutsideBase { .. } => PathErrorKind::OutsideBase,
            Self::AbsoluteComponent { .. } => PathErrorKind::AbsoluteComponent,
            Self::NotFound { .. } => PathErrorKind::NotFound,
            Self::TooLarge { .. } => PathErrorKind::TooLarge,
            Self::AtomicWrite { .. } => PathErrorKind::AtomicWrite,
            Self::Io { .. } => PathErrorKind::Io,
        }
    }

    /// Failure-limiter category for errors that signal a boundary probe.
    pub fn failure_category(&self) -> Option<&'static str> {
        match self.kind() {
            PathErrorKind::Traversal
            | PathErrorKind::NullByte
            | PathErrorKind::DangerousComponent
            | PathErrorKind::OutsideBase
            | PathErrorKind::AbsoluteComponent => Some("path_traversal"),
            _ => None,
        }
    }
}

/// An absolute, traversal-free path, optionally constrained to a base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePath {
    path: PathBuf,
    base: Option<PathBuf>,
}

impl SecurePath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The resolved base this path was checked against, if any.
    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for SecurePath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl std::ops::Deref for SecurePath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

/// Validates paths and performs crash-safe writes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    pub(crate) config: PathConfig,
    pub(crate) audit: AuditSink,
}

impl PathGuard {
    pub fn new(config: PathConfig, audit: AuditSink) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &PathConfig {
        &self.config
    }

    /// Validate `path`, optionally requiring it to be a strict descendant of `base`.
    pub fn validate_safe_path(
        &self,
        path: impl AsRef<Path>,
        base: Option<&Path>,
    ) -> Result<SecurePath, PathError> {
        let path = path.as_ref();
        self.check(path, base).map_err(|e| self.report(path, e))
    }

    /// Join relative `parts` onto `base`, re-validating that the result stays inside it.
    pub fn secure_path_join<I, P>(&self, base: impl AsRef<Path>, parts: I) -> Result<SecurePath, PathError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let base = self.validate_safe_path(base.as_ref(), None)?;
        let mut joined = base.as_path().to_path_buf();
        for part in parts {
            let part = part.as_ref();
            self.check_join_part(part).map_err(|e| self.report(part, e))?;
            joined.push(part);
        }
        self.validate_safe_path(&joined, Some(base.as_path()))
    }

    fn check_join_part(&self, part: &Path) -> Result<(), PathError> {
        let raw = part.to_string_lossy();
        let has_drive = raw.len() >= 2
            && raw.as_bytes()[1] == b':'
            && raw.as_bytes()[0].is_ascii_alphabetic();
        if part.is_absolute() || raw.starts_with('/') || raw.starts_with('\\') || has_drive {
            return Err(PathError::AbsoluteComponent {
                component: preview(&raw, self.config.preview_length),
            });
        }
        self.scan_patterns(&raw)?;
        if part.components().any(|c| c == Component::ParentDir) {
            return Err(PathError::Traversal {
                preview: preview(&raw, self.config.preview_length),
            });
        }
        Ok(())
    }

    fn check(&self, path: &Path, base: Option<&Path>) -> Result<SecurePath, PathError> {
        let raw = path.to_string_lossy();
        if raw.len() > self.config.max_path_length {
            return Err(PathError::TooLong {
                length: raw.len(),
                max: self.config.max_path_length,
            });
        }
        self.scan_patterns(&raw)?;

        let cwd = std::env::current_dir().map_err(|source| PathError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        let resolved_base = base.map(|b| resolve(b, &cwd));
        let anchor = resolved_base.as_deref().unwrap_or(&cwd);
        let resolved = resolve(path, anchor);

        if resolved.as_os_str().len() > self.config.max_path_length {
            return Err(PathError::TooLong {
                length: resolved.as_os_str().len(),
                max: self.config.max_path_length,
            });
        }

        if let Some(base) = &resolved_base {
            if resolved == *base || !resolved.starts_with(base) {
                return Err(PathError::OutsideBase {
                    path: resolved,
                    base: base.clone(),
                });
            }
        }

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(PathError::Traversal {
                preview: preview(&raw, self.config.preview_length),
            });
        }

        for component in resolved.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if is_reserved_device_name(&name) {
                    return Err(PathError::DangerousComponent {
                        component: name.into_owned(),
                    });
                }
            }
        }

        Ok(SecurePath {
            path: resolved,
            base: resolved_base,
        })
    }

    /// Reject null-byte and encoded traversal sequences in raw and decoded forms.
    fn scan_patterns(&self, raw: &str) -> Result<(), PathError> {
        let lowered = raw.to_ascii_lowercase();
        let decoded = percent_decode_str(raw).decode_utf8_lossy().to_ascii_lowercase();

        for candidate in [&lowered, &decoded] {
            if NULL_BYTE_PATTERNS.iter().any(|p| candidate.contains(p)) {
                return Err(PathError::NullByte {
                    preview: preview(raw, self.config.preview_length),
                });
            }
            if ENCODED_TRAVERSAL_PATTERNS.iter().any(|p| candidate.contains(p)) {
                return Err(PathError::Traversal {
                    preview: preview(raw, self.config.preview_length),
                });
            }
        }
        if decoded != lowered && (decoded.contains("../") || decoded.contains("..\\")) {
            return Err(PathError::Traversal {
                preview: preview(raw, self.config.preview_length),
            });
        }
        Ok(())
    }

    pub(crate) fn report(&self, path: &Path, error: PathError) -> PathError {
        let kind = error.kind();
        metrics::record_path_violation(kind.as_str());
        self.audit.log_security_event(
            SecurityEventType::PathViolation,
            Severity::Warning,
            format!("Path rejected: {}", error),
            json!({
                "kind": kind.as_str(),
                "path": preview(&path.to_string_lossy(), self.config.preview_length),
            }),
        );
        error
    }
}

fn is_reserved_device_name(component: &str) -> bool {
    let stem = component.split('.').next().unwrap_or_default().trim_end();
    RESERVED_DEVICE_NAMES
        .iter()
        .any(|name| stem.eq_ignore_ascii_case(name))
}

/// Resolve to an absolute path: anchor relative input, fold `.`/`..` lexically,
/// then canonicalize the longest existing prefix so symlinks cannot hide an escape.
pub(crate) fn resolve(path: &Path, anchor: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        anchor.join(path)
    };
    canonicalize_existing_prefix(&normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(canonical) = ancestor.canonicalize() {
            return match path.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => canonical.join(rest),
                _ => canonical,
            };
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (PathGuard, AuditSink) {
        let audit = AuditSink::new(64, false);
        (PathGuard::new(PathConfig::default(), audit.clone()), audit)
    }

    #[test]
    fn plain_traversal_is_rejected() {
        let (guard, audit) = guard();
        let err = guard.validate_safe_path("../../../etc/passwd", None).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::Traversal);
        assert_eq!(audit.count(SecurityEventType::PathViolation), 1);
    }

    #[test]
    fn escaping_base_is_outside_base() {
        let (guard, _) = guard();
        let err = guard
            .validate_safe_path("a/../../b", Some(Path::new("/safe")))
            .unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::OutsideBase);
    }

    #[test]
    fn relative_path_under_base_resolves() {
        let (guard, _) = guard();
        let cwd = std::env::current_dir().unwrap();
        let secure = guard.validate_safe_path("sub/file.txt", Some(&cwd)).unwrap();
        assert!(secure.is_absolute());
        assert!(secure.ends_with("sub/file.txt"));
        assert!(secure.base().is_some());
    }

    #[test]
    fn base_itself_is_not_a_descendant() {
        let (guard, _) = guard();
        let dir = tempfile::tempdir().unwrap();
        let err = guard.validate_safe_path(dir.path(), Some(dir.path())).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::OutsideBase);
    }

    #[test]
    fn encoded_traversal_variants_are_rejected() {
        let (guard, _) = guard();
        for input in [
            "%2e%2e%2fetc/passwd",
            "..%2Fetc",
            "%252e%252e%252fetc",
            "..\\windows\\system32",
            "dir/%2E%2E%5Csecret",
            "%c0%ae%c0%ae/etc",
        ] {
            let err = guard.validate_safe_path(input, None).unwrap_err();
            assert_eq!(err.kind(), PathErrorKind::Traversal, "input {input}");
        }
    }

    #[test]
    fn null_byte_variants_are_rejected() {
        let (guard, _) = guard();
        for input in ["file\0.txt", "file%00.txt", "file%2500.txt", "file%c0%80.txt"] {
            let err = guard.validate_safe_path(input, None).unwrap_err();
            assert_eq!(err.kind(), PathErrorKind::NullByte, "input {input:?}");
        }
    }

    #[test]
    fn reserved_device_names_are_rejected_everywhere() {
        let (guard, _) = guard();
        let dir = tempfile::tempdir().unwrap();
        for name in ["CON", "nul.txt", "com3.log", "LPT1"] {
            let err = guard
                .validate_safe_path(dir.path().join(name), Some(dir.path()))
                .unwrap_err();
            assert_eq!(err.kind(), PathErrorKind::DangerousComponent, "name {name}");
        }
        assert!(guard
            .validate_safe_path(dir.path().join("console.txt"), Some(dir.path()))
            .is_ok());
    }

    #[test]
    fn overlong_path_is_rejected() {
        let audit = AuditSink::new(8, false);
        let guard = PathGuard::new(
            PathConfig {
                max_path_length: 32,
                ..PathConfig::default()
            },
            audit,
        );
        let err = guard.validate_safe_path("a".repeat(64), None).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::TooLong);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_outside_base() {
        let (guard, _) = guard();
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("link")).unwrap();

        let err = guard
            .validate_safe_path("link/secret.txt", Some(base.path()))
            .unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::OutsideBase);
    }

    #[test]
    fn join_stays_under_base() {
        let (guard, _) = guard();
        let base = tempfile::tempdir().unwrap();
        let joined = guard
            .secure_path_join(base.path(), ["reports", "today.json"])
            .unwrap();
        assert!(joined.ends_with("reports/today.json"));
        assert!(joined.starts_with(base.path().canonicalize().unwrap()));
    }

    #[test]
    fn join_rejects_absolute_and_traversal_parts() {
        let (guard, _) = guard();
        let base = tempfile::tempdir().unwrap();

        let err = guard.secure_path_join(base.path(), ["/etc/passwd"]).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::AbsoluteComponent);

        let err = guard.secure_path_join(base.path(), ["C:\\Windows"]).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::AbsoluteComponent);

        let err = guard.secure_path_join(base.path(), ["a", "../../x"]).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::Traversal);

        let err = guard.secure_path_join(base.path(), ["%2e%2e%2fx"]).unwrap_err();
        assert_eq!(err.kind(), PathErrorKind::Traversal);
    }
}
