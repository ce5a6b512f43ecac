use std::path::{Component, Path, PathBuf};

use super::{CommandError, CommandGuard};

const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/usr/lib", "/boot", "/dev", "/proc",
    "/sys", "/System",
];

fn is_system_dir(path: &Path) -> bool {
    SYSTEM_DIRS.iter().any(|dir| {
        let mirrored = PathBuf::from("/private").join(dir.trim_start_matches('/'));
        path.starts_with(dir) || path.starts_with(&mirrored)
    })
}

impl CommandGuard {
    /// Resolve and vet a working directory for a child process.
    pub fn validate_cwd(&self, path: impl AsRef<Path>) -> Result<PathBuf, CommandError> {
        let path = path.as_ref();
        self.check_cwd(path)
            .map_err(|e| self.reject(&path.to_string_lossy(), e))
    }

    fn check_cwd(&self, path: &Path) -> Result<PathBuf, CommandError> {
        let fail = |reason: &str| CommandError::Cwd {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let resolved = path
            .canonicalize()
            .map_err(|_| fail("directory does not exist"))?;
        if !resolved.is_dir() {
            return Err(fail("not a directory"));
        }

        if self.config.validate_cwd {
            if is_system_dir(&resolved) {
                return Err(fail("system directory"));
            }

            if path.components().any(|c| c == Component::ParentDir) {
                let cwd = std::env::current_dir()
                    .and_then(|d| d.canonicalize())
                    .map_err(|_| fail("process working directory is unavailable"))?;
                let safe_root = cwd.parent().map(Path::to_path_buf).unwrap_or(cwd);
                if !resolved.starts_with(&safe_root) {
                    return Err(fail("parent traversal leaves the safe root"));
                }
            }
        }

        if let Some(base) = &self.config.cwd_base {
            let base = base
                .canonicalize()
                .map_err(|_| fail("configured cwd base does not exist"))?;
            if resolved != base {
                self.paths
                    .validate_safe_path(&resolved, Some(&base))
                    .map_err(|e| fail(&e.to_string()))?;
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, PathConfig};
    use crate::exec::CommandErrorKind;
    use crate::fs::PathGuard;
    use crate::observability::AuditSink;

    fn guard_with(config: CommandConfig) -> CommandGuard {
        let audit = AuditSink::new(32, false);
        CommandGuard::new(config, PathGuard::new(PathConfig::default(), audit.clone()), audit)
    }

    #[test]
    fn ordinary_directory_is_accepted() {
        let guard = guard_with(CommandConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let resolved = guard.validate_cwd(dir.path()).unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn system_directories_are_rejected() {
        let guard = guard_with(CommandConfig::default());
        for dir in ["/etc", "/usr/bin", "/proc/self"] {
            if Path::new(dir).exists() {
                let err = guard.validate_cwd(dir).unwrap_err();
                assert_eq!(err.kind(), CommandErrorKind::Cwd, "dir {dir}");
            }
        }
    }

    #[test]
    fn validation_can_be_disabled() {
        let guard = guard_with(CommandConfig {
            validate_cwd: false,
            ..CommandConfig::default()
        });
        if Path::new("/etc").is_dir() {
            assert!(guard.validate_cwd("/etc").is_ok());
        }
    }

    #[test]
    fn missing_directory_is_rejected() {
        let guard = guard_with(CommandConfig::default());
        let err = guard.validate_cwd("/definitely/not/here").unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::Cwd);
    }

    #[test]
    fn file_is_not_a_directory() {
        let guard = guard_with(CommandConfig::default());
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = guard.validate_cwd(file.path()).unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::Cwd);
    }

    #[test]
    fn cwd_base_confines_working_directory() {
        let base = tempfile::tempdir().unwrap();
        let inside = base.path().join("project");
        std::fs::create_dir(&inside).unwrap();
        let outside = tempfile::tempdir().unwrap();

        let guard = guard_with(CommandConfig {
            cwd_base: Some(base.path().to_path_buf()),
            ..CommandConfig::default()
        });
        assert!(guard.validate_cwd(&inside).is_ok());
        assert!(guard.validate_cwd(base.path()).is_ok());
        let err = guard.validate_cwd(outside.path()).unwrap_err();
        assert_eq!(err.kind(), CommandErrorKind::Cwd);
    }

    #[test]
    fn parent_segments_must_stay_under_safe_root() {
        let guard = guard_with(CommandConfig::default());
        let cwd = std::env::current_dir().unwrap();
        let depth = cwd.components().count();
        let escape: PathBuf = std::iter::repeat("..").take(depth + 1).collect();
        let safe_root = cwd.parent().unwrap_or(&cwd).to_path_buf();
        if let Ok(resolved) = escape.canonicalize() {
            if !is_system_dir(&resolved) && !resolved.starts_with(&safe_root) {
                let err = guard.validate_cwd(&escape).unwrap_err();
                assert_eq!(err.kind(), CommandErrorKind::Cwd);
            }
        }
        assert!(guard.validate_cwd("..").is_ok() || cwd.parent().is_none());
    }
}
