//! Argument vector validation and executable policy.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::{CommandError, CommandGuard};

struct DangerousPattern {
    name: &'static str,
    regex: Regex,
}

fn pattern(name: &'static str, re: &str) -> Option<DangerousPattern> {
    match Regex::new(re) {
        Ok(regex) => Some(DangerousPattern { name, regex }),
        Err(e) => {
            tracing::error!(pattern = name, error = %e, "Invalid dangerous pattern");
            None
        }
    }
}

static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    [
        pattern("command separator", r";"),
        pattern("logical and", r"&&"),
        pattern("pipe", r"\|"),
        pattern("backtick", r"`"),
        pattern("command substitution", r"\$\("),
        pattern("variable expansion", r"\$\{"),
        pattern("subshell", r"[()]"),
        pattern("redirect to absolute path", r"(>>?|<)\s*/"),
        pattern("parent traversal", r"(^|\s)\.\./"),
    ]
    .into_iter()
    .flatten()
    .collect()
});

const SUBSHELL: &str = "subshell";

static GIT_REVISION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(@\{(u|upstream|push|\d+)\}|HEAD@\{\d+\}|@\{(u|upstream)\}\.\.\.?HEAD|HEAD\.\.\.?@\{(u|upstream)\})$",
    )
    .ok()
});

fn is_git_revision(arg: &str) -> bool {
    GIT_REVISION.as_ref().is_some_and(|re| re.is_match(arg))
}

/// An argv that passed every structural and policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    args: Vec<String>,
    executable: PathBuf,
    basename: String,
}

impl ValidatedCommand {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Resolved path of `args[0]`.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Space-joined argv, for logs.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }
}

impl CommandGuard {
    /// Validate an argument vector without running it.
    pub fn validate_command<S: AsRef<str>>(&self, args: &[S]) -> Result<ValidatedCommand, CommandError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let joined = args.join(" ");
        self.check_command(&args)
            .map_err(|e| self.reject(&joined, e))
    }

    fn check_command(&self, args: &[String]) -> Result<ValidatedCommand, CommandError> {
        let Some(program) = args.first().filter(|p| !p.is_empty()) else {
            return Err(CommandError::Empty);
        };

        let length: usize = args.iter().map(|a| a.chars().count()).sum();
        if length > self.config.max_command_length {
            return Err(CommandError::TooLong {
                length,
                max: self.config.max_command_length,
            });
        }
        for (index, arg) in args.iter().enumerate() {
            let length = arg.chars().count();
            if length > self.config.max_arg_length {
                return Err(CommandError::ArgTooLong {
                    index,
                    length,
                    max: self.config.max_arg_length,
                });
            }
        }

        let name = basename(program);
        for (index, arg) in args.iter().enumerate() {
            if is_git_revision(arg) {
                continue;
            }
            let allow_parens = is_commit_message(&name, args, index);
            let subject = if allow_parens {
                arg.strip_prefix("--message=").unwrap_or(arg)
            } else {
                arg.as_str()
            };
            for p in DANGEROUS_PATTERNS.iter() {
                if allow_parens && p.name == SUBSHELL {
                    continue;
                }
                if p.regex.is_match(subject) {
                    return Err(CommandError::DangerousPattern {
                        index,
                        pattern: p.name,
                    });
                }
            }
        }

        let blocked = &self.config.blocked_executables;
        if blocked.contains(&name) {
            return Err(CommandError::ExecutableBlocked { name });
        }
        if let Some(allowed) = &self.config.allowed_executables {
            if !allowed.contains(&name) {
                return Err(CommandError::ExecutableNotAllowed { name });
            }
        }

        let executable = resolve_executable(program).ok_or_else(|| {
            CommandError::ExecutableNotFound {
                name: program.clone(),
            }
        })?;
        // A symlink named `build` may still point at `dd`.
        let resolved_name = executable
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if let Some(resolved_name) = resolved_name.filter(|n| blocked.contains(n)) {
            return Err(CommandError::ExecutableBlocked {
                name: resolved_name,
            });
        }

        Ok(ValidatedCommand {
            args: args.to_vec(),
            executable,
            basename: name,
        })
    }
}

fn basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// `git commit -m <msg>`, `--message <msg>` or `--message=<msg>`.
fn is_commit_message(program: &str, args: &[String], index: usize) -> bool {
    if program != "git" || !args.iter().any(|a| a == "commit") {
        return false;
    }
    if args[index].starts_with("--message=") {
        return true;
    }
    index > 0 && matches!(args[index - 1].as_str(), "-m" | "--message")
}

/// Resolve `program` to an executable file: as given when it contains a
/// separator, otherwise by searching `PATH`.
fn resolve_executable(program: &str) -> Option<PathBuf> {
    if program.contains('/') || program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
