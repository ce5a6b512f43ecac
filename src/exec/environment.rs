use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{CommandError, CommandGuard};

/// Keys that let a caller inject code into the child or its interpreter.
const DANGEROUS_KEYS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYLIB",
    "RUBYOPT",
    "NODE_OPTIONS",
    "BASH_ENV",
    "ENV",
    "IFS",
    "PS4",
    "PROMPT_COMMAND",
    "SHELLOPTS",
    "BASHOPTS",
    "CDPATH",
    "GLOBIGNORE",
];

const DANGEROUS_KEY_PREFIXES: &[&str] = &["DYLD_"];

/// Re-added from the parent environment when the caller omitted them.
const SAFE_INHERITED: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "TMPDIR", "TZ",
];

static VALUE_INJECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\(|`|&&|\|\||;\s*[A-Za-z_./]|[\r\n]").ok());

fn is_dangerous_key(key: &str) -> bool {
    DANGEROUS_KEYS.contains(&key) || DANGEROUS_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn has_injection(value: &str) -> bool {
    // Without the pattern every value is suspect.
    VALUE_INJECTION.as_ref().map_or(true, |re| re.is_match(value))
}

impl CommandGuard {
    /// Strip injection vectors from a caller-supplied environment.
    ///
    /// Only an oversized map is an error; individual offending entries are
    /// dropped with a warning. Safe variables are then re-added from the
    /// parent environment when absent.
    pub fn sanitize_environment(
        &self,
        env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, CommandError> {
        if env.len() > self.config.max_env_vars {
            let error = CommandError::Environment {
                reason: format!(
                    "{} variables exceeds maximum {}",
                    env.len(),
                    self.config.max_env_vars
                ),
            };
            return Err(self.reject("environment", error));
        }

        let mut sanitized = HashMap::with_capacity(env.len());
        for (key, value) in env {
            if is_dangerous_key(key) {
                tracing::warn!(key = %key, "Dropping dangerous environment variable");
                continue;
            }
            if value.chars().count() > self.config.max_env_value_length {
                tracing::warn!(key = %key, length = value.len(), "Dropping oversized environment value");
                continue;
            }
            if has_injection(value) {
                tracing::warn!(key = %key, "Dropping environment value with injection pattern");
                continue;
            }
            sanitized.insert(key.clone(), value.clone());
        }

        for key in SAFE_INHERITED {
            if sanitized.contains_key(*key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                sanitized.insert(key.to_string(), value);
            }
        }

        Ok(sanitized)
    }
}
