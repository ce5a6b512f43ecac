//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GuardConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GuardConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GuardConfig, ConfigError> {
    let config: GuardConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessLevel;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.channel.max_connections_per_ip, 10);
        assert!(config.auth.local_only);
        assert!(config.command.blocked_executables.contains("sudo"));
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = parse_config(
            r#"
            [auth]
            local_only = false
            default_access_level = "internal"

            [governor.operations.lint]
            max_concurrent = 2
            circuit_breaker_threshold = 3

            [failure_limits.categories.sql_injection]
            max_failures = 2
            window_secs = 120
            block_secs = 3600
            "#,
        )
        .unwrap();

        assert!(!config.auth.local_only);
        assert_eq!(config.auth.default_access_level, AccessLevel::Internal);
        let lint = config.governor.limits_for("lint");
        assert_eq!(lint.max_concurrent, 2);
        assert_eq!(lint.circuit_breaker_threshold, 3);
        assert_eq!(lint.max_per_minute, 60);
        assert_eq!(config.governor.limits_for("other").max_concurrent, 10);
        assert_eq!(config.failure_limits.limit_for("sql_injection").block_secs, 3600);
        assert_eq!(config.failure_limits.limit_for("path_traversal").max_failures, 5);
    }

    #[test]
    fn configured_categories_override_only_their_own_entry() {
        let config = parse_config(
            r#"
            [failure_limits.categories.authentication]
            max_failures = 20
            window_secs = 60
            block_secs = 60
            "#,
        )
        .unwrap();

        let limits = &config.failure_limits;
        assert_eq!(limits.limit_for("authentication").max_failures, 20);
        assert_eq!(limits.limit_for("command_injection").block_secs, 1_800);
        assert_eq!(limits.limit_for("path_traversal").block_secs, 900);
        assert_eq!(limits.limit_for("unlisted").max_failures, 10);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = parse_config(
            r#"
            [channel]
            max_connections = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("channel.max_connections"));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = parse_config("[auth\nlocal_only = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
