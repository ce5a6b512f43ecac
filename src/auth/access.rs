//! Access levels and the operation table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered privilege levels: `Public < Internal < Admin < Debug`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Public,
    Internal,
    Admin,
    Debug,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Admin => "admin",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "admin" => Ok(Self::Admin),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown access level: {other}")),
        }
    }
}

/// Minimum level for every known operation.
pub const OPERATION_LEVELS: &[(&str, AccessLevel)] = &[
    ("status", AccessLevel::Public),
    ("health", AccessLevel::Public),
    ("view_circuits", AccessLevel::Internal),
    ("view_operations", AccessLevel::Internal),
    ("view_connections", AccessLevel::Internal),
    ("channel_connect", AccessLevel::Internal),
    ("reset_circuit", AccessLevel::Admin),
    ("manage_api_keys", AccessLevel::Admin),
    ("view_audit", AccessLevel::Debug),
];

/// Level required for `operation`. Unknown operations require `Admin`.
pub fn required_level(operation: &str) -> AccessLevel {
    OPERATION_LEVELS
        .iter()
        .find(|(name, _)| *name == operation)
        .map(|(_, level)| *level)
        .unwrap_or(AccessLevel::Admin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(AccessLevel::Public < AccessLevel::Internal);
        assert!(AccessLevel::Internal < AccessLevel::Admin);
        assert!(AccessLevel::Admin < AccessLevel::Debug);
    }

    #[test]
    fn unknown_operation_requires_admin() {
        assert_eq!(required_level("status"), AccessLevel::Public);
        assert_eq!(required_level("view_audit"), AccessLevel::Debug);
        assert_eq!(required_level("drop_database"), AccessLevel::Admin);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Admin".parse::<AccessLevel>().unwrap(), AccessLevel::Admin);
        assert!("root".parse::<AccessLevel>().is_err());
    }
}
