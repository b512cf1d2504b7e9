//! Domain types shared across the Checkpoint crates.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed project identifier. Used as the lock name, the config
/// file stem and the `project` field of the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(pub String);

impl ProjectName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Retention category of an entry in the backup directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Database dumps under `<backup_dir>/databases/`.
    Database,
    /// Archived file versions and manifests.
    Files,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Database => write!(f, "database"),
            Category::Files => write!(f, "files"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ProjectName::from("api").to_string(), "api");
        assert_eq!(ProjectName::from(String::from("api")).as_str(), "api");
    }

    #[test]
    fn category_serializes_lowercase() {
        let yaml = serde_yaml::to_string(&Category::Database).expect("serialize");
        assert_eq!(yaml.trim(), "database");
        assert_eq!(Category::Files.to_string(), "files");
    }
}
