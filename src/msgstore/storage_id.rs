//! Storage identifier
//!
//! A storage is named by what it relates to (e.g. `msgUnitStore`, `history`)
//! and a postfix unique within that relation (typically the topic or session).

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Unique storage identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId {
    relating: String,
    postfix: String,
}

impl StorageId {
    /// Create a new storage id
    pub fn new(relating: impl Into<String>, postfix: impl Into<String>) -> Self {
        Self {
            relating: relating.into(),
            postfix: postfix.into(),
        }
    }

    /// What the storage relates to, e.g. `msgUnitStore`
    pub fn relating(&self) -> &str {
        &self.relating
    }

    /// The relation-specific part
    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    /// Full id `relating:postfix`
    pub fn id(&self) -> String {
        format!("{}:{}", self.relating, self.postfix)
    }

    /// Id with every character outside `[A-Za-z0-9_-]` replaced by `_`.
    ///
    /// Used for directory and file names.
    pub fn stripped_id(&self) -> String {
        self.id()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.relating, self.postfix)
    }
}

impl std::str::FromStr for StorageId {
    type Err = Error;

    /// Parse `relating:postfix`; the postfix may itself contain `:`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((relating, postfix)) if !relating.is_empty() && !postfix.is_empty() => {
                Ok(StorageId::new(relating, postfix))
            }
            _ => Err(Error::Config(format!(
                "storage id '{}' is not of the form relating:postfix",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_id_format() {
        let id = StorageId::new("msgUnitStore", "/node/heron/topic/hello");
        assert_eq!(id.id(), "msgUnitStore:/node/heron/topic/hello");
        assert_eq!(id.to_string(), id.id());
        assert_eq!(id.relating(), "msgUnitStore");
        assert_eq!(id.postfix(), "/node/heron/topic/hello");
    }

    #[test]
    fn test_stripped_id_is_filename_safe() {
        let id = StorageId::new("history", "node/a b:c");
        let stripped = id.stripped_id();
        assert_eq!(stripped, "history_node_a_b_c");
        assert!(!stripped.contains('/'));
    }

    #[test]
    fn test_parse() {
        let id: StorageId = "msgUnitStore:topic:a".parse().unwrap();
        assert_eq!(id.relating(), "msgUnitStore");
        assert_eq!(id.postfix(), "topic:a");
        assert!("nocolon".parse::<StorageId>().is_err());
        assert!(":x".parse::<StorageId>().is_err());
    }
}
