//! Backup repository and snapshot types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::LogicalPath;

/// Identifies a recovery point. `Current` is the live filesystem.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SnapshotId {
    Current,
    Id(String),
}

impl SnapshotId {
    pub const CURRENT: &'static str = "current";

    pub fn is_current(&self) -> bool {
        matches!(self, Self::Current)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Current => Self::CURRENT,
            Self::Id(id) => id,
        }
    }
}

impl From<String> for SnapshotId {
    fn from(value: String) -> Self {
        if value == Self::CURRENT {
            Self::Current
        } else {
            Self::Id(value)
        }
    }
}

impl From<&str> for SnapshotId {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.as_str())
    }
}

/// A recovery point on a timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, time: i64) -> Self {
        Self {
            id: SnapshotId::Id(id.into()),
            time,
        }
    }

    /// The trailing "now" marker.
    pub fn current(time: i64) -> Self {
        Self {
            id: SnapshotId::Current,
            time,
        }
    }
}

/// Composite backup id in the form `<repository>:<snapshot>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackupId {
    pub repository: String,
    pub snapshot: String,
}

impl BackupId {
    pub fn parse(raw: &str) -> Option<Self> {
        let (repository, snapshot) = raw.split_once(':')?;
        if repository.is_empty() || snapshot.is_empty() {
            return None;
        }
        Some(Self {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
        })
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.snapshot)
    }
}

/// A repository registered with this machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    /// Logical path of the repository directory (including the marker name).
    pub path: LogicalPath,
}

/// Tri-state result of repository detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepositoryStatus {
    None,
    ExistsNotConfigured,
    AlreadyConfigured,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryCandidate {
    pub folder: LogicalPath,
    /// Where the repository would live; absent when nothing was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_path: Option<LogicalPath>,
    pub status: RepositoryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_sentinel_roundtrip() {
        let id: SnapshotId = "current".into();
        assert!(id.is_current());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"current\"");
        let other: SnapshotId = serde_json::from_str("\"k1a2b3\"").unwrap();
        assert_eq!(other, SnapshotId::Id("k1a2b3".into()));
    }

    #[test]
    fn backup_id_parse() {
        let id = BackupId::parse("repo1:snapA").unwrap();
        assert_eq!(id.repository, "repo1");
        assert_eq!(id.snapshot, "snapA");
        assert_eq!(id.to_string(), "repo1:snapA");
        assert!(BackupId::parse("no-colon").is_none());
        assert!(BackupId::parse(":x").is_none());
    }

    #[test]
    fn status_wire_strings() {
        assert_eq!(
            serde_json::to_string(&RepositoryStatus::ExistsNotConfigured).unwrap(),
            "\"exists-not-configured\""
        );
        assert_eq!(serde_json::to_string(&RepositoryStatus::None).unwrap(), "\"none\"");
    }
}
