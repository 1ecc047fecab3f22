//! Transfer job types.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::WireError;
use crate::ids::JobId;
use crate::path::LogicalPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferKind {
    Copy,
    Move,
    Trash,
    Restore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferState {
    /// Waiting for path locks.
    #[default]
    Queued,
    Running,
    Cancelled,
    Failed,
    Done,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Done)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// What to do when the destination name is already taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Collision {
    /// Fail with `destination-already-exists`.
    #[default]
    Error,
    /// Pick `name (1)`, `name (2)`, … instead.
    KeepBoth,
    /// Remove the existing destination first.
    Replace,
}

/// What a second job touching a locked path does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockWait {
    /// Stay `queued` until the conflicting job releases its locks.
    #[default]
    Queue,
    /// Fail immediately with `in-progress`.
    FailFast,
}

/// Live progress of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// 0–100, never decreasing for a given job.
    pub percent: u8,
    pub bytes_per_second: u64,
    /// `None` while the rate is zero or unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u64>,
}

impl TransferProgress {
    pub fn complete() -> Self {
        Self {
            percent: 100,
            bytes_per_second: 0,
            seconds_remaining: Some(0),
        }
    }
}

/// A copy/move/trash/restore job as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: JobId,
    pub kind: TransferKind,
    pub source_paths: Vec<LogicalPath>,
    /// Destination directory.
    pub destination: LogicalPath,
    pub state: TransferState,
    #[serde(flatten)]
    pub progress: TransferProgress,
    /// Final logical path of each transferred source, in source order.
    #[serde(default)]
    pub results: Vec<LogicalPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl TransferJob {
    pub fn new(kind: TransferKind, source_paths: Vec<LogicalPath>, destination: LogicalPath) -> Self {
        Self {
            id: JobId::new(),
            kind,
            source_paths,
            destination,
            state: TransferState::Queued,
            progress: TransferProgress::default(),
            results: Vec::new(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_wire_shape_is_flat() {
        let job = TransferJob::new(
            TransferKind::Copy,
            vec![LogicalPath::parse("/Home/a").unwrap()],
            LogicalPath::parse("/Home/b").unwrap(),
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["state"], "queued");
        assert_eq!(value["percent"], 0);
        assert_eq!(value["bytesPerSecond"], 0);
        assert!(value.get("secondsRemaining").is_none());
        assert_eq!(value["sourcePaths"][0], "/Home/a");
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Done.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(TransferState::Queued.is_active());
        assert_eq!("keep-both".parse::<Collision>().unwrap(), Collision::KeepBoth);
    }
}
