//! Listing and status types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::path::LogicalPath;

/// Operations a caller may perform on a path.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FileOperation {
    Copy,
    Move,
    Rename,
    Trash,
    Restore,
    Delete,
    Favorite,
    Archive,
    Extract,
    Share,
    /// New items may be created inside this directory.
    Writable,
}

impl FileOperation {
    pub fn all() -> BTreeSet<FileOperation> {
        Self::iter().collect()
    }
}

/// What kind of filesystem object an item is. Symlinks are reported as
/// themselves, never followed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

/// One entry as shown to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemItem {
    pub path: LogicalPath,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Best-effort MIME type for regular files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes; directories report 0.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_at: u64,
    pub allowed_operations: BTreeSet<FileOperation>,
}

impl FileSystemItem {
    pub fn allows(&self, op: FileOperation) -> bool {
        self.allowed_operations.contains(&op)
    }
}

/// A directory together with (a bounded prefix of) its entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    #[serde(flatten)]
    pub directory: FileSystemItem,
    pub files: Vec<FileSystemItem>,
    /// Set when the listing stopped early at this many entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_serialize_kebab() {
        assert_eq!(FileOperation::Writable.to_string(), "writable");
        let json = serde_json::to_string(&FileOperation::Extract).unwrap();
        assert_eq!(json, "\"extract\"");
        assert_eq!(FileOperation::all().len(), 11);
    }

    #[test]
    fn item_wire_shape() {
        let item = FileSystemItem {
            path: LogicalPath::parse("/Home/a.txt").unwrap(),
            name: "a.txt".into(),
            kind: FileKind::File,
            mime_type: Some("text/plain".into()),
            size: 3,
            modified_at: 1000,
            allowed_operations: [FileOperation::Copy].into_iter().collect(),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["modifiedAt"], 1000);
        assert_eq!(value["allowedOperations"][0], "copy");
    }
}
