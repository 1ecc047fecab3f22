//! Shared types for the hearth file subsystem.
//!
//! This crate has **no internal hearth dependencies**; it is a pure leaf crate
//! that the kernel, the daemon and API adapters build on.
//!
//! # Overview
//!
//! ```text
//! LogicalPath ("/Home/Photos/a.jpg")  ← what callers and the UI see
//!     └── FileSystemItem (listing entry + allowed operations)
//!     └── TransferJob (copy/move/trash/restore, progress)
//!
//! Repository ("/External/usb/Hearth Backup.backup")
//!     └── RepositoryCandidate (detection tri-state)
//!     └── Snapshot timeline (ascending, `current` last)
//!
//! ErrorCode  ← closed failure vocabulary, `[code]` only on the wire
//! ```

pub mod error;
pub mod ids;
pub mod item;
pub mod path;
pub mod snapshot;
pub mod transfer;

pub use error::{ErrorClass, ErrorCode, WireError};
pub use ids::JobId;
pub use item::{DirectoryListing, FileKind, FileOperation, FileSystemItem};
pub use path::{LogicalPath, normalize_posix};
pub use snapshot::{
    BackupId, Repository, RepositoryCandidate, RepositoryStatus, Snapshot, SnapshotId,
};
pub use transfer::{
    Collision, LockWait, TransferJob, TransferKind, TransferProgress, TransferState,
};
