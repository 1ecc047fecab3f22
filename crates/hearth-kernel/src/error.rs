//! Kernel error type.
//!
//! Every kernel operation returns [`FsError`]. Each variant resolves to one
//! [`ErrorCode`] via [`FsError::code`]; raw OS errors are classified on
//! construction so nothing downstream has to inspect errno text.

use std::io;
use std::path::PathBuf;

use hearth_types::{ErrorCode, WireError};
use thiserror::Error;

/// Which kind of filesystem step produced an I/O error.
///
/// Decides what "not found" and the catch-all code mean for that step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Reading metadata or listing.
    Stat,
    /// Creating a directory.
    Mkdir,
    /// Renaming or moving.
    Move,
    /// Copying or writing.
    Copy,
    /// Reading trash metadata.
    TrashMeta,
}

impl IoOp {
    fn not_found(self) -> ErrorCode {
        match self {
            IoOp::Stat => ErrorCode::DoesNotExist,
            IoOp::Mkdir => ErrorCode::ParentNotExist,
            IoOp::Move | IoOp::Copy => ErrorCode::SourceNotExists,
            IoOp::TrashMeta => ErrorCode::TrashMetaNotExists,
        }
    }

    fn fallback(self) -> ErrorCode {
        match self {
            IoOp::Stat => ErrorCode::InvalidPath,
            IoOp::Mkdir => ErrorCode::MkdirFailed,
            IoOp::Move => ErrorCode::MoveFailed,
            IoOp::Copy => ErrorCode::CopyFailed,
            IoOp::TrashMeta => ErrorCode::TrashMetaNotExists,
        }
    }
}

/// Classify a raw OS error message. Matches errno names as well as the
/// human-readable strings that filesystem libraries produce.
pub fn classify_os_message(message: &str, op: IoOp) -> Option<ErrorCode> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("eexist")
        || lower.contains("dest already exists")
        || lower.contains("file exists")
        || lower.contains("already exists")
    {
        return Some(ErrorCode::DestinationAlreadyExists);
    }
    if lower.contains("subdirectory of itself") || (op == IoOp::Move && lower.contains("einval")) {
        return Some(ErrorCode::SubdirOfSelf);
    }
    if lower.contains("enotdir") || lower.contains("not a directory") {
        return Some(ErrorCode::ParentNotDirectory);
    }
    if lower.contains("enospc") || lower.contains("no space left") {
        return Some(ErrorCode::NotEnoughSpace);
    }
    if lower.contains("enoent") || lower.contains("no such file") {
        return Some(op.not_found());
    }
    None
}

/// Map an `io::Error` to the taxonomy.
pub fn classify_io(err: &io::Error, op: IoOp) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::AlreadyExists => ErrorCode::DestinationAlreadyExists,
        io::ErrorKind::NotFound => op.not_found(),
        io::ErrorKind::NotADirectory => ErrorCode::ParentNotDirectory,
        io::ErrorKind::StorageFull => ErrorCode::NotEnoughSpace,
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            ErrorCode::OperationNotAllowed
        }
        io::ErrorKind::InvalidInput if op == IoOp::Move => ErrorCode::SubdirOfSelf,
        _ => classify_os_message(&err.to_string(), op).unwrap_or_else(|| op.fallback()),
    }
}

/// Kernel error.
#[derive(Debug, Error)]
pub enum FsError {
    /// A resolved path left its declared base.
    #[error("[escapes-base] '{target}' escapes '{}'{}", base.display(), if *canonical { " (symlink)" } else { "" })]
    EscapesBase {
        target: String,
        base: PathBuf,
        /// True when the escape was only visible after resolving symlinks.
        canonical: bool,
    },

    /// A taxonomy failure with free-form diagnostic detail.
    #[error("[{code}] {detail}")]
    Coded { code: ErrorCode, detail: String },

    /// An OS error, already classified.
    #[error("[{code}] {context}: {source}")]
    Io {
        code: ErrorCode,
        context: String,
        #[source]
        source: io::Error,
    },

    /// The copy program exited unsuccessfully.
    #[error("[{code}] {program} exited with {status}: {stderr}")]
    Subprocess {
        code: ErrorCode,
        program: String,
        status: String,
        stderr: String,
    },
}

impl FsError {
    /// Create a coded error with no extra detail.
    pub fn code_only(code: ErrorCode) -> Self {
        Self::Coded {
            code,
            detail: String::new(),
        }
    }

    /// Create a coded error with diagnostic detail.
    pub fn coded(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Coded {
            code,
            detail: detail.into(),
        }
    }

    /// Classify and wrap an I/O error.
    pub fn from_io(source: io::Error, op: IoOp, context: impl Into<String>) -> Self {
        Self::Io {
            code: classify_io(&source, op),
            context: context.into(),
            source,
        }
    }

    /// The taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            FsError::EscapesBase { .. } => ErrorCode::EscapesBase,
            FsError::Coded { code, .. } => *code,
            FsError::Io { code, .. } => *code,
            FsError::Subprocess { code, .. } => *code,
        }
    }

    /// The caller-facing form: code plus canonical message, no OS text.
    pub fn to_wire(&self) -> WireError {
        WireError::from(self.code())
    }
}

impl From<ErrorCode> for FsError {
    fn from(code: ErrorCode) -> Self {
        Self::code_only(code)
    }
}

/// Kernel result type.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_already_exists_message_is_normalized() {
        let raw = io::Error::other("dest already exists.");
        let err = FsError::from_io(raw, IoOp::Move, "moving a.txt");
        assert_eq!(err.code(), ErrorCode::DestinationAlreadyExists);

        let wire = err.to_wire();
        assert_eq!(wire.code, ErrorCode::DestinationAlreadyExists);
        assert!(!wire.message.contains("dest already exists"));
        assert!(wire.to_string().starts_with("[destination-already-exists]"));
    }

    #[test]
    fn kinds_map_per_operation() {
        let nf = || io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(classify_io(&nf(), IoOp::Mkdir), ErrorCode::ParentNotExist);
        assert_eq!(classify_io(&nf(), IoOp::Move), ErrorCode::SourceNotExists);
        assert_eq!(classify_io(&nf(), IoOp::TrashMeta), ErrorCode::TrashMetaNotExists);
        assert_eq!(
            classify_io(&io::Error::from(io::ErrorKind::AlreadyExists), IoOp::Copy),
            ErrorCode::DestinationAlreadyExists
        );
        assert_eq!(
            classify_io(&io::Error::from(io::ErrorKind::NotADirectory), IoOp::Mkdir),
            ErrorCode::ParentNotDirectory
        );
    }

    #[test]
    fn unknown_messages_fall_back_per_operation() {
        let odd = || io::Error::other("EIO: something odd");
        assert_eq!(classify_io(&odd(), IoOp::Mkdir), ErrorCode::MkdirFailed);
        assert_eq!(classify_io(&odd(), IoOp::Move), ErrorCode::MoveFailed);
        assert_eq!(
            classify_os_message("Cannot move 'a' to a subdirectory of itself, 'a/b'", IoOp::Move),
            Some(ErrorCode::SubdirOfSelf)
        );
        assert_eq!(
            classify_os_message("ENOTDIR: not a directory, mkdir", IoOp::Mkdir),
            Some(ErrorCode::ParentNotDirectory)
        );
    }

    #[test]
    fn escapes_base_display() {
        let err = FsError::EscapesBase {
            target: "../../etc".into(),
            base: PathBuf::from("/data/home"),
            canonical: false,
        };
        assert_eq!(err.code(), ErrorCode::EscapesBase);
        assert!(err.to_string().starts_with("[escapes-base]"));
    }
}
