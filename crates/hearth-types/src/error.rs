//! The closed error-code taxonomy.
//!
//! Every failure the file subsystem reports to a caller is one of these codes.
//! Inside the process errors are typed enums; the bracketed `[code] message`
//! string exists only at the wire boundary, produced by [`WireError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Stable, closed set of failure codes.
///
/// The kebab-case string form (`escapes-base`, `subdir-of-self`, …) is the
/// wire discriminant and never changes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    // security
    EscapesBase,
    InvalidPath,
    PathNotAbsolute,
    InvalidBase,
    BaseDirectoryNotFound,
    CantFindRoot,

    // conflict
    DestinationAlreadyExists,
    UniqueNameIndexExceeded,
    SubdirOfSelf,
    InProgress,
    ShareAlreadyExists,

    // not found
    DoesNotExist,
    SourceNotExists,
    DestinationNotExist,
    ParentNotExist,
    ParentNotDirectory,
    NotFound,

    // capacity
    NotEnoughSpace,

    // policy
    OperationNotAllowed,
    InvalidFilename,

    // integrity
    TrashMetaNotExists,
    MkdirFailed,
    MoveFailed,
    CopyFailed,
    TransferCancelled,
}

/// Coarse classification of an [`ErrorCode`], driving propagation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Security,
    Conflict,
    NotFound,
    Capacity,
    Policy,
    Integrity,
}

impl ErrorCode {
    /// The wire discriminant, e.g. `"escapes-base"`.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Which class of failure this code belongs to.
    pub fn class(&self) -> ErrorClass {
        use ErrorCode::*;
        match self {
            EscapesBase | InvalidPath | PathNotAbsolute | InvalidBase | BaseDirectoryNotFound
            | CantFindRoot => ErrorClass::Security,
            DestinationAlreadyExists | UniqueNameIndexExceeded | SubdirOfSelf | InProgress
            | ShareAlreadyExists => ErrorClass::Conflict,
            DoesNotExist | SourceNotExists | DestinationNotExist | ParentNotExist
            | ParentNotDirectory | NotFound => ErrorClass::NotFound,
            NotEnoughSpace => ErrorClass::Capacity,
            OperationNotAllowed | InvalidFilename => ErrorClass::Policy,
            TrashMetaNotExists | MkdirFailed | MoveFailed | CopyFailed | TransferCancelled => {
                ErrorClass::Integrity
            }
        }
    }

    /// Security and policy failures are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Security | ErrorClass::Policy)
    }

    /// The single canonical user-facing message for this code.
    pub fn message(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            EscapesBase => "The path points outside of its storage location.",
            InvalidPath => "The path is not valid.",
            PathNotAbsolute => "The path must start with a slash.",
            InvalidBase => "The path does not belong to a known storage location.",
            BaseDirectoryNotFound => "The storage location could not be found.",
            CantFindRoot => "The path could not be validated because no part of it exists.",
            DestinationAlreadyExists => "An item with this name already exists in the destination.",
            UniqueNameIndexExceeded => "Could not find a free name for the item.",
            SubdirOfSelf => "A folder cannot be copied or moved into itself.",
            InProgress => "Another operation is already working on this item.",
            ShareAlreadyExists => "This folder is already shared.",
            DoesNotExist => "The item does not exist.",
            SourceNotExists => "The item to transfer does not exist.",
            DestinationNotExist => "The destination folder does not exist.",
            ParentNotExist => "The containing folder does not exist.",
            ParentNotDirectory => "The containing path is not a folder.",
            NotFound => "The requested item could not be found.",
            NotEnoughSpace => "There is not enough free space at the destination.",
            OperationNotAllowed => "This operation is not allowed here.",
            InvalidFilename => "The name contains characters that are not allowed.",
            TrashMetaNotExists => "The original location of this item is unknown.",
            MkdirFailed => "The folder could not be created.",
            MoveFailed => "The item could not be moved.",
            CopyFailed => "The item could not be copied.",
            TransferCancelled => "The transfer was cancelled.",
        }
    }

    /// Find the first bracketed code (`[escapes-base]`) inside a message.
    pub fn from_bracketed(message: &str) -> Option<Self> {
        let mut rest = message;
        while let Some(open) = rest.find('[') {
            let after = &rest[open + 1..];
            let Some(close) = after.find(']') else {
                return None;
            };
            if let Ok(code) = after[..close].parse::<ErrorCode>() {
                return Some(code);
            }
            rest = &after[close + 1..];
        }
        None
    }

    /// Map an arbitrary error message to its canonical text.
    ///
    /// Messages without a known bracketed code are returned unchanged so the
    /// UI always has something to show.
    pub fn describe(message: &str) -> String {
        match Self::from_bracketed(message) {
            Some(code) => code.message().to_string(),
            None => message.to_string(),
        }
    }

    /// Iterate every code in declaration order.
    pub fn all() -> impl Iterator<Item = ErrorCode> {
        Self::iter()
    }
}

impl std::error::Error for ErrorCode {}

/// The serialized shape of a failure crossing the subsystem boundary.
///
/// Only the code and its canonical message are carried; diagnostic detail
/// such as subprocess stderr stays server-side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<ErrorCode> for WireError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}
