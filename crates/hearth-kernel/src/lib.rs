//! # hearth-kernel
//!
//! The virtual filesystem, transfer engine and Rewind navigation of hearth.
//!
//! ```text
//!  caller ── LogicalPath ──► PathMapper ──► PathResolver ──► physical path
//!                              │ (aliases)      (containment)
//!                              ▼
//!   Files ── list/search/status/mkdir/rename/delete
//!     └── TransferEngine ── copy/move/trash/restore jobs ──► FlowBus<TransferFlow>
//!   RepositoryDetector / Timeline / RewindSession
//!   ChangeNotifier ── physical watch events ──► FlowBus<ChangeFlow>
//! ```
//!
//! Every failure is an [`FsError`] carrying exactly one
//! [`hearth_types::ErrorCode`].

pub mod config;
pub mod error;
pub mod favorites;
pub mod files;
pub mod flows;
pub mod kernel;
pub mod locks;
pub mod mapper;
pub mod notifier;
pub mod policy;
pub mod progress;
pub mod repository;
pub mod resolver;
pub mod timeline;
pub mod transfer;
pub mod trash;

pub use config::{ConfigError, HearthConfig, TransferConfig};
pub use error::{FsError, FsResult, IoOp};
pub use favorites::Favorites;
pub use files::{Files, ListingSettings};
pub use flows::{
    ChangeFlow, ChangeKind, Flow, FlowBus, FlowMessage, SharedChangeFlowBus,
    SharedTransferFlowBus, Subscription, TransferFlow, matches_pattern,
};
pub use kernel::{Hearth, KernelError, RewindView};
pub use locks::{LockConflict, PathLockGuard, PathLockSet};
pub use mapper::{AliasTable, PathMapper};
pub use notifier::{ChangeNotifier, ChangeNotifierHandle, NotifierError};
pub use policy::{AppRegistry, Policy, StaticApps};
pub use progress::{ProgressSample, ProgressTracker, parse_progress_line};
pub use repository::RepositoryDetector;
pub use resolver::PathResolver;
pub use timeline::{MountedSnapshotSource, RewindSession, SnapshotSource, Timeline, build_timeline};
pub use transfer::{TransferEngine, TransferRequest};
pub use trash::TrashStore;
