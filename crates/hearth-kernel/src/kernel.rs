//! The Hearth facade: one value wiring every component from a config.
//!
//! The facade owns the live mapper, which is never aliased. Rewind browsing
//! happens on forked mappers handed out by [`Hearth::rewind`], so the change
//! notifier and the default [`Files`] always see live data.

use std::sync::Arc;

use hearth_types::LogicalPath;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, HearthConfig};
use crate::error::{FsError, FsResult, IoOp};
use crate::favorites::Favorites;
use crate::files::{Files, ListingSettings};
use crate::flows::{
    SharedChangeFlowBus, SharedTransferFlowBus, shared_change_flow_bus, shared_transfer_flow_bus,
};
use crate::mapper::{AliasTable, PathMapper};
use crate::notifier::{ChangeNotifier, ChangeNotifierHandle, NotifierError};
use crate::policy::{AppRegistry, Policy, StaticApps};
use crate::repository::RepositoryDetector;
use crate::resolver::PathResolver;
use crate::timeline::{MountedSnapshotSource, RewindSession, SnapshotSource, Timeline};
use crate::transfer::TransferEngine;
use crate::trash::TrashStore;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Notifier(#[from] NotifierError),
}

/// A Rewind browsing session together with a [`Files`] reading through it.
#[derive(Debug)]
pub struct RewindView {
    pub session: RewindSession,
    pub files: Files,
}

pub struct Hearth {
    config: HearthConfig,
    mapper: Arc<PathMapper>,
    files: Files,
    favorites: Arc<Favorites>,
    timeline: Timeline,
    transfers: SharedTransferFlowBus,
    changes: SharedChangeFlowBus,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Hearth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hearth")
            .field("data_directory", &self.config.data_directory)
            .field("mapper", &self.mapper)
            .finish_non_exhaustive()
    }
}

fn parse_paths(raw: &[String], what: &str) -> Vec<LogicalPath> {
    raw.iter()
        .filter_map(|p| match LogicalPath::parse(p) {
            Ok(path) => Some(path),
            Err(code) => {
                tracing::warn!(path = %p, %code, "ignoring invalid {what} path");
                None
            }
        })
        .collect()
}

impl Hearth {
    /// Build from `config` with no installed apps.
    pub fn new(config: HearthConfig) -> Result<Self, KernelError> {
        Self::with_apps(config, Arc::new(StaticApps::default()))
    }

    pub fn with_apps(config: HearthConfig, apps: Arc<dyn AppRegistry>) -> Result<Self, KernelError> {
        let table = AliasTable::new(config.root_bindings()?)?;
        let source = match table.get(&LogicalPath::parse("/Backups").map_err(FsError::from)?) {
            Some(root) => MountedSnapshotSource::new(root),
            None => MountedSnapshotSource::new(config.data_directory.join("backups")),
        };
        Self::assemble(config, table, apps, Arc::new(source))
    }

    /// Build with an external backup mechanism.
    pub fn with_snapshot_source(
        config: HearthConfig,
        apps: Arc<dyn AppRegistry>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self, KernelError> {
        let table = AliasTable::new(config.root_bindings()?)?;
        Self::assemble(config, table, apps, source)
    }

    fn assemble(
        config: HearthConfig,
        table: AliasTable,
        apps: Arc<dyn AppRegistry>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self, KernelError> {
        let mapper = Arc::new(PathMapper::new(table));
        let resolver = PathResolver::new();
        let policy = Policy::new(apps);
        let trash = TrashStore::new(config.trash_meta_dir());
        let transfers = shared_transfer_flow_bus(256);
        let changes = shared_change_flow_bus(1024);

        let engine = TransferEngine::new(
            Arc::new(mapper.defaults().clone()),
            resolver.clone(),
            policy.clone(),
            trash.clone(),
            config.transfer.clone(),
            transfers.clone(),
        );
        let files = Files::new(
            mapper.clone(),
            resolver.clone(),
            policy,
            engine,
            trash,
            ListingSettings::from_config(&config),
        );
        let favorites = Arc::new(Favorites::new(
            config.favorites_path(),
            parse_paths(&config.default_favorites, "favorite"),
            files.clone(),
        ));
        let detector = RepositoryDetector::new(
            config.repository_marker.clone(),
            config.registered_repositories(),
            mapper.clone(),
            resolver,
        );
        let timeline = Timeline::new(source, detector);

        tracing::info!(data_directory = %config.data_directory.display(), "hearth assembled");
        Ok(Self {
            config,
            mapper,
            files,
            favorites,
            timeline,
            transfers,
            changes,
            shutdown: CancellationToken::new(),
        })
    }

    /// Create every base directory and the trash record directory.
    pub async fn prepare(&self) -> FsResult<()> {
        for (logical, physical) in self.mapper.defaults().entries() {
            tokio::fs::create_dir_all(physical)
                .await
                .map_err(|e| FsError::from_io(e, IoOp::Mkdir, logical.to_string()))?;
        }
        tokio::fs::create_dir_all(self.config.trash_meta_dir())
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Mkdir, "trash meta"))?;
        Ok(())
    }

    pub fn config(&self) -> &HearthConfig {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<PathMapper> {
        &self.mapper
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    pub fn engine(&self) -> &TransferEngine {
        self.files.engine()
    }

    pub fn favorites(&self) -> &Arc<Favorites> {
        &self.favorites
    }

    pub fn detector(&self) -> &RepositoryDetector {
        self.timeline.detector()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn transfer_flows(&self) -> &SharedTransferFlowBus {
        &self.transfers
    }

    pub fn change_flows(&self) -> &SharedChangeFlowBus {
        &self.changes
    }

    /// A fresh Rewind session on its own mapper.
    pub fn rewind(&self) -> RewindView {
        let mapper = Arc::new(self.mapper.fork());
        RewindView {
            session: self.timeline.session(mapper.clone()),
            files: self.files.with_mapper(mapper),
        }
    }

    /// Watch the configured roots and publish on [`Hearth::change_flows`].
    pub fn start_notifier(&self) -> Result<ChangeNotifierHandle, KernelError> {
        let roots = parse_paths(&self.config.watch, "watch");
        let notifier = ChangeNotifier::new(self.mapper.clone(), self.changes.clone());
        Ok(notifier.start(&roots)?)
    }

    /// Background tasks that react to change events. Stopped by
    /// [`Hearth::shutdown`].
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![self.favorites.clone().spawn_listener(&self.changes, self.shutdown.child_token())]
    }

    /// Stop background tasks and cancel every running transfer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for job in self.engine().in_progress() {
            if let Err(e) = self.engine().cancel(job.id) {
                tracing::warn!(job = %job.id, error = %e, "cancel on shutdown failed");
            }
        }
        tracing::info!("hearth shut down");
    }
}
