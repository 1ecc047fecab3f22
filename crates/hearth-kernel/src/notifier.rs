//! Filesystem change notifications on logical paths.
//!
//! ```text
//!   notify watcher (physical paths)
//!        │  try_send
//!        ▼
//!   mpsc ──► select! loop ──► to_logical ──► FlowBus<ChangeFlow>
//!              │ debounce         │
//!              └ shutdown         └ unmappable paths are dropped
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hearth_types::LogicalPath;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::flows::{ChangeFlow, ChangeKind, SharedChangeFlowBus};
use crate::mapper::PathMapper;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Events for the same path and kind closer together than this are merged.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

const RAW_QUEUE: usize = 1024;

/// Map a notify event onto `(physical path, kind)` pairs.
pub fn classify_event(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
    let single = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };
    match event.kind {
        EventKind::Create(_) => single(ChangeKind::Created),
        EventKind::Remove(_) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), ChangeKind::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), ChangeKind::Created));
            }
            out
        }
        EventKind::Modify(_) => single(ChangeKind::Modified),
        _ => Vec::new(),
    }
}

/// Translates physical watch events into [`ChangeFlow`]s.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    mapper: Arc<PathMapper>,
    bus: SharedChangeFlowBus,
    debounce: Duration,
}

/// Keeps a running notifier alive. Dropping it without [`stop`] leaves the
/// processing task running until the watcher's channel closes.
///
/// [`stop`]: ChangeNotifierHandle::stop
pub struct ChangeNotifierHandle {
    _watcher: RecommendedWatcher,
    shutdown_tx: oneshot::Sender<()>,
    watched: Vec<LogicalPath>,
}

impl ChangeNotifierHandle {
    pub fn watched(&self) -> &[LogicalPath] {
        &self.watched
    }

    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for ChangeNotifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifierHandle")
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

impl ChangeNotifier {
    pub fn new(mapper: Arc<PathMapper>, bus: SharedChangeFlowBus) -> Self {
        Self {
            mapper,
            bus,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn bus(&self) -> &SharedChangeFlowBus {
        &self.bus
    }

    /// The logical form of a physical event, or `None` when the path is
    /// outside every mapped root.
    pub fn translate(&self, physical: &Path, kind: ChangeKind) -> Option<ChangeFlow> {
        match self.mapper.to_logical(physical) {
            Ok(path) => Some(ChangeFlow { path, kind }),
            Err(e) => {
                tracing::debug!(path = %physical.display(), error = %e, "dropping unmappable event");
                None
            }
        }
    }

    /// Translate and publish. Returns whether anything was published.
    pub fn dispatch(&self, physical: &Path, kind: ChangeKind) -> bool {
        match self.translate(physical, kind) {
            Some(change) => {
                tracing::debug!(path = %change.path, kind = ?change.kind, "fs change");
                self.bus.publish(change);
                true
            }
            None => false,
        }
    }

    /// Watch `roots` recursively. Roots that are unmapped or do not exist yet
    /// are skipped with a warning.
    pub fn start(&self, roots: &[LogicalPath]) -> Result<ChangeNotifierHandle, NotifierError> {
        let (tx, mut rx) = mpsc::channel::<(PathBuf, ChangeKind)>(RAW_QUEUE);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for item in classify_event(&event) {
                        if tx.try_send(item).is_err() {
                            tracing::warn!("change queue full, dropping event");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        )?;

        let mut watched = Vec::new();
        for root in roots {
            let physical = match self.mapper.to_physical(root) {
                Ok(physical) => physical,
                Err(e) => {
                    tracing::warn!(root = %root, error = %e, "not watching unmapped root");
                    continue;
                }
            };
            if !physical.is_dir() {
                tracing::warn!(root = %root, path = %physical.display(), "not watching missing root");
                continue;
            }
            watcher.watch(&physical, RecursiveMode::Recursive)?;
            watched.push(root.clone());
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut recent: HashMap<(PathBuf, ChangeKind), Instant> = HashMap::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("change notifier shutting down");
                        break;
                    }
                    raw = rx.recv() => {
                        let Some((path, kind)) = raw else { break };
                        let now = Instant::now();
                        let key = (path, kind);
                        if recent.get(&key).is_some_and(|last| now.duration_since(*last) < notifier.debounce) {
                            continue;
                        }
                        if recent.len() > RAW_QUEUE {
                            recent.retain(|_, seen| now.duration_since(*seen) < notifier.debounce);
                        }
                        notifier.dispatch(&key.0, kind);
                        recent.insert(key, now);
                    }
                }
            }
        });

        tracing::info!(roots = ?watched, "change notifier started");
        Ok(ChangeNotifierHandle {
            _watcher: watcher,
            shutdown_tx,
            watched,
        })
    }
}
