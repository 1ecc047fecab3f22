//! Backup repository detection.
//!
//! Detection is advisory: it never fails. A registered repository is
//! recognized from the table alone; anything else gets one bounded listing
//! probe through the normal mapper and resolver, and every failure on that
//! path reads as "no repository here".

use std::sync::Arc;
use std::time::Duration;

use hearth_types::{LogicalPath, Repository, RepositoryCandidate, RepositoryStatus};
use parking_lot::RwLock;

use crate::mapper::PathMapper;
use crate::resolver::PathResolver;

const NETWORK_ROOT: &str = "/Network";
const EXTERNAL_ROOT: &str = "/External";

/// Upper bound on the listing probe, retries included.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

fn on_removable_root(path: &str) -> bool {
    [NETWORK_ROOT, EXTERNAL_ROOT]
        .iter()
        .any(|root| path == *root || path.starts_with(&format!("{root}/")))
}

fn segments_before_marker<'a>(path: &'a str, marker: &str) -> Vec<&'a str> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .take_while(|s| *s != marker)
        .collect()
}

/// Device name through the repository's folder with a trailing slash:
/// `/External/usb/Backups/<marker>` → `usb/Backups/`. Empty if nothing is left.
pub fn repository_display_path(path: &str, marker: &str) -> String {
    let segments = segments_before_marker(path, marker);
    let skip = usize::from(on_removable_root(path));
    let parts = segments.get(skip..).unwrap_or_default();
    if parts.is_empty() {
        return String::new();
    }
    format!("{}/", parts.join("/"))
}

/// The folder inside the device, without the marker:
/// `/External/usb/<marker>` → `/`, `/Network/host/share/My Backups/<marker>`
/// → `/share/My Backups`.
pub fn repository_relative_path(path: &str, marker: &str) -> String {
    let segments = segments_before_marker(path, marker);
    let skip = if on_removable_root(path) { 2 } else { 0 };
    let inner = segments.get(skip..).unwrap_or_default().join("/");
    format!("/{inner}")
}

/// Parent folder of a marker path: `/Network/host/data/<marker>` →
/// `/Network/host/data`. Paths without the marker are returned trimmed.
pub fn repository_path_from_marker(path: &str, marker: &str) -> String {
    let path = path.trim();
    match path.strip_suffix(marker) {
        Some(parent) => {
            let parent = parent.trim_end_matches('/');
            if parent.is_empty() { "/".into() } else { parent.into() }
        }
        None => path.to_string(),
    }
}

/// Classifies folders as backup repositories.
#[derive(Debug, Clone)]
pub struct RepositoryDetector {
    marker: String,
    registered: Arc<RwLock<Vec<Repository>>>,
    mapper: Arc<PathMapper>,
    resolver: PathResolver,
}

impl RepositoryDetector {
    pub fn new(
        marker: impl Into<String>,
        registered: Vec<Repository>,
        mapper: Arc<PathMapper>,
        resolver: PathResolver,
    ) -> Self {
        Self {
            marker: marker.into(),
            registered: Arc::new(RwLock::new(registered)),
            mapper,
            resolver,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.registered.read().clone()
    }

    pub fn repository(&self, id: &str) -> Option<Repository> {
        self.registered.read().iter().find(|r| r.id == id).cloned()
    }

    /// Register (or re-point) a repository.
    pub fn register(&self, repository: Repository) {
        let mut registered = self.registered.write();
        registered.retain(|r| r.id != repository.id);
        tracing::info!(id = %repository.id, path = %repository.path, "repository registered");
        registered.push(repository);
    }

    /// Returns false if `id` was not registered.
    pub fn forget(&self, id: &str) -> bool {
        let mut registered = self.registered.write();
        let before = registered.len();
        registered.retain(|r| r.id != id);
        before != registered.len()
    }

    /// `folder` plus the marker. A folder that is itself named like the
    /// marker still gets the marker appended.
    pub fn expected_repository_path(&self, folder: &LogicalPath) -> Option<LogicalPath> {
        folder.join(&self.marker).ok()
    }

    /// Registered repository at exactly `path`. Never touches the disk.
    pub fn registered_at(&self, path: &LogicalPath) -> Option<Repository> {
        self.registered.read().iter().find(|r| r.path == *path).cloned()
    }

    /// Classify `folder` (an untrusted logical path string).
    #[tracing::instrument(skip(self))]
    pub async fn detect(&self, folder: &str) -> RepositoryCandidate {
        let trimmed = folder.trim_end_matches('/');
        let folder = match LogicalPath::parse(if trimmed.is_empty() { "/" } else { trimmed }) {
            Ok(folder) => folder,
            Err(code) => {
                tracing::debug!(%code, "unparseable folder");
                return RepositoryCandidate {
                    folder: LogicalPath::root(),
                    repository_path: None,
                    status: RepositoryStatus::None,
                };
            }
        };

        let Some(candidate) = self.expected_repository_path(&folder) else {
            return none(folder);
        };

        if self.registered_at(&candidate).is_some() {
            return RepositoryCandidate {
                folder,
                repository_path: Some(candidate),
                status: RepositoryStatus::AlreadyConfigured,
            };
        }

        match tokio::time::timeout(PROBE_TIMEOUT, self.probe(&candidate)).await {
            Ok(true) => RepositoryCandidate {
                folder,
                repository_path: Some(candidate),
                status: RepositoryStatus::ExistsNotConfigured,
            },
            Ok(false) => none(folder),
            Err(_) => {
                tracing::warn!(path = %candidate, "repository probe timed out");
                none(folder)
            }
        }
    }

    /// List at most one entry of `candidate`. True when the listing worked,
    /// even if the directory is empty.
    async fn probe(&self, candidate: &LogicalPath) -> bool {
        let physical = match self.mapper.resolve(&self.resolver, candidate) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(path = %candidate, error = %e, "repository path rejected");
                return false;
            }
        };
        match tokio::fs::read_dir(&physical).await {
            Ok(mut dir) => match dir.next_entry().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(path = %candidate, error = %e, "repository listing failed");
                    false
                }
            },
            Err(e) => {
                tracing::debug!(path = %candidate, error = %e, "no repository");
                false
            }
        }
    }
}

fn none(folder: LogicalPath) -> RepositoryCandidate {
    RepositoryCandidate {
        folder,
        repository_path: None,
        status: RepositoryStatus::None,
    }
}
