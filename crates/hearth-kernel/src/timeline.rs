//! Snapshot timelines and Rewind sessions.
//!
//! The backup mechanism itself is external. It is reached through
//! [`SnapshotSource`], which lists raw `(id, time)` pairs for a repository and
//! hands back the physical directory holding a snapshot. This module only
//! orders those pairs, appends the `current` marker, and turns a selection
//! into aliases on a session's [`PathMapper`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_types::{BackupId, ErrorCode, LogicalPath, Repository, Snapshot, SnapshotId};
use parking_lot::Mutex;

use crate::error::{FsError, FsResult, IoOp};
use crate::mapper::PathMapper;
use crate::repository::RepositoryDetector;

/// Supplies snapshots for a repository.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Raw snapshots in any order.
    async fn snapshots(&self, repository: &Repository) -> FsResult<Vec<Snapshot>>;

    /// Physical root of one snapshot. Rewind aliases point below it.
    async fn subtree(&self, repository: &Repository, snapshot: &str) -> FsResult<PathBuf>;
}

/// Ascending by time, ties broken by id, with `current` last.
pub fn build_timeline(mut snapshots: Vec<Snapshot>, now: i64) -> Vec<Snapshot> {
    snapshots.retain(|s| !s.id.is_current());
    snapshots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    snapshots.push(Snapshot::current(now));
    snapshots
}

fn check_segment(segment: &str) -> FsResult<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\0']) {
        return Err(FsError::coded(ErrorCode::InvalidFilename, segment.to_string()));
    }
    Ok(())
}

/// Snapshots already mounted as directories:
/// `<root>/<repository id>/<RFC 3339 time>/{Home,Apps}`.
#[derive(Debug, Clone)]
pub struct MountedSnapshotSource {
    root: PathBuf,
}

impl MountedSnapshotSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `2024-05-01T03:00:00Z` → milliseconds.
    pub fn parse_snapshot_time(name: &str) -> Option<i64> {
        DateTime::parse_from_rfc3339(name)
            .ok()
            .map(|t| t.with_timezone(&Utc).timestamp_millis())
    }

    fn repository_dir(&self, repository: &Repository) -> FsResult<PathBuf> {
        check_segment(&repository.id)?;
        Ok(self.root.join(&repository.id))
    }
}

#[async_trait]
impl SnapshotSource for MountedSnapshotSource {
    async fn snapshots(&self, repository: &Repository) -> FsResult<Vec<Snapshot>> {
        let dir = self.repository_dir(repository)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::from_io(e, IoOp::Stat, format!("listing {}", dir.display()))),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Stat, format!("listing {}", dir.display())))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match Self::parse_snapshot_time(&name) {
                Some(time) => snapshots.push(Snapshot::new(name, time)),
                None => tracing::debug!(entry = %name, "not a snapshot directory"),
            }
        }
        Ok(snapshots)
    }

    async fn subtree(&self, repository: &Repository, snapshot: &str) -> FsResult<PathBuf> {
        check_segment(snapshot)?;
        let path = self.repository_dir(repository)?.join(snapshot);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            _ => Err(FsError::coded(
                ErrorCode::NotFound,
                format!("snapshot {}", BackupId { repository: repository.id.clone(), snapshot: snapshot.into() }),
            )),
        }
    }
}

/// Timelines for registered repositories.
#[derive(Clone)]
pub struct Timeline {
    source: Arc<dyn SnapshotSource>,
    detector: RepositoryDetector,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline").finish_non_exhaustive()
    }
}

impl Timeline {
    pub fn new(source: Arc<dyn SnapshotSource>, detector: RepositoryDetector) -> Self {
        Self { source, detector }
    }

    pub fn detector(&self) -> &RepositoryDetector {
        &self.detector
    }

    fn repository(&self, id: &str) -> FsResult<Repository> {
        self.detector
            .repository(id)
            .ok_or_else(|| FsError::coded(ErrorCode::NotFound, format!("repository {id}")))
    }

    /// Ordered recovery points for `repository_id`, `current` last.
    pub async fn timeline(&self, repository_id: &str) -> FsResult<Vec<Snapshot>> {
        let repository = self.repository(repository_id)?;
        let snapshots = self.source.snapshots(&repository).await?;
        Ok(build_timeline(snapshots, Utc::now().timestamp_millis()))
    }

    /// Start a Rewind session over `mapper`.
    pub fn session(&self, mapper: Arc<PathMapper>) -> RewindSession {
        RewindSession {
            timeline: self.clone(),
            mapper,
            roots: default_rewind_roots(),
            selected: Mutex::new(None),
        }
    }
}

/// Logical roots a Rewind selection shadows, with the snapshot subdirectory
/// each one maps to.
pub fn default_rewind_roots() -> Vec<(LogicalPath, String)> {
    ["Home", "Apps"]
        .into_iter()
        .filter_map(|name| Some((LogicalPath::root().join(name).ok()?, name.to_string())))
        .collect()
}

/// One caller's Rewind state. Dropping the session leaves the mapper as it
/// was last set; call [`RewindSession::clear`] to go back to live data.
pub struct RewindSession {
    timeline: Timeline,
    mapper: Arc<PathMapper>,
    roots: Vec<(LogicalPath, String)>,
    selected: Mutex<Option<BackupId>>,
}

impl std::fmt::Debug for RewindSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewindSession")
            .field("selected", &*self.selected.lock())
            .finish_non_exhaustive()
    }
}

impl RewindSession {
    pub fn with_roots(mut self, roots: Vec<(LogicalPath, String)>) -> Self {
        self.roots = roots;
        self
    }

    pub fn mapper(&self) -> &Arc<PathMapper> {
        &self.mapper
    }

    pub fn selected(&self) -> Option<BackupId> {
        self.selected.lock().clone()
    }

    /// Browse `snapshot` of `repository_id`. Selecting `current` clears.
    #[tracing::instrument(skip(self))]
    pub async fn select(&self, repository_id: &str, snapshot: &SnapshotId) -> FsResult<()> {
        let id = match snapshot {
            SnapshotId::Current => {
                self.clear();
                return Ok(());
            }
            SnapshotId::Id(id) => id,
        };
        let repository = self.timeline.repository(repository_id)?;
        let subtree = self.timeline.source.subtree(&repository, id).await?;

        let aliases = self
            .roots
            .iter()
            .map(|(logical, dir)| (logical.clone(), subtree.join(dir)));
        self.mapper.install(aliases)?;
        *self.selected.lock() = Some(BackupId {
            repository: repository.id,
            snapshot: id.clone(),
        });
        tracing::info!(snapshot = %id, "rewind snapshot selected");
        Ok(())
    }

    /// Select by composite `<repository>:<snapshot>` id.
    pub async fn select_backup(&self, backup: &BackupId) -> FsResult<()> {
        self.select(&backup.repository, &SnapshotId::from(backup.snapshot.as_str()))
            .await
    }

    /// Back to live data.
    pub fn clear(&self) {
        self.mapper.clear();
        if self.selected.lock().take().is_some() {
            tracing::info!("rewind cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::AliasTable;
    use crate::resolver::PathResolver;
    use tempfile::TempDir;

    fn lp(s: &str) -> LogicalPath {
        LogicalPath::parse(s).unwrap()
    }

    #[test]
    fn timeline_is_ascending_with_current_last() {
        let raw = vec![Snapshot::new("c", 5), Snapshot::new("a", 1), Snapshot::new("b", 3)];
        let times: Vec<i64> = build_timeline(raw, 0).iter().map(|s| s.time).collect();
        assert_eq!(times, vec![1, 3, 5, 0]);

        let t = build_timeline(vec![Snapshot::new("x", 9), Snapshot::current(2)], 4);
        assert_eq!(t.len(), 2);
        assert!(t.last().unwrap().id.is_current());
        assert!(build_timeline(vec![], 7)[0].id.is_current());
    }

    #[test]
    fn equal_times_order_by_id() {
        let t = build_timeline(vec![Snapshot::new("b", 1), Snapshot::new("a", 1)], 2);
        assert_eq!(t[0].id, SnapshotId::from("a"));
        assert_eq!(t[1].id, SnapshotId::from("b"));
    }

    #[test]
    fn snapshot_names_parse_as_rfc3339() {
        assert_eq!(
            MountedSnapshotSource::parse_snapshot_time("1970-01-01T00:00:01Z"),
            Some(1000)
        );
        assert_eq!(
            MountedSnapshotSource::parse_snapshot_time("1970-01-01T01:00:00+01:00"),
            Some(0)
        );
        assert!(MountedSnapshotSource::parse_snapshot_time("lost+found").is_none());
    }

    struct Fixture {
        _tmp: TempDir,
        timeline: Timeline,
        mapper: Arc<PathMapper>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let backups = tmp.path().join("backups");
        for snap in ["2024-03-01T00:00:00Z", "2024-01-01T00:00:00Z"] {
            std::fs::create_dir_all(backups.join("repo1").join(snap).join("Home")).unwrap();
        }
        std::fs::create_dir_all(backups.join("repo1/not-a-snapshot")).unwrap();
        std::fs::create_dir_all(tmp.path().join("home")).unwrap();

        let table = AliasTable::new([
            (lp("/Home"), tmp.path().join("home")),
            (lp("/Backups"), backups.clone()),
        ])
        .unwrap();
        let mapper = Arc::new(PathMapper::new(table));
        let detector = RepositoryDetector::new(
            "Hearth Backup.backup",
            vec![Repository { id: "repo1".into(), path: lp("/External/usb/Hearth Backup.backup") }],
            mapper.clone(),
            PathResolver::new(),
        );
        let timeline = Timeline::new(Arc::new(MountedSnapshotSource::new(backups)), detector);
        Fixture { _tmp: tmp, timeline, mapper }
    }

    #[tokio::test]
    async fn mounted_timeline() {
        let f = fixture();
        let t = f.timeline.timeline("repo1").await.unwrap();
        let ids: Vec<String> = t.iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["2024-01-01T00:00:00Z", "2024-03-01T00:00:00Z", "current"]);

        let err = f.timeline.timeline("nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn select_and_clear_swap_aliases() {
        let f = fixture();
        let session = f.timeline.session(f.mapper.clone());
        let live = f.mapper.to_physical(&lp("/Home/a.txt")).unwrap();

        session
            .select("repo1", &SnapshotId::from("2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let aliased = f.mapper.to_physical(&lp("/Home/a.txt")).unwrap();
        assert!(aliased.ends_with("repo1/2024-01-01T00:00:00Z/Home/a.txt"));
        assert_eq!(
            f.mapper.canonical(&lp("/Home/a.txt")).unwrap(),
            lp("/Backups/repo1/2024-01-01T00:00:00Z/Home/a.txt")
        );
        assert_eq!(session.selected().unwrap().to_string(), "repo1:2024-01-01T00:00:00Z");

        session.select("repo1", &SnapshotId::Current).await.unwrap();
        assert_eq!(f.mapper.to_physical(&lp("/Home/a.txt")).unwrap(), live);
        assert!(session.selected().is_none());
    }

    #[tokio::test]
    async fn unknown_snapshot_leaves_mapping_alone() {
        let f = fixture();
        let session = f.timeline.session(f.mapper.clone());
        let err = session.select("repo1", &SnapshotId::from("1999-01-01T00:00:00Z")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = session.select("repo1", &SnapshotId::from("../..")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFilename);
        assert!(!f.mapper.has_aliases());
    }
}
