//! Copy, move, trash and restore as background jobs.
//!
//! ```text
//! start(request)
//!   ├─ pre-flight: map + resolve every path, policy, existence, free space
//!   ├─ plan:   pick target names and take path locks (one step, serialized)
//!   │          conflict → queue (wait for a release) or fail `in-progress`
//!   └─ run:    per source, native rename or the copy program with progress
//!              cancel → kill the child, keep partial output for resume
//! ```
//!
//! The copy program is rsync-compatible and always runs with `--inplace`, so
//! files are updated in their existing inode and a cancelled copy can be
//! resumed by running the same job again.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use hearth_types::{
    Collision, ErrorCode, FileKind, FileOperation, JobId, LockWait, LogicalPath, TransferJob,
    TransferKind, TransferProgress, TransferState,
};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::{REPLACE_SUFFIX, TransferConfig};
use crate::error::{FsError, FsResult, IoOp};
use crate::flows::{SharedTransferFlowBus, Subscription, TransferFlow};
use crate::locks::{PathLockGuard, PathLockSet};
use crate::mapper::AliasTable;
use crate::policy::Policy;
use crate::progress::{ProgressLineCodec, ProgressTracker, parse_progress_line};
use crate::resolver::PathResolver;
use crate::trash::{TrashStore, trash_root};

/// Highest `(n)` suffix tried before giving up with `unique-name-index-exceeded`.
pub const UNIQUE_NAME_LIMIT: u32 = 999;

/// Split `name` into stem and extension, keeping `.tar.*` together.
/// Dotfiles such as `.bashrc` have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    let Some(dot) = name.rfind('.').filter(|i| *i > 0) else {
        return (name, "");
    };
    let (stem, ext) = name.split_at(dot);
    match stem.strip_suffix(".tar") {
        Some(base) if !base.is_empty() => (base, &name[base.len()..]),
        _ => (stem, ext),
    }
}

/// `name (n).ext`
pub fn numbered_name(name: &str, n: u32) -> String {
    let (stem, ext) = split_extension(name);
    format!("{stem} ({n}){ext}")
}

/// What the caller asked for.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub sources: Vec<LogicalPath>,
    /// Destination directory. Ignored for trash and restore.
    pub destination: LogicalPath,
    /// `None` picks the per-kind default: keep-both for copies, error otherwise.
    pub collision: Option<Collision>,
    pub wait: LockWait,
}

impl TransferRequest {
    pub fn new(kind: TransferKind, sources: Vec<LogicalPath>, destination: LogicalPath) -> Self {
        Self {
            kind,
            sources,
            destination,
            collision: None,
            wait: LockWait::default(),
        }
    }

    pub fn copy(sources: Vec<LogicalPath>, destination: LogicalPath) -> Self {
        Self::new(TransferKind::Copy, sources, destination)
    }

    pub fn move_to(sources: Vec<LogicalPath>, destination: LogicalPath) -> Self {
        Self::new(TransferKind::Move, sources, destination)
    }

    pub fn trash(sources: Vec<LogicalPath>) -> Self {
        Self::new(TransferKind::Trash, sources, trash_root())
    }

    pub fn restore(sources: Vec<LogicalPath>) -> Self {
        Self::new(TransferKind::Restore, sources, trash_root())
    }

    pub fn with_collision(mut self, collision: Collision) -> Self {
        self.collision = Some(collision);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.wait = LockWait::FailFast;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    /// Already in place.
    Noop,
    /// Same filesystem: atomic rename.
    Rename,
    /// The copy program, optionally deleting the source afterwards.
    CopyProgram { remove_source: bool },
}

/// One validated source.
#[derive(Debug, Clone)]
struct Item {
    source: LogicalPath,
    source_physical: PathBuf,
    is_dir: bool,
    target_dir: LogicalPath,
    target_dir_physical: PathBuf,
    name: String,
    collision: Collision,
    method: Method,
    /// Trash entry to drop once a top-level restore succeeds.
    restored_entry: Option<String>,
}

/// An item with its final target chosen.
#[derive(Debug, Clone)]
struct Planned {
    item: Item,
    target: LogicalPath,
    target_physical: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartialKey {
    source: PathBuf,
    target_dir: PathBuf,
}

struct JobEntry {
    state: watch::Sender<TransferJob>,
    cancel: CancellationToken,
}

struct EngineInner {
    table: Arc<AliasTable>,
    resolver: PathResolver,
    policy: Policy,
    trash: TrashStore,
    settings: TransferConfig,
    locks: PathLockSet,
    planning: Mutex<()>,
    jobs: DashMap<JobId, JobEntry>,
    partials: DashMap<PartialKey, PathBuf>,
    flows: SharedTransferFlowBus,
}

/// Runs transfer jobs. Cheap to clone.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("jobs", &self.inner.jobs.len())
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// `table` is the live (unaliased) mapping; callers browsing a snapshot
    /// pass canonical `/Backups/...` paths.
    pub fn new(
        table: Arc<AliasTable>,
        resolver: PathResolver,
        policy: Policy,
        trash: TrashStore,
        settings: TransferConfig,
        flows: SharedTransferFlowBus,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                table,
                resolver,
                policy,
                trash,
                settings,
                locks: PathLockSet::new(),
                planning: Mutex::new(()),
                jobs: DashMap::new(),
                partials: DashMap::new(),
                flows,
            }),
        }
    }

    pub fn flows(&self) -> &SharedTransferFlowBus {
        &self.inner.flows
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<TransferFlow> {
        self.inner.flows.subscribe(pattern)
    }

    pub fn locks(&self) -> &PathLockSet {
        &self.inner.locks
    }

    /// Validate `request` and start it in the background.
    ///
    /// Pre-flight failures (bad paths, policy, missing sources, no space,
    /// `subdir-of-self`, and `in-progress` for fail-fast requests) are
    /// returned here. Everything after that is reported on the job.
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind, sources = request.sources.len()))]
    pub async fn start(&self, request: TransferRequest) -> FsResult<TransferJob> {
        if request.sources.is_empty() {
            return Err(FsError::coded(ErrorCode::SourceNotExists, "no sources"));
        }

        let items = self.preflight(&request).await?;
        let job = TransferJob::new(
            request.kind,
            request.sources.clone(),
            job_destination(&request, &items),
        );
        let id = job.id;
        let kind = job.kind;

        let first_try = self.plan_and_lock(id, &items).await?;
        let (guard, planned) = match (first_try, request.wait) {
            (Some(acquired), _) => (Some(acquired.0), Some(acquired.1)),
            (None, LockWait::FailFast) => {
                return Err(FsError::coded(ErrorCode::InProgress, "paths are locked by another job"));
            }
            (None, LockWait::Queue) => (None, None),
        };

        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(job.clone());
        self.inner.jobs.insert(
            id,
            JobEntry {
                state,
                cancel: cancel.clone(),
            },
        );
        self.inner.flows.publish(TransferFlow::Started { job: job.clone() });
        tracing::info!(job = %id, "transfer queued");

        let engine = self.clone();
        tokio::spawn(async move {
            let acquired = match (guard, planned) {
                (Some(guard), Some(planned)) => Some((guard, planned)),
                _ => engine.wait_for_locks(id, &items, &cancel).await,
            };
            if let Some((guard, planned)) = acquired {
                engine.run(id, kind, planned, guard, cancel).await;
            }
        });

        Ok(job)
    }

    /// Start a job and wait for it to reach a terminal state.
    pub async fn run_to_completion(&self, request: TransferRequest) -> FsResult<TransferJob> {
        let job = self.start(request).await?;
        self.wait(job.id).await
    }

    /// Wait until job `id` is done, failed or cancelled.
    pub async fn wait(&self, id: JobId) -> FsResult<TransferJob> {
        let mut rx = self
            .inner
            .jobs
            .get(&id)
            .map(|entry| entry.state.subscribe())
            .ok_or_else(|| FsError::coded(ErrorCode::NotFound, format!("job {id}")))?;
        let job = rx
            .wait_for(|job| job.state.is_terminal())
            .await
            .map_err(|_| FsError::coded(ErrorCode::NotFound, format!("job {id} vanished")))?;
        Ok(job.clone())
    }

    /// Ask job `id` to stop. Already-finished jobs are left alone.
    pub fn cancel(&self, id: JobId) -> FsResult<()> {
        let entry = self
            .inner
            .jobs
            .get(&id)
            .ok_or_else(|| FsError::coded(ErrorCode::NotFound, format!("job {id}")))?;
        if entry.state.borrow().state.is_active() {
            tracing::info!(job = %id, "cancelling transfer");
            entry.cancel.cancel();
        }
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Option<TransferJob> {
        self.inner.jobs.get(&id).map(|e| e.state.borrow().clone())
    }

    /// Every queued or running job, oldest first.
    pub fn in_progress(&self) -> Vec<TransferJob> {
        let mut jobs: Vec<TransferJob> = self
            .inner
            .jobs
            .iter()
            .map(|e| e.state.borrow().clone())
            .filter(|j| j.state.is_active())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Drop terminal jobs from the table. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let before = self.inner.jobs.len();
        self.inner
            .jobs
            .retain(|_, e| e.state.borrow().state.is_active());
        before - self.inner.jobs.len()
    }

    // ------------------------------------------------------------------
    // Pre-flight
    // ------------------------------------------------------------------

    async fn preflight(&self, request: &TransferRequest) -> FsResult<Vec<Item>> {
        let mut items = Vec::with_capacity(request.sources.len());
        for source in &request.sources {
            let item = match request.kind {
                TransferKind::Copy => self.preflight_copy(source, &request.destination, request.collision).await?,
                TransferKind::Move => self.preflight_move(source, &request.destination, request.collision).await?,
                TransferKind::Trash => self.preflight_trash(source).await?,
                TransferKind::Restore => self.preflight_restore(source, request.collision).await?,
            };
            items.push(item);
        }
        self.check_space(&items).await?;
        Ok(items)
    }

    fn resolve(&self, logical: &LogicalPath) -> FsResult<PathBuf> {
        self.inner.table.resolve(&self.inner.resolver, logical)
    }

    async fn source_metadata(&self, physical: &Path) -> FsResult<std::fs::Metadata> {
        tokio::fs::symlink_metadata(physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Move, format!("source {}", physical.display())))
    }

    async fn destination_dir(&self, destination: &LogicalPath) -> FsResult<(PathBuf, std::fs::Metadata)> {
        let physical = self.resolve(destination)?;
        match tokio::fs::metadata(&physical).await {
            Ok(meta) if meta.is_dir() => Ok((physical, meta)),
            Ok(_) => Err(FsError::coded(
                ErrorCode::DestinationNotExist,
                format!("{destination} is not a directory"),
            )),
            Err(e) => Err(FsError::coded(
                ErrorCode::DestinationNotExist,
                format!("{destination}: {e}"),
            )),
        }
    }

    fn require(&self, path: &LogicalPath, is_dir: bool, op: FileOperation) -> FsResult<()> {
        let kind = if is_dir { FileKind::Directory } else { FileKind::File };
        self.inner.policy.require(path, Some(kind), op)
    }

    fn method(&self, source: &std::fs::Metadata, target_dir: &std::fs::Metadata) -> Method {
        if self.inner.settings.force_copy_move || !same_device(source, target_dir) {
            Method::CopyProgram { remove_source: true }
        } else {
            Method::Rename
        }
    }

    async fn preflight_copy(
        &self,
        source: &LogicalPath,
        destination: &LogicalPath,
        collision: Option<Collision>,
    ) -> FsResult<Item> {
        self.inner.policy.require(source, None, FileOperation::Copy)?;
        self.require(destination, true, FileOperation::Writable)?;
        let source_physical = self.resolve(source)?;
        let meta = self.source_metadata(&source_physical).await?;
        let (target_dir_physical, _) = self.destination_dir(destination).await?;
        reject_subdir_of_self(&source_physical, &target_dir_physical)?;

        let collision = if source.parent() == *destination {
            Collision::KeepBoth
        } else {
            collision.unwrap_or(Collision::KeepBoth)
        };

        Ok(Item {
            name: item_name(source)?,
            source: source.clone(),
            source_physical,
            is_dir: meta.is_dir(),
            target_dir: destination.clone(),
            target_dir_physical,
            collision,
            method: Method::CopyProgram { remove_source: false },
            restored_entry: None,
        })
    }

    async fn preflight_move(
        &self,
        source: &LogicalPath,
        destination: &LogicalPath,
        collision: Option<Collision>,
    ) -> FsResult<Item> {
        let source_physical = self.resolve(source)?;
        let meta = self.source_metadata(&source_physical).await?;
        let name = item_name(source)?;

        if source.parent() == *destination {
            return Ok(Item {
                source: source.clone(),
                target_dir: destination.clone(),
                target_dir_physical: source_physical
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
                source_physical,
                is_dir: meta.is_dir(),
                name,
                collision: Collision::Error,
                method: Method::Noop,
                restored_entry: None,
            });
        }

        self.require(source, meta.is_dir(), FileOperation::Move)?;
        self.require(destination, true, FileOperation::Writable)?;
        let (target_dir_physical, target_meta) = self.destination_dir(destination).await?;
        reject_subdir_of_self(&source_physical, &target_dir_physical)?;

        Ok(Item {
            method: self.method(&meta, &target_meta),
            source: source.clone(),
            source_physical,
            is_dir: meta.is_dir(),
            target_dir: destination.clone(),
            target_dir_physical,
            name,
            collision: collision.unwrap_or(Collision::Error),
            restored_entry: None,
        })
    }

    async fn preflight_trash(&self, source: &LogicalPath) -> FsResult<Item> {
        let source_physical = self.resolve(source)?;
        let meta = self.source_metadata(&source_physical).await?;
        self.require(source, meta.is_dir(), FileOperation::Trash)?;

        let trash = trash_root();
        let trash_physical = self.resolve(&trash)?;
        tokio::fs::create_dir_all(&trash_physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Mkdir, "creating trash"))?;
        let (target_dir_physical, target_meta) = self.destination_dir(&trash).await?;

        Ok(Item {
            method: self.method(&meta, &target_meta),
            name: item_name(source)?,
            source: source.clone(),
            source_physical,
            is_dir: meta.is_dir(),
            target_dir: trash,
            target_dir_physical,
            collision: Collision::KeepBoth,
            restored_entry: None,
        })
    }

    async fn preflight_restore(
        &self,
        source: &LogicalPath,
        collision: Option<Collision>,
    ) -> FsResult<Item> {
        let source_physical = self.resolve(source)?;
        let meta = self.source_metadata(&source_physical).await?;
        self.require(source, meta.is_dir(), FileOperation::Restore)?;

        let target = self.inner.trash.restore_target(source).await?;
        let target_dir = target.target.parent();
        let target_dir_physical = self.resolve(&target_dir)?;
        // The original folder may have been removed since.
        tokio::fs::create_dir_all(&target_dir_physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Mkdir, format!("recreating {target_dir}")))?;
        let (target_dir_physical, target_meta) = self.destination_dir(&target_dir).await?;

        Ok(Item {
            method: self.method(&meta, &target_meta),
            name: item_name(&target.target)?,
            source: source.clone(),
            source_physical,
            is_dir: meta.is_dir(),
            target_dir,
            target_dir_physical,
            collision: collision.unwrap_or(Collision::Error),
            restored_entry: (!target.is_child).then_some(target.entry),
        })
    }

    /// Everything the copy program will write must fit, plus the reserve, on
    /// each device it writes to.
    async fn check_space(&self, items: &[Item]) -> FsResult<()> {
        let mut devices: BTreeMap<u64, (PathBuf, Vec<PathBuf>)> = BTreeMap::new();
        for item in items.iter().filter(|i| matches!(i.method, Method::CopyProgram { .. })) {
            let device = device_of(&item.target_dir_physical).await?;
            devices
                .entry(device)
                .or_insert_with(|| (item.target_dir_physical.clone(), Vec::new()))
                .1
                .push(item.source_physical.clone());
        }

        let reserve = self.inner.settings.space_reserve_bytes;
        for (device, (target_dir, sources)) in devices {
            let needed = tokio::task::spawn_blocking(move || sources.iter().map(|p| disk_usage(p)).sum::<u64>())
                .await
                .map_err(|e| FsError::coded(ErrorCode::CopyFailed, e.to_string()))?;
            let available = available_space(&target_dir)?;
            if available < needed.saturating_add(reserve) {
                tracing::warn!(device, needed, available, reserve, "not enough space for transfer");
                return Err(FsError::coded(
                    ErrorCode::NotEnoughSpace,
                    format!("need {needed} + {reserve} bytes, {available} available"),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planning and locking
    // ------------------------------------------------------------------

    /// Pick targets and take locks atomically with respect to other jobs.
    /// `Ok(None)` means another job holds an overlapping path.
    async fn plan_and_lock(
        &self,
        id: JobId,
        items: &[Item],
    ) -> FsResult<Option<(PathLockGuard, Vec<Planned>)>> {
        let _planning = self.inner.planning.lock().await;

        let mut planned = Vec::with_capacity(items.len());
        let mut taken: HashSet<PathBuf> = HashSet::new();
        for item in items {
            let p = self.plan_item(item, &taken).await?;
            taken.insert(p.target_physical.clone());
            planned.push(p);
        }

        let mut paths = Vec::new();
        for p in planned.iter().filter(|p| p.item.method != Method::Noop) {
            paths.push(p.item.source_physical.clone());
            paths.push(p.target_physical.clone());
        }

        match self.inner.locks.try_acquire(id, paths) {
            Ok(guard) => Ok(Some((guard, planned))),
            Err(conflict) => {
                tracing::debug!(job = %id, holder = %conflict.holder, path = %conflict.path.display(), "path locked");
                Ok(None)
            }
        }
    }

    async fn plan_item(&self, item: &Item, taken: &HashSet<PathBuf>) -> FsResult<Planned> {
        if item.method == Method::Noop {
            return Ok(Planned {
                target: item.source.clone(),
                target_physical: item.source_physical.clone(),
                item: item.clone(),
            });
        }

        let key = PartialKey {
            source: item.source_physical.clone(),
            target_dir: item.target_dir_physical.clone(),
        };
        if let Some(partial) = self.inner.partials.get(&key).map(|p| p.clone()) {
            if exists(&partial).await {
                if let Some(name) = partial.file_name().and_then(|n| n.to_str()) {
                    tracing::info!(partial = %partial.display(), "resuming partial copy");
                    return Ok(Planned {
                        target: item.target_dir.join(name).map_err(FsError::from)?,
                        target_physical: partial.clone(),
                        item: item.clone(),
                    });
                }
            }
            self.inner.partials.remove(&key);
        }

        let busy = |path: &Path| taken.contains(path) || self.inner.locks.is_locked(path);
        let direct = item.target_dir_physical.join(&item.name);
        let name = match item.collision {
            Collision::Replace => item.name.clone(),
            Collision::Error => {
                if exists(&direct).await || busy(&direct) {
                    return Err(FsError::coded(
                        ErrorCode::DestinationAlreadyExists,
                        format!("{} in {}", item.name, item.target_dir),
                    ));
                }
                item.name.clone()
            }
            Collision::KeepBoth => {
                let mut chosen = None;
                if !exists(&direct).await && !busy(&direct) {
                    chosen = Some(item.name.clone());
                } else {
                    for n in 1..=UNIQUE_NAME_LIMIT {
                        let candidate = numbered_name(&item.name, n);
                        let path = item.target_dir_physical.join(&candidate);
                        if !exists(&path).await && !busy(&path) {
                            chosen = Some(candidate);
                            break;
                        }
                    }
                }
                chosen.ok_or_else(|| {
                    FsError::coded(ErrorCode::UniqueNameIndexExceeded, item.name.clone())
                })?
            }
        };

        Ok(Planned {
            target: item.target_dir.join(&name).map_err(FsError::from)?,
            target_physical: item.target_dir_physical.join(&name),
            item: item.clone(),
        })
    }

    async fn wait_for_locks(
        &self,
        id: JobId,
        items: &[Item],
        cancel: &CancellationToken,
    ) -> Option<(PathLockGuard, Vec<Planned>)> {
        loop {
            let mut released = self.inner.locks.subscribe_releases();
            match self.plan_and_lock(id, items).await {
                Ok(Some(acquired)) => return Some(acquired),
                Ok(None) => {}
                Err(err) => {
                    self.finish(id, Err(err));
                    return None;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish(id, Err(FsError::code_only(ErrorCode::TransferCancelled)));
                    return None;
                }
                _ = released.changed() => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn run(
        &self,
        id: JobId,
        kind: TransferKind,
        planned: Vec<Planned>,
        guard: PathLockGuard,
        cancel: CancellationToken,
    ) {
        self.update(id, |job| job.state = TransferState::Running);
        self.publish_progress(id, TransferProgress::default());
        tracing::info!(job = %id, items = planned.len(), "transfer running");

        let mut tracker = ProgressTracker::new(planned.len());
        let mut results = Vec::with_capacity(planned.len());
        let mut outcome = Ok(());

        for (index, p) in planned.iter().enumerate() {
            tracker.begin_source(index);
            if cancel.is_cancelled() {
                outcome = Err(FsError::code_only(ErrorCode::TransferCancelled));
                break;
            }
            if let Err(err) = self.execute(id, kind, p, &mut tracker, &cancel).await {
                outcome = Err(err);
                break;
            }
            results.push(p.target.clone());
            self.update(id, |job| job.results = results.clone());
        }

        if outcome.is_ok() {
            let done = tracker.finish();
            self.update(id, |job| job.progress = done);
            self.publish_progress(id, done);
        }
        drop(guard);
        self.finish(id, outcome);
    }

    async fn execute(
        &self,
        id: JobId,
        kind: TransferKind,
        p: &Planned,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let item = &p.item;
        if item.method == Method::Noop {
            return Ok(());
        }

        let displaced = if item.collision == Collision::Replace
            && p.target_physical != item.source_physical
            && exists(&p.target_physical).await
        {
            Some(set_aside(&p.target_physical).await?)
        } else {
            None
        };

        // Record before moving so a crash never leaves an item without one.
        if kind == TransferKind::Trash {
            let entry = p.target.file_name().unwrap_or_default();
            self.inner.trash.write(entry, &item.source).await?;
        }

        let result = match item.method {
            Method::Noop => Ok(()),
            Method::Rename => self.rename(&item.source_physical, &p.target_physical).await,
            Method::CopyProgram { remove_source } => {
                let copied = self.copy_program(id, kind, p, tracker, cancel).await;
                match copied {
                    Ok(()) if remove_source => remove_path(&item.source_physical).await,
                    other => other,
                }
            }
        };

        match &result {
            Ok(()) => {
                let progress = tracker.current();
                self.update(id, |job| job.progress = progress);
                if let Some(aside) = &displaced {
                    if let Err(e) = remove_path(aside).await {
                        tracing::warn!(job = %id, path = %aside.display(), error = %e, "replaced item left behind");
                    }
                }
                if let Some(entry) = &item.restored_entry {
                    self.inner.trash.remove(entry).await?;
                }
                self.inner.partials.remove(&PartialKey {
                    source: item.source_physical.clone(),
                    target_dir: item.target_dir_physical.clone(),
                });
            }
            Err(err) => {
                if kind == TransferKind::Trash {
                    if let Some(entry) = p.target.file_name() {
                        if let Err(e) = self.inner.trash.remove(entry).await {
                            tracing::warn!(job = %id, entry, error = %e, "stale trash record left behind");
                        }
                    }
                }
                if let Some(aside) = &displaced {
                    put_back(aside, &p.target_physical).await;
                } else if err.code() == ErrorCode::TransferCancelled && kind == TransferKind::Copy {
                    self.inner.partials.insert(
                        PartialKey {
                            source: item.source_physical.clone(),
                            target_dir: item.target_dir_physical.clone(),
                        },
                        p.target_physical.clone(),
                    );
                }
            }
        }
        result
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        if exists(to).await {
            return Err(FsError::coded(
                ErrorCode::DestinationAlreadyExists,
                to.display().to_string(),
            ));
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Move, format!("renaming {}", from.display())))
    }

    async fn copy_program(
        &self,
        id: JobId,
        kind: TransferKind,
        p: &Planned,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let settings = &self.inner.settings;
        let failure_code = match kind {
            TransferKind::Copy => ErrorCode::CopyFailed,
            _ => ErrorCode::MoveFailed,
        };

        // A trailing slash copies a directory's contents into the target.
        let mut source_arg = p.item.source_physical.clone().into_os_string();
        if p.item.is_dir {
            source_arg.push("/");
        }

        let mut command = Command::new(&settings.program);
        command
            .args(&settings.extra_args)
            .args(["--archive", "--inplace", "--partial", "--info=progress2"])
            .args(settings.bandwidth_limit_kbps.map(|kbps| format!("--bwlimit={kbps}")))
            .arg(&source_arg)
            .arg(&p.target_physical)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(job = %id, program = %settings.program, source = %p.item.source_physical.display(), target = %p.target_physical.display(), "spawning copy program");
        let mut child = command.spawn().map_err(|e| FsError::Subprocess {
            code: failure_code,
            program: settings.program.clone(),
            status: "spawn failed".into(),
            stderr: e.to_string(),
        })?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = FramedRead::new(stdout, ProgressLineCodec);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(job = %id, error = %e, "failed to kill copy program");
                        }
                        tracing::info!(job = %id, "copy program stopped by cancel");
                        return Err(FsError::code_only(ErrorCode::TransferCancelled));
                    }
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if let Some(sample) = parse_progress_line(&line) {
                                let before = tracker.current();
                                let now = tracker.observe(&sample);
                                if now != before {
                                    self.update(id, |job| job.progress = now);
                                    self.publish_progress(id, now);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(job = %id, error = %e, "reading copy program output");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(job = %id, error = %e, "failed to kill copy program");
                }
                return Err(FsError::code_only(ErrorCode::TransferCancelled));
            }
            status = child.wait() => status.map_err(|e| FsError::Subprocess {
                code: failure_code,
                program: settings.program.clone(),
                status: "wait failed".into(),
                stderr: e.to_string(),
            })?,
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            return Ok(());
        }
        tracing::error!(job = %id, %status, stderr = %stderr.trim(), "copy program failed");
        Err(FsError::Subprocess {
            code: failure_code,
            program: settings.program.clone(),
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Job bookkeeping
    // ------------------------------------------------------------------

    fn update(&self, id: JobId, f: impl FnOnce(&mut TransferJob)) {
        if let Some(entry) = self.inner.jobs.get(&id) {
            entry.state.send_modify(f);
        }
    }

    fn publish_progress(&self, id: JobId, progress: TransferProgress) {
        self.inner.flows.publish(TransferFlow::Progress { id, progress });
    }

    fn finish(&self, id: JobId, outcome: FsResult<()>) {
        let state = match &outcome {
            Ok(()) => TransferState::Done,
            Err(e) if e.code() == ErrorCode::TransferCancelled => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        if let Err(err) = &outcome {
            if state == TransferState::Failed {
                tracing::error!(job = %id, error = %err, "transfer failed");
            }
        }
        self.update(id, |job| {
            job.state = state;
            job.error = outcome.as_ref().err().map(FsError::to_wire);
        });
        if let Some(job) = self.get(id) {
            tracing::info!(job = %id, state = %job.state, "transfer finished");
            self.inner.flows.publish(TransferFlow::Finished { job });
        }
    }
}

fn job_destination(request: &TransferRequest, items: &[Item]) -> LogicalPath {
    match request.kind {
        TransferKind::Restore => items
            .first()
            .map(|i| i.target_dir.clone())
            .unwrap_or_else(|| request.destination.clone()),
        _ => request.destination.clone(),
    }
}

fn item_name(path: &LogicalPath) -> FsResult<String> {
    path.file_name()
        .map(str::to_string)
        .ok_or_else(|| FsError::coded(ErrorCode::OperationNotAllowed, "cannot transfer /"))
}

fn reject_subdir_of_self(source: &Path, target_dir: &Path) -> FsResult<()> {
    if target_dir.starts_with(source) {
        return Err(FsError::coded(
            ErrorCode::SubdirOfSelf,
            format!("{} into {}", source.display(), target_dir.display()),
        ));
    }
    Ok(())
}

/// Move an existing destination to a hidden sibling so a failed replace can
/// put it back.
async fn set_aside(target: &Path) -> FsResult<PathBuf> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = target.with_file_name(format!(".{name}{REPLACE_SUFFIX}"));
    if exists(&aside).await {
        remove_path(&aside).await?;
    }
    tokio::fs::rename(target, &aside)
        .await
        .map_err(|e| FsError::from_io(e, IoOp::Move, format!("setting aside {}", target.display())))?;
    Ok(aside)
}

/// Undo [`set_aside`] after a failed replace, dropping any partial output.
async fn put_back(aside: &Path, target: &Path) {
    if exists(target).await {
        if let Err(e) = remove_path(target).await {
            tracing::warn!(path = %target.display(), error = %e, "partial replacement left behind");
            return;
        }
    }
    match tokio::fs::rename(aside, target).await {
        Ok(()) => tracing::info!(path = %target.display(), "restored replaced item"),
        Err(e) => tracing::error!(path = %target.display(), aside = %aside.display(), error = %e, "could not restore replaced item"),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

async fn remove_path(path: &Path) -> FsResult<()> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| FsError::from_io(e, IoOp::Stat, format!("removing {}", path.display())))?;
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    removed.map_err(|e| FsError::from_io(e, IoOp::Move, format!("removing {}", path.display())))
}

#[cfg(unix)]
async fn device_of(path: &Path) -> FsResult<u64> {
    use std::os::unix::fs::MetadataExt;
    tokio::fs::metadata(path)
        .await
        .map(|m| m.dev())
        .map_err(|e| FsError::from_io(e, IoOp::Stat, format!("device of {}", path.display())))
}

#[cfg(not(unix))]
async fn device_of(_path: &Path) -> FsResult<u64> {
    Ok(0)
}

#[cfg(unix)]
fn same_device(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev()
}

#[cfg(not(unix))]
fn same_device(_: &std::fs::Metadata, _: &std::fs::Metadata) -> bool {
    true
}

/// Bytes used by `path`, recursively, without following symlinks.
pub fn disk_usage(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| disk_usage(&entry.path()))
                .sum()
        })
        .unwrap_or(0)
}

/// Free bytes available to unprivileged users on the filesystem of `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> FsResult<u64> {
    let stat = rustix::fs::statvfs(path).map_err(|e| {
        FsError::from_io(e.into(), IoOp::Stat, format!("statvfs {}", path.display()))
    })?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> FsResult<u64> {
    Ok(u64::MAX)
}
