//! Single-writer path locks.
//!
//! A job locks every physical path it writes. Two lock sets conflict when any
//! pair of their paths is equal or one is an ancestor of the other. Locks are
//! released when the [`PathLockGuard`] drops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_types::JobId;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Equal, or one contains the other.
pub fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Collapse a job's paths: drop duplicates and anything already covered by an
/// ancestor in the same set.
pub fn collapse(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_key(|p| p.components().count());
    let mut kept: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path);
        }
    }
    kept
}

#[derive(Debug)]
struct Held {
    job: JobId,
    paths: Vec<PathBuf>,
}

#[derive(Debug)]
struct Inner {
    held: Mutex<Vec<Held>>,
    released: watch::Sender<u64>,
}

/// The set of path locks held by running jobs.
#[derive(Debug, Clone)]
pub struct PathLockSet {
    inner: Arc<Inner>,
}

/// Returned when a lock attempt overlaps a job that already holds a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub holder: JobId,
    pub path: PathBuf,
}

impl Default for PathLockSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PathLockSet {
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(Vec::new()),
                released,
            }),
        }
    }

    /// Take every path in `paths` for `job`, or none of them.
    pub fn try_acquire(
        &self,
        job: JobId,
        paths: Vec<PathBuf>,
    ) -> Result<PathLockGuard, LockConflict> {
        let paths = collapse(paths);
        let mut held = self.inner.held.lock();
        for entry in held.iter() {
            for mine in &paths {
                if let Some(theirs) = entry.paths.iter().find(|p| overlaps(p, mine)) {
                    return Err(LockConflict {
                        holder: entry.job,
                        path: theirs.clone(),
                    });
                }
            }
        }
        held.push(Held { job, paths });
        Ok(PathLockGuard {
            set: self.clone(),
            job,
        })
    }

    /// True if `path` overlaps any held lock.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.inner
            .held
            .lock()
            .iter()
            .any(|h| h.paths.iter().any(|p| overlaps(p, path)))
    }

    pub fn holders(&self) -> Vec<JobId> {
        self.inner.held.lock().iter().map(|h| h.job).collect()
    }

    /// A receiver that resolves its next `changed()` after any release that
    /// happens from now on. Take it *before* a failed attempt so no release
    /// is missed.
    pub fn subscribe_releases(&self) -> watch::Receiver<u64> {
        self.inner.released.subscribe()
    }

    fn release(&self, job: JobId) {
        self.inner.held.lock().retain(|h| h.job != job);
        self.inner.released.send_modify(|generation| *generation += 1);
        tracing::debug!(%job, "path locks released");
    }
}

/// Holds a job's path locks until dropped.
#[derive(Debug)]
pub struct PathLockGuard {
    set: PathLockSet,
    job: JobId,
}

impl PathLockGuard {
    pub fn job(&self) -> JobId {
        self.job
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.set.release(self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn overlap_is_segment_aware() {
        assert!(overlaps(&p("/a/b"), &p("/a")));
        assert!(overlaps(&p("/a"), &p("/a/b/c")));
        assert!(overlaps(&p("/a"), &p("/a")));
        assert!(!overlaps(&p("/a/b"), &p("/a/bc")));
    }

    #[test]
    fn collapse_keeps_ancestors() {
        let kept = collapse(vec![p("/a/b/c"), p("/x"), p("/a/b"), p("/x")]);
        assert_eq!(kept, vec![p("/x"), p("/a/b")]);
    }

    #[test]
    fn conflicting_jobs_are_rejected() {
        let locks = PathLockSet::new();
        let (j1, j2, j3) = (JobId::new(), JobId::new(), JobId::new());

        let g1 = locks.try_acquire(j1, vec![p("/d/home/a")]).unwrap();
        let conflict = locks.try_acquire(j2, vec![p("/d/home/a/inner")]).unwrap_err();
        assert_eq!(conflict.holder, j1);

        // Disjoint paths proceed in parallel.
        let _g3 = locks.try_acquire(j3, vec![p("/d/home/b")]).unwrap();
        assert!(locks.is_locked(&p("/d/home/a/x")));

        drop(g1);
        assert!(!locks.is_locked(&p("/d/home/a/x")));
        locks.try_acquire(j2, vec![p("/d/home/a/inner")]).unwrap();
    }

    #[test]
    fn failed_attempt_takes_nothing() {
        let locks = PathLockSet::new();
        let _g = locks.try_acquire(JobId::new(), vec![p("/b")]).unwrap();
        assert!(locks
            .try_acquire(JobId::new(), vec![p("/a"), p("/b/c")])
            .is_err());
        assert!(!locks.is_locked(&p("/a")));
        assert_eq!(locks.holders().len(), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = PathLockSet::new();
        let guard = locks.try_acquire(JobId::new(), vec![p("/a")]).unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let job = JobId::new();
                loop {
                    let mut released = locks.subscribe_releases();
                    match locks.try_acquire(job, vec![p("/a/b")]) {
                        Ok(g) => return g.job(),
                        Err(_) => {
                            let _ = released.changed().await;
                        }
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        let job = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
        assert!(!job.to_string().is_empty());
    }
}
