//! Containment checks for untrusted paths.
//!
//! [`PathResolver::resolve`] joins an untrusted target onto a physical base
//! and proves the result stays inside it, in two tiers:
//!
//! 1. a textual prefix check on the normalized join, which rejects `..`
//!    traversal without touching the disk;
//! 2. a canonical check on the deepest *existing* ancestor, which rejects
//!    symlinks planted inside the base that point outside it.
//!
//! Paths that do not exist yet are allowed as long as their nearest existing
//! ancestor is inside the base; callers are free to create them.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use hearth_types::ErrorCode;

use crate::error::{FsError, FsResult, IoOp};

/// Lexically normalize a physical path: drop `.`, apply `..` (never above
/// the root), no disk access.
pub fn normalize_physical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.is_absolute() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves untrusted paths against physical bases.
///
/// Cheap to clone; holds only retry settings.
#[derive(Clone, Debug)]
pub struct PathResolver {
    attempts: u32,
    backoff: Duration,
    canonicalize: fn(&Path) -> io::Result<PathBuf>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(5),
            canonicalize,
        }
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the probe retry budget.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    #[cfg(test)]
    fn with_canonicalizer(mut self, f: fn(&Path) -> io::Result<PathBuf>) -> Self {
        self.canonicalize = f;
        self
    }

    /// Resolve `target` (treated as relative, even with a leading `/`)
    /// against `base`.
    ///
    /// Returns the normalized, *unresolved* path on success. Fails with
    /// `escapes-base` when the result would lie outside `base`, textually or
    /// through a symlink. I/O errors other than "not found" while probing are
    /// propagated.
    pub fn resolve(&self, base: &Path, target: &str) -> FsResult<PathBuf> {
        if !base.is_absolute() {
            return Err(FsError::coded(
                ErrorCode::InvalidBase,
                format!("base {} is not absolute", base.display()),
            ));
        }
        if target.contains('\0') {
            return Err(FsError::code_only(ErrorCode::InvalidPath));
        }

        let base = normalize_physical(base);
        let joined = normalize_physical(&base.join(target.trim_start_matches('/')));

        if joined == base {
            return Ok(joined);
        }
        if !joined.starts_with(&base) {
            return Err(FsError::EscapesBase {
                target: target.to_string(),
                base,
                canonical: false,
            });
        }

        self.check_canonical(&base, &joined, target)?;
        Ok(joined)
    }

    /// Walk upward from `joined` to `base` and verify the first existing
    /// ancestor canonicalizes inside the canonical base.
    fn check_canonical(&self, base: &Path, joined: &Path, target: &str) -> FsResult<()> {
        for ancestor in joined.ancestors() {
            if !ancestor.starts_with(base) {
                break;
            }
            let Some(canonical) = self.probe(ancestor, base, target)? else {
                continue;
            };
            // The ancestor exists, so the base does too.
            let canonical_base = self
                .probe(base, base, target)?
                .unwrap_or_else(|| base.to_path_buf());
            if canonical.starts_with(&canonical_base) {
                return Ok(());
            }
            tracing::warn!(
                requested = target,
                base = %base.display(),
                resolved = %canonical.display(),
                "symlink escape rejected"
            );
            return Err(FsError::EscapesBase {
                target: target.to_string(),
                base: base.to_path_buf(),
                canonical: true,
            });
        }
        // Nothing exists up to and including the base.
        Ok(())
    }

    /// Canonicalize one path. `Ok(None)` means it does not exist (or a
    /// component is a regular file, so nothing below it can exist).
    fn probe(&self, path: &Path, base: &Path, target: &str) -> FsResult<Option<PathBuf>> {
        let mut delay = self.backoff;
        for attempt in 1..=self.attempts {
            match (self.canonicalize)(path) {
                Ok(canonical) => return Ok(Some(canonical)),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) if is_transient(&e) => {
                    tracing::debug!(path = %path.display(), attempt, error = %e, "transient probe failure");
                    if attempt < self.attempts {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                }
                Err(e) => {
                    return Err(FsError::from_io(
                        e,
                        IoOp::Stat,
                        format!("probing {}", path.display()),
                    ));
                }
            }
        }
        tracing::warn!(path = %path.display(), "probe retries exhausted");
        Err(FsError::EscapesBase {
            target: target.to_string(),
            base: base.to_path_buf(),
            canonical: true,
        })
    }
}

fn canonicalize(path: &Path) -> io::Result<PathBuf> {
    dunce::canonicalize(path)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let base = dunce::canonicalize(dir.path()).unwrap().join("home");
        std::fs::create_dir(&base).unwrap();
        (dir, base)
    }

    #[test]
    fn base_itself_is_trivial() {
        let (_dir, base) = setup();
        let r = PathResolver::new();
        assert_eq!(r.resolve(&base, "").unwrap(), base);
        assert_eq!(r.resolve(&base, "a/..").unwrap(), base);
    }

    #[test]
    fn traversal_rejected_textually() {
        let (_dir, base) = setup();
        let r = PathResolver::new();
        for target in ["../../etc/passwd", "..", "a/../../x", "/../sibling"] {
            let err = r.resolve(&base, target).unwrap_err();
            assert!(
                matches!(err, FsError::EscapesBase { canonical: false, .. }),
                "{target}: {err}"
            );
        }
    }

    #[test]
    fn leading_slash_stays_inside() {
        let (_dir, base) = setup();
        let resolved = PathResolver::new().resolve(&base, "/etc/passwd").unwrap();
        assert_eq!(resolved, base.join("etc/passwd"));
    }

    #[test]
    fn nonexistent_paths_are_allowed() {
        let (_dir, base) = setup();
        let resolved = PathResolver::new().resolve(&base, "new/deep/file.txt").unwrap();
        assert_eq!(resolved, base.join("new/deep/file.txt"));
    }

    #[test]
    fn missing_base_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("not-yet");
        let resolved = PathResolver::new().resolve(&base, "x").unwrap();
        assert!(resolved.ends_with("not-yet/x"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_rejected() {
        let (dir, base) = setup();
        let outside = dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("evil")).unwrap();

        let r = PathResolver::new();
        let err = r.resolve(&base, "evil").unwrap_err();
        assert!(matches!(err, FsError::EscapesBase { canonical: true, .. }));
        assert_eq!(err.code(), ErrorCode::EscapesBase);

        // Also for not-yet-existing children of the link.
        let err = r.resolve(&base, "evil/new/file").unwrap_err();
        assert!(matches!(err, FsError::EscapesBase { canonical: true, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn internal_symlink_allowed() {
        let (_dir, base) = setup();
        std::fs::create_dir(base.join("real")).unwrap();
        std::os::unix::fs::symlink(base.join("real"), base.join("alias")).unwrap();

        let resolved = PathResolver::new().resolve(&base, "alias/x").unwrap();
        assert_eq!(resolved, base.join("alias/x"));
    }

    #[test]
    fn file_in_the_middle_is_not_an_escape() {
        let (_dir, base) = setup();
        std::fs::write(base.join("file.txt"), "x").unwrap();
        let resolved = PathResolver::new().resolve(&base, "file.txt/child").unwrap();
        assert_eq!(resolved, base.join("file.txt/child"));
    }

    #[test]
    fn relative_base_rejected() {
        let err = PathResolver::new()
            .resolve(Path::new("relative"), "x")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidBase);
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn always_times_out(_: &Path) -> io::Result<PathBuf> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    #[test]
    fn transient_failures_retry_then_escape() {
        let r = PathResolver::new()
            .with_retry(3, Duration::from_millis(1))
            .with_canonicalizer(always_times_out);
        let err = r.resolve(Path::new("/data/home"), "a").unwrap_err();
        assert_eq!(err.code(), ErrorCode::EscapesBase);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    fn denied(_: &Path) -> io::Result<PathBuf> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }

    #[test]
    fn other_probe_errors_propagate() {
        let r = PathResolver::new().with_canonicalizer(denied);
        let err = r.resolve(Path::new("/data/home"), "a").unwrap_err();
        assert!(matches!(err, FsError::Io { .. }));
        assert_eq!(err.code(), ErrorCode::OperationNotAllowed);
    }

    #[test]
    fn normalize_physical_pops() {
        assert_eq!(
            normalize_physical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_physical(Path::new("/../..")), PathBuf::from("/"));
    }
}
