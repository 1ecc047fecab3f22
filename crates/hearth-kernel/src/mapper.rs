//! Logical ↔ physical path mapping.
//!
//! An [`AliasTable`] is an immutable map from logical roots (`/Home`,
//! `/External`, …) to physical directories, matched longest-prefix-first.
//! A [`PathMapper`] is one session's handle on the table: Rewind installs
//! extra aliases (`/Home` → a snapshot's `Home` subtree) by swapping in a
//! whole new table, so readers see either the old table or the new one,
//! never a half-installed alias.
//!
//! Mapping is pure string algebra. Disk checks belong to
//! [`PathResolver`](crate::resolver::PathResolver), which
//! [`PathMapper::resolve`] runs after mapping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_types::{ErrorCode, LogicalPath};
use parking_lot::RwLock;

use crate::error::{FsError, FsResult};
use crate::resolver::{PathResolver, normalize_physical};

/// Immutable logical → physical alias map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    entries: BTreeMap<LogicalPath, PathBuf>,
}

impl AliasTable {
    /// Build a table. Physical roots must be absolute; a later binding for the
    /// same logical root replaces an earlier one.
    pub fn new(bindings: impl IntoIterator<Item = (LogicalPath, PathBuf)>) -> FsResult<Self> {
        let mut entries = BTreeMap::new();
        for (logical, physical) in bindings {
            if logical.is_root() || !physical.is_absolute() {
                return Err(FsError::coded(
                    ErrorCode::InvalidBase,
                    format!("{logical} -> {}", physical.display()),
                ));
            }
            entries.insert(logical, normalize_physical(&physical));
        }
        Ok(Self { entries })
    }

    /// A copy of this table with `logical` bound to `physical`, shadowing
    /// any existing binding for the same root.
    pub fn with_alias(&self, logical: LogicalPath, physical: PathBuf) -> FsResult<Self> {
        let mut next = self.clone();
        let added = Self::new([(logical, physical)])?;
        next.entries.extend(added.entries);
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&LogicalPath, &PathBuf)> {
        self.entries.iter()
    }

    /// Physical root bound to exactly `logical`.
    pub fn get(&self, logical: &LogicalPath) -> Option<&Path> {
        self.entries.get(logical).map(PathBuf::as_path)
    }

    /// Longest logical root containing `logical`.
    pub fn lookup(&self, logical: &LogicalPath) -> Option<(&LogicalPath, &Path)> {
        self.entries
            .iter()
            .filter(|(root, _)| logical.starts_with(root))
            .max_by_key(|(root, _)| root.as_str().len())
            .map(|(root, physical)| (root, physical.as_path()))
    }

    /// Map a logical path to its physical location.
    pub fn to_physical(&self, logical: &LogicalPath) -> FsResult<PathBuf> {
        let (root, physical) = self.lookup(logical).ok_or_else(|| {
            FsError::coded(ErrorCode::InvalidBase, format!("no root for {logical}"))
        })?;
        match logical.strip_prefix(root).unwrap_or_default() {
            "" => Ok(physical.to_path_buf()),
            suffix => Ok(physical.join(suffix.trim_start_matches('/'))),
        }
    }

    /// Map a physical path back to a logical one, choosing the longest
    /// physical root that contains it.
    pub fn to_logical(&self, physical: &Path) -> FsResult<LogicalPath> {
        if !physical.is_absolute() {
            return Err(FsError::coded(
                ErrorCode::PathNotAbsolute,
                physical.display().to_string(),
            ));
        }
        let physical = normalize_physical(physical);
        let (root, base) = self
            .entries
            .iter()
            .filter(|(_, base)| physical.starts_with(base))
            .max_by_key(|(_, base)| base.as_os_str().len())
            .ok_or_else(|| {
                FsError::coded(ErrorCode::InvalidPath, physical.display().to_string())
            })?;

        let rest = physical
            .strip_prefix(base)
            .map_err(|_| FsError::code_only(ErrorCode::InvalidPath))?;
        let rest = rest
            .to_str()
            .ok_or_else(|| FsError::coded(ErrorCode::InvalidPath, "non UTF-8 path"))?;
        Ok(root.join_relative(rest))
    }

    /// Map and then validate containment within the matching physical root.
    pub fn resolve(&self, resolver: &PathResolver, logical: &LogicalPath) -> FsResult<PathBuf> {
        let (root, base) = self.lookup(logical).ok_or_else(|| {
            FsError::coded(ErrorCode::InvalidBase, format!("no root for {logical}"))
        })?;
        let suffix = logical.strip_prefix(root).unwrap_or_default();
        resolver.resolve(base, suffix)
    }
}

/// A session's view of the alias table.
///
/// Not a process-wide singleton: each browsing session owns its own mapper
/// (see [`PathMapper::fork`]), so concurrent Rewind sessions never collide.
#[derive(Debug)]
pub struct PathMapper {
    defaults: Arc<AliasTable>,
    current: RwLock<Arc<AliasTable>>,
}

impl PathMapper {
    pub fn new(defaults: AliasTable) -> Self {
        let defaults = Arc::new(defaults);
        Self {
            current: RwLock::new(defaults.clone()),
            defaults,
        }
    }

    /// A fresh session over the same default roots, with no aliases.
    pub fn fork(&self) -> Self {
        Self {
            defaults: self.defaults.clone(),
            current: RwLock::new(self.defaults.clone()),
        }
    }

    /// The table currently in effect. Callers that need several consistent
    /// lookups should take one snapshot and use it throughout.
    pub fn snapshot(&self) -> Arc<AliasTable> {
        self.current.read().clone()
    }

    pub fn defaults(&self) -> &AliasTable {
        &self.defaults
    }

    /// True while any alias shadows the default table.
    pub fn has_aliases(&self) -> bool {
        *self.snapshot() != *self.defaults
    }

    /// Replace all session aliases with `aliases`, atomically.
    pub fn install(&self, aliases: impl IntoIterator<Item = (LogicalPath, PathBuf)>) -> FsResult<()> {
        let mut next = (*self.defaults).clone();
        for (logical, physical) in aliases {
            next = next.with_alias(logical, physical)?;
        }
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    /// Drop every session alias, restoring the default mapping.
    pub fn clear(&self) {
        *self.current.write() = self.defaults.clone();
    }

    pub fn to_physical(&self, logical: &LogicalPath) -> FsResult<PathBuf> {
        self.snapshot().to_physical(logical)
    }

    /// Name `physical` through the session table. While a Rewind alias is
    /// installed, snapshot content is named by its aliased path (`/Home/x`),
    /// not its `/Backups/...` location; use [`Self::canonical`] or
    /// [`Self::defaults`] for the latter.
    pub fn to_logical(&self, physical: &Path) -> FsResult<LogicalPath> {
        self.snapshot().to_logical(physical)
    }

    pub fn resolve(&self, resolver: &PathResolver, logical: &LogicalPath) -> FsResult<PathBuf> {
        self.snapshot().resolve(resolver, logical)
    }

    /// The same location named through the default table, e.g.
    /// `/Home/a` → `/Backups/<repo>/<snapshot>/Home/a` while a Rewind alias
    /// is active. Identity when no alias applies.
    pub fn canonical(&self, logical: &LogicalPath) -> FsResult<LogicalPath> {
        let table = self.snapshot();
        if Arc::ptr_eq(&table, &self.defaults) {
            return Ok(logical.clone());
        }
        self.defaults.to_logical(&table.to_physical(logical)?)
    }

    /// Parse an untrusted logical path string and resolve it.
    pub fn resolve_str(&self, resolver: &PathResolver, raw: &str) -> FsResult<PathBuf> {
        let logical = LogicalPath::parse(raw).map_err(FsError::from)?;
        self.resolve(resolver, &logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp(s: &str) -> LogicalPath {
        LogicalPath::parse(s).unwrap()
    }

    fn defaults() -> AliasTable {
        AliasTable::new([
            (lp("/Home"), PathBuf::from("/data/home")),
            (lp("/Backups"), PathBuf::from("/data/backups")),
            (lp("/External"), PathBuf::from("/media")),
        ])
        .unwrap()
    }

    #[test]
    fn exact_root_maps_to_physical_root() {
        let t = defaults();
        assert_eq!(t.to_physical(&lp("/Home")).unwrap(), PathBuf::from("/data/home"));
        assert_eq!(
            t.to_physical(&lp("/Home/Documents/a.txt")).unwrap(),
            PathBuf::from("/data/home/Documents/a.txt")
        );
    }

    #[test]
    fn unknown_root_is_invalid_base() {
        let t = defaults();
        assert_eq!(t.to_physical(&lp("/Nope/x")).unwrap_err().code(), ErrorCode::InvalidBase);
        assert_eq!(t.to_physical(&lp("/Homework")).unwrap_err().code(), ErrorCode::InvalidBase);
        assert_eq!(t.to_physical(&LogicalPath::root()).unwrap_err().code(), ErrorCode::InvalidBase);
    }

    #[test]
    fn to_logical_errors() {
        let t = defaults();
        assert_eq!(
            t.to_logical(Path::new("relative")).unwrap_err().code(),
            ErrorCode::PathNotAbsolute
        );
        assert_eq!(
            t.to_logical(Path::new("/etc/passwd")).unwrap_err().code(),
            ErrorCode::InvalidPath
        );
    }

    #[test]
    fn round_trip_for_every_alias() {
        let t = defaults();
        for (root, _) in t.entries() {
            for suffix in ["", "/a", "/a/b c/d.txt", "/ünïcode/x"] {
                let p = lp(&format!("{root}{suffix}"));
                let back = t.to_logical(&t.to_physical(&p).unwrap()).unwrap();
                assert_eq!(back, p);
            }
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let t = defaults()
            .with_alias(lp("/External/usb"), PathBuf::from("/mnt/usb"))
            .unwrap();
        assert_eq!(
            t.to_physical(&lp("/External/usb/x")).unwrap(),
            PathBuf::from("/mnt/usb/x")
        );
        assert_eq!(
            t.to_physical(&lp("/External/other")).unwrap(),
            PathBuf::from("/media/other")
        );
        assert_eq!(t.to_logical(Path::new("/mnt/usb/x")).unwrap(), lp("/External/usb/x"));
    }

    #[test]
    fn session_alias_shadows_and_clears() {
        let mapper = PathMapper::new(defaults());
        let snapshot_home = PathBuf::from("/data/backups/repo/2024-01-01T00:00:00Z/Home");
        mapper.install([(lp("/Home"), snapshot_home.clone())]).unwrap();
        assert!(mapper.has_aliases());
        assert_eq!(mapper.to_physical(&lp("/Home/a")).unwrap(), snapshot_home.join("a"));
        assert_eq!(mapper.to_logical(&snapshot_home.join("a")).unwrap(), lp("/Home/a"));

        // Other sessions are unaffected.
        let other = mapper.fork();
        assert_eq!(other.to_physical(&lp("/Home/a")).unwrap(), PathBuf::from("/data/home/a"));

        mapper.clear();
        assert!(!mapper.has_aliases());
        assert_eq!(mapper.to_physical(&lp("/Home/a")).unwrap(), PathBuf::from("/data/home/a"));
    }

    #[test]
    fn canonical_names_the_snapshot_location() {
        let mapper = PathMapper::new(defaults());
        assert_eq!(mapper.canonical(&lp("/Home/a")).unwrap(), lp("/Home/a"));

        mapper
            .install([(lp("/Home"), PathBuf::from("/data/backups/r/s/Home"))])
            .unwrap();
        assert_eq!(
            mapper.canonical(&lp("/Home/a")).unwrap(),
            lp("/Backups/r/s/Home/a")
        );
        assert_eq!(mapper.canonical(&lp("/External/x")).unwrap(), lp("/External/x"));
    }

    #[test]
    fn snapshot_content_has_a_session_name_and_a_default_name() {
        let mapper = PathMapper::new(defaults());
        let file = PathBuf::from("/data/backups/r/s/Home/x");
        assert_eq!(mapper.to_logical(&file).unwrap(), lp("/Backups/r/s/Home/x"));

        mapper
            .install([(lp("/Home"), PathBuf::from("/data/backups/r/s/Home"))])
            .unwrap();
        assert_eq!(mapper.to_logical(&file).unwrap(), lp("/Home/x"));
        assert_eq!(mapper.defaults().to_logical(&file).unwrap(), lp("/Backups/r/s/Home/x"));
        assert_eq!(
            mapper.canonical(&mapper.to_logical(&file).unwrap()).unwrap(),
            lp("/Backups/r/s/Home/x")
        );
    }

    #[test]
    fn snapshot_is_stable_across_install() {
        let mapper = PathMapper::new(defaults());
        let before = mapper.snapshot();
        mapper
            .install([(lp("/Home"), PathBuf::from("/elsewhere"))])
            .unwrap();
        assert_eq!(before.to_physical(&lp("/Home")).unwrap(), PathBuf::from("/data/home"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let mapper = PathMapper::new(defaults());
        let resolver = PathResolver::new();
        // Parsing normalizes `..` away, so traversal can only change roots.
        let err = mapper.resolve_str(&resolver, "/Home/../../etc").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidBase);
        let err = mapper.resolve_str(&resolver, "Home/x").unwrap_err();
        assert_eq!(err.code(), ErrorCode::PathNotAbsolute);
    }

    #[test]
    fn relative_physical_rejected() {
        let err = AliasTable::new([(lp("/Home"), PathBuf::from("home"))]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidBase);
    }
}
