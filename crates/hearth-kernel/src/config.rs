//! Daemon configuration.
//!
//! Loaded from TOML, every field optional:
//!
//! ```toml
//! data_directory = "~/.local/share/hearth"
//! repository_marker = "Hearth Backup.backup"
//!
//! [transfer]
//! program = "rsync"
//! space_reserve_bytes = 1073741824
//!
//! [roots]
//! "/External" = "/media"
//!
//! [[repositories]]
//! id = "k1a2b3"
//! path = "/External/usb/Hearth Backup.backup"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hearth_types::{LogicalPath, Repository};
use serde::Deserialize;

/// Logical base directories and their default location under `data_directory`.
pub const DEFAULT_ROOTS: &[(&str, &str)] = &[
    ("/Home", "home"),
    ("/Trash", "trash"),
    ("/Apps", "app-data"),
    ("/External", "external"),
    ("/Backups", "backups"),
    ("/Network", "network"),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid root binding {0}")]
    InvalidRoot(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct HearthConfig {
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Explicit `logical → physical` overrides for base directories.
    #[serde(default)]
    pub roots: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logical roots watched for changes.
    #[serde(default = "default_watch")]
    pub watch: Vec<String>,
    #[serde(default = "default_repository_marker")]
    pub repository_marker: String,
    /// Locally configured backup repositories.
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default = "default_max_directory_listing")]
    pub max_directory_listing: usize,
    #[serde(default = "default_hidden_names")]
    pub hidden_names: Vec<String>,
    #[serde(default = "default_hidden_extensions")]
    pub hidden_extensions: Vec<String>,
    /// Where favorites are persisted. Defaults to `favorites.json` in the data directory.
    #[serde(default)]
    pub favorites_file: Option<PathBuf>,
    #[serde(default = "default_favorites")]
    pub default_favorites: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Passed before the standard flags, so a wrapper script can be the
    /// first argument of an interpreter `program`.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Free space that must remain on the destination after a copy.
    #[serde(default = "default_space_reserve")]
    pub space_reserve_bytes: u64,
    /// Always copy then delete for moves, even on the same filesystem.
    #[serde(default)]
    pub force_copy_move: bool,
    #[serde(default)]
    pub bandwidth_limit_kbps: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub path: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            extra_args: Vec::new(),
            space_reserve_bytes: default_space_reserve(),
            force_copy_move: false,
            bandwidth_limit_kbps: None,
        }
    }
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            roots: BTreeMap::new(),
            transfer: TransferConfig::default(),
            watch: default_watch(),
            repository_marker: default_repository_marker(),
            repositories: Vec::new(),
            max_directory_listing: default_max_directory_listing(),
            hidden_names: default_hidden_names(),
            hidden_extensions: default_hidden_extensions(),
            favorites_file: None,
            default_favorites: default_favorites(),
        }
    }
}

fn default_data_directory() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("hearth"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/hearth"))
}

fn default_watch() -> Vec<String> {
    vec!["/Home".into(), "/Trash".into(), "/Apps".into()]
}

fn default_repository_marker() -> String {
    "Hearth Backup.backup".to_string()
}

fn default_max_directory_listing() -> usize {
    10_000
}

fn default_hidden_names() -> Vec<String> {
    vec![".DS_Store".into(), ".directory".into()]
}

/// Suffix of a destination set aside while a replacing transfer runs.
pub const REPLACE_SUFFIX: &str = ".hearth-replace";

fn default_hidden_extensions() -> Vec<String> {
    vec![".hearth-upload".into(), REPLACE_SUFFIX.into()]
}

fn default_favorites() -> Vec<String> {
    ["/Home/Downloads", "/Home/Documents", "/Home/Photos", "/Home/Videos"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_program() -> String {
    "rsync".to_string()
}

fn default_space_reserve() -> u64 {
    1024 * 1024 * 1024
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

impl HearthConfig {
    /// `$XDG_CONFIG_HOME/hearth/hearth.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hearth").join("hearth.toml"))
    }

    /// A config rooted at `data_directory` with everything else defaulted.
    pub fn with_data_directory(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: HearthConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.data_directory = expand(&config.data_directory);
        for physical in config.roots.values_mut() {
            *physical = expand(physical);
        }
        config.favorites_file = config.favorites_file.as_deref().map(expand);
        Ok(config)
    }

    /// Load from `path`, or from [`Self::default_path`]. A missing file at
    /// the default location yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (expand(p), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                tracing::info!(path = %path.display(), "loaded config");
                Self::from_toml_str(&raw, &path)
            }
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    /// Every base directory binding, defaults first, overrides applied.
    pub fn root_bindings(&self) -> Result<Vec<(LogicalPath, PathBuf)>, ConfigError> {
        let mut bindings: BTreeMap<LogicalPath, PathBuf> = DEFAULT_ROOTS
            .iter()
            .map(|(logical, dir)| {
                let logical = LogicalPath::parse(logical)
                    .map_err(|_| ConfigError::InvalidRoot((*logical).to_string()))?;
                Ok((logical, self.data_directory.join(dir)))
            })
            .collect::<Result<_, ConfigError>>()?;

        for (logical, physical) in &self.roots {
            let parsed = LogicalPath::parse(logical)
                .map_err(|_| ConfigError::InvalidRoot(logical.clone()))?;
            if parsed.is_root() || !physical.is_absolute() {
                return Err(ConfigError::InvalidRoot(format!(
                    "{logical} = {}",
                    physical.display()
                )));
            }
            bindings.insert(parsed, physical.clone());
        }
        Ok(bindings.into_iter().collect())
    }

    /// Physical location of a default base directory after overrides.
    pub fn physical_root(&self, logical: &str) -> Option<PathBuf> {
        self.roots.get(logical).cloned().or_else(|| {
            DEFAULT_ROOTS
                .iter()
                .find(|(l, _)| *l == logical)
                .map(|(_, dir)| self.data_directory.join(dir))
        })
    }

    pub fn trash_meta_dir(&self) -> PathBuf {
        self.data_directory.join("trash-meta")
    }

    pub fn favorites_path(&self) -> PathBuf {
        self.favorites_file
            .clone()
            .unwrap_or_else(|| self.data_directory.join("favorites.json"))
    }

    /// Configured repositories with valid logical paths; others are skipped.
    pub fn registered_repositories(&self) -> Vec<Repository> {
        self.repositories
            .iter()
            .filter_map(|r| match LogicalPath::parse(&r.path) {
                Ok(path) => Some(Repository {
                    id: r.id.clone(),
                    path,
                }),
                Err(code) => {
                    tracing::warn!(id = %r.id, path = %r.path, %code, "ignoring repository");
                    None
                }
            })
            .collect()
    }
}
