//! Workbook configuration and directory layout.
//!
//! Provides consistent paths and tunables shared by the CLI and the server.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "FOLIO_WORKER_PATH";

/// Environment variable listing extra package directories (path-separator delimited).
pub const PACKAGE_PATH_ENV: &str = "FOLIO_PACKAGE_PATH";

/// Where cells are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// A separate `folio-worker` process per execution context.
    Process,
    /// The same serve loop on a thread of the host process.
    InProcess,
}

/// Configuration for a workbook session.
#[derive(Debug, Clone)]
pub struct WorkbookConfig {
    /// Directories searched for packages, in priority order.
    pub package_paths: Vec<PathBuf>,

    /// File persisting the reference → location map across sessions.
    pub resolution_cache: Option<PathBuf>,

    /// Explicit worker binary; discovered when `None`.
    pub worker_path: Option<PathBuf>,

    /// How long the worker gets to acknowledge an abort before it is killed.
    pub abort_grace: Duration,

    /// Execution isolation mode.
    pub isolation: Isolation,

    /// Largest IPC frame accepted from or sent to a worker.
    pub max_message_size: usize,
}

impl Default for WorkbookConfig {
    fn default() -> Self {
        Self {
            package_paths: default_package_dir().into_iter().collect(),
            resolution_cache: None,
            worker_path: None,
            abort_grace: Duration::from_secs(2),
            isolation: Isolation::Process,
            max_message_size: crate::ipc::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl WorkbookConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(paths) = std::env::var_os(PACKAGE_PATH_ENV) {
            let mut extra: Vec<PathBuf> = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            extra.append(&mut config.package_paths);
            config.package_paths = extra;
        }

        if let Some(path) = std::env::var_os(WORKER_PATH_ENV) {
            config.worker_path = Some(PathBuf::from(path));
        }

        config
    }

    /// Run cells on a host thread instead of a worker process.
    pub fn in_process(mut self) -> Self {
        self.isolation = Isolation::InProcess;
        self
    }

    /// Add a package directory with the highest priority.
    pub fn with_package_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.package_paths.insert(0, path.into());
        self
    }

    /// Use the given workbook directories for persisted state.
    pub fn with_dirs(mut self, dirs: &WorkbookDirs) -> Self {
        self.resolution_cache = Some(dirs.resolution_cache_file());
        self
    }
}

/// User-level package directory (`~/.cache/folio/packages` on Linux).
pub fn default_package_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("folio").join("packages"))
}

/// Directory structure for a workbook.
///
/// ```text
/// <root>/
/// └── .folio/
///     └── cache/   # resolution cache
/// ```
#[derive(Debug, Clone)]
pub struct WorkbookDirs {
    /// The `.folio` directory itself.
    pub folio_dir: PathBuf,

    /// Cache directory for persisted resolution results.
    pub cache_dir: PathBuf,
}

impl WorkbookDirs {
    /// Create the directory structure under `root`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_root(root: &Path) -> Result<Self> {
        let folio_dir = root.join(".folio");
        let cache_dir = folio_dir.join("cache");

        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            folio_dir,
            cache_dir,
        })
    }

    /// Path of the persisted resolution cache.
    pub fn resolution_cache_file(&self) -> PathBuf {
        self.cache_dir.join("resolutions.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_created() {
        let temp = tempfile::TempDir::new().unwrap();
        let dirs = WorkbookDirs::from_root(temp.path()).unwrap();

        assert!(dirs.cache_dir.is_dir());
        assert_eq!(dirs.folio_dir, temp.path().join(".folio"));
        assert_eq!(
            dirs.resolution_cache_file(),
            temp.path().join(".folio/cache/resolutions.json")
        );
    }

    #[test]
    fn test_builder_helpers() {
        let config = WorkbookConfig::default()
            .in_process()
            .with_package_path("/tmp/pkgs");

        assert_eq!(config.isolation, Isolation::InProcess);
        assert_eq!(config.package_paths[0], PathBuf::from("/tmp/pkgs"));
        assert_eq!(config.abort_grace, Duration::from_secs(2));
    }
}
