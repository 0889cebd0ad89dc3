//! Package sources and manifests.
//!
//! # Directory layout
//!
//! ```text
//! <root>/
//! └── mathx/
//!     ├── 1.0.0/
//!     │   └── package.toml
//!     └── 1.2.0/
//!         ├── package.toml
//!         └── libmathx.so
//! ```
//!
//! # Manifest
//!
//! ```toml
//! name = "mathx"
//! version = "1.2.0"
//! native = ["libmathx.so"]
//!
//! [dependencies]
//! units = "^0.3"
//!
//! [exports]
//! pi = 3
//! unit = "radian"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::resolver::ResolveError;
use super::version::Version;
use crate::compile::Constant;

/// Name of the manifest file inside a package directory.
pub const MANIFEST_FILE: &str = "package.toml";

/// Parsed `package.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: Version,

    /// Native library file names, relative to the package directory.
    #[serde(default)]
    pub native: Vec<String>,

    /// Dependency name → version constraint.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(default)]
    pub exports: BTreeMap<String, Constant>,

    /// Directory the manifest was loaded from.
    #[serde(skip)]
    pub location: PathBuf,
}

impl PackageManifest {
    /// Load `<dir>/package.toml`.
    pub fn load(dir: &Path) -> Result<Self, ResolveError> {
        let path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|e| ResolveError::InvalidManifest {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut manifest = Self::parse(&text).map_err(|message| ResolveError::InvalidManifest {
            path: path.display().to_string(),
            message,
        })?;
        manifest.location = dir.to_path_buf();
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let manifest: PackageManifest = toml::from_str(text).map_err(|e| e.to_string())?;
        if !crate::compile::is_identifier(&manifest.name) {
            return Err(format!("`{}` is not a valid package name", manifest.name));
        }
        if let Some(bad) = manifest.native.iter().find(|n| n.contains(['/', '\\'])) {
            return Err(format!("native library `{}` must be a plain file name", bad));
        }
        Ok(manifest)
    }

    /// `name@version@location`, unique per physical package.
    pub fn identity(&self) -> String {
        format!(
            "{}@{}@{}",
            self.name.to_lowercase(),
            self.version,
            self.location.display()
        )
    }
}

/// Where packages come from.
///
/// This is the only contract between the resolver and a package store,
/// be it a local directory tree or a network mirror.
pub trait PackageSource: Send + Sync {
    /// Every available version of `name`. `hints` are extra roots searched first.
    fn candidates(&self, name: &str, hints: &[PathBuf]) -> Result<Vec<PackageManifest>, ResolveError>;

    /// The package stored in `dir`.
    fn manifest_at(&self, dir: &Path) -> Result<PackageManifest, ResolveError> {
        PackageManifest::load(dir)
    }
}

/// Packages laid out as `<root>/<name>/<version>/package.toml`.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPackageSource {
    roots: Vec<PathBuf>,
}

impl DirectoryPackageSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl PackageSource for DirectoryPackageSource {
    fn candidates(&self, name: &str, hints: &[PathBuf]) -> Result<Vec<PackageManifest>, ResolveError> {
        let wanted = name.to_lowercase();
        let mut found = Vec::new();

        for root in hints.iter().chain(self.roots.iter()) {
            let Ok(entries) = fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().to_lowercase() != wanted {
                    continue;
                }
                let Ok(versions) = fs::read_dir(entry.path()) else {
                    continue;
                };
                for version_dir in versions.flatten() {
                    let dir = version_dir.path();
                    if !dir.join(MANIFEST_FILE).is_file() {
                        continue;
                    }
                    match PackageManifest::load(&dir) {
                        Ok(manifest) if manifest.name.to_lowercase() == wanted => {
                            found.push(manifest);
                        }
                        Ok(manifest) => tracing::warn!(
                            "Ignoring {}: manifest names `{}`, expected `{}`",
                            dir.display(),
                            manifest.name,
                            name
                        ),
                        Err(e) => tracing::warn!("Ignoring {}: {}", dir.display(), e),
                    }
                }
            }
        }

        // Directory iteration order is platform-dependent.
        found.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(found)
    }
}

/// In-memory package source, counting how often it is consulted.
#[derive(Debug, Default)]
pub struct MemoryPackageSource {
    packages: Mutex<Vec<PackageManifest>>,
    calls: AtomicUsize,
    delay: Option<std::time::Duration>,
}

impl MemoryPackageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every lookup, to widen race windows in tests.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add a package. `location` defaults to `/memory/<name>/<version>`.
    pub fn add(&self, mut manifest: PackageManifest) {
        if manifest.location.as_os_str().is_empty() {
            manifest.location =
                PathBuf::from(format!("/memory/{}/{}", manifest.name, manifest.version));
        }
        self.packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(manifest);
    }

    /// Add a package from manifest text.
    pub fn add_toml(&self, text: &str) -> Result<(), String> {
        self.add(PackageManifest::parse(text)?);
        Ok(())
    }

    /// Number of `candidates`/`manifest_at` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
    }
}

impl PackageSource for MemoryPackageSource {
    fn candidates(&self, name: &str, _hints: &[PathBuf]) -> Result<Vec<PackageManifest>, ResolveError> {
        self.begin_call();
        let wanted = name.to_lowercase();
        Ok(self
            .packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.name.to_lowercase() == wanted)
            .cloned()
            .collect())
    }

    fn manifest_at(&self, dir: &Path) -> Result<PackageManifest, ResolveError> {
        self.begin_call();
        self.packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.location == dir)
            .cloned()
            .ok_or_else(|| ResolveError::Unresolvable {
                reference: dir.display().to_string(),
                reason: "no package at this location".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_package(root: &Path, name: &str, version: &str, extra: &str) -> PathBuf {
        let dir = root.join(name).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!("name = \"{}\"\nversion = \"{}\"\n{}", name, version, extra),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_manifest_parse() {
        let manifest = PackageManifest::parse(
            "name = \"mathx\"\nversion = \"1.2\"\nnative = [\"libm.so\"]\n\n[dependencies]\nunits = \"^0.3\"\n\n[exports]\npi = 3\nunit = \"rad\"\nexact = false\n",
        )
        .unwrap();

        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.dependencies["units"], "^0.3");
        assert_eq!(manifest.exports["pi"], Constant::Int(3));
        assert_eq!(manifest.exports["unit"], Constant::Str("rad".into()));
        assert_eq!(manifest.exports["exact"], Constant::Bool(false));
    }

    #[test]
    fn test_manifest_rejects_bad_input() {
        assert!(PackageManifest::parse("name = \"a-b\"\nversion = \"1.0.0\"").is_err());
        assert!(PackageManifest::parse("name = \"ab\"\nversion = \"x\"").is_err());
        assert!(
            PackageManifest::parse("name = \"ab\"\nversion = \"1.0.0\"\nnative = [\"../evil.so\"]")
                .is_err()
        );
    }

    #[test]
    fn test_directory_source_lists_versions() {
        let temp = tempfile::TempDir::new().unwrap();
        write_package(temp.path(), "mathx", "1.0.0", "");
        write_package(temp.path(), "mathx", "1.2.0", "");
        write_package(temp.path(), "other", "1.0.0", "");

        let source = DirectoryPackageSource::new(vec![temp.path().to_path_buf()]);
        let found = source.candidates("MathX", &[]).unwrap();
        let versions: Vec<String> = found.iter().map(|m| m.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.2.0"]);
        assert!(found.iter().all(|m| m.location.starts_with(temp.path())));
    }

    #[test]
    fn test_directory_source_hints_and_missing_roots() {
        let temp = tempfile::TempDir::new().unwrap();
        let hinted = tempfile::TempDir::new().unwrap();
        write_package(hinted.path(), "geo", "0.1.0", "");

        let source = DirectoryPackageSource::new(vec![
            temp.path().join("does-not-exist"),
            temp.path().to_path_buf(),
        ]);
        assert!(source.candidates("geo", &[]).unwrap().is_empty());
        assert_eq!(
            source
                .candidates("geo", &[hinted.path().to_path_buf()])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_manifest_at() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_package(temp.path(), "geo", "0.1.0", "[exports]\norigin = 0\n");
        let manifest = DirectoryPackageSource::default().manifest_at(&dir).unwrap();
        assert_eq!(manifest.location, dir);
        assert!(DirectoryPackageSource::default()
            .manifest_at(temp.path())
            .is_err());
    }
}
