//! Dependency resolution for `#r` references.
//!
//! Resolves a reference to a loadable package plus its transitive
//! dependencies. Results live for the whole session and are only added to,
//! never changed.

mod cache;
mod resolver;
mod source;
mod version;

pub use cache::ResolutionCache;
pub use resolver::{DependencyResolver, ResolveError, ResolvedDependency};
pub use source::{
    DirectoryPackageSource, MANIFEST_FILE, MemoryPackageSource, PackageManifest, PackageSource,
};
pub use version::{Version, VersionReq};
