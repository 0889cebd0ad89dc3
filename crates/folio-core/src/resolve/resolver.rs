//! Session-scoped dependency resolver.
//!
//! Resolutions are memoized per session under the reference's normalized
//! key, and concurrent requests for the same key share one resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::cache::ResolutionCache;
use super::source::{PackageManifest, PackageSource};
use super::version::{Version, VersionReq};
use crate::compile::{Constant, DependencyReference};

/// Errors raised while resolving a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No module matching the reference could be located.
    #[error("cannot resolve `{reference}`: {reason}")]
    Unresolvable { reference: String, reason: String },

    /// Several candidates match and nothing disambiguates them.
    #[error("`{reference}` is ambiguous: {} candidates match ({})", .candidates.len(), .candidates.join(", "))]
    AmbiguousVersion {
        reference: String,
        candidates: Vec<String>,
    },

    /// A manifest exists but cannot be read.
    #[error("invalid package manifest {path}: {message}")]
    InvalidManifest { path: String, message: String },

    /// The package source itself failed.
    #[error("package source error: {0}")]
    Source(String),
}

/// A loadable module and everything it needs.
#[derive(Debug)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: Version,
    pub location: PathBuf,
    pub exports: BTreeMap<String, Constant>,

    /// Absolute paths of native libraries shipped with the package.
    pub native_libraries: Vec<PathBuf>,

    /// Direct dependencies.
    pub dependencies: Vec<Arc<ResolvedDependency>>,

    /// Every transitive dependency, dependency-first, without `self`.
    pub closure: Vec<Arc<ResolvedDependency>>,
}

impl ResolvedDependency {
    /// `name@version@location`, unique per physical package.
    pub fn identity(&self) -> String {
        format!(
            "{}@{}@{}",
            self.name.to_lowercase(),
            self.version,
            self.location.display()
        )
    }

    /// The closure followed by `self`: a valid load order.
    pub fn load_order(self: &Arc<Self>) -> Vec<Arc<ResolvedDependency>> {
        let mut order = self.closure.clone();
        order.push(Arc::clone(self));
        order
    }
}

impl fmt::Display for ResolvedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

type SharedResolution = Shared<BoxFuture<'static, Result<Arc<ResolvedDependency>, ResolveError>>>;

#[derive(Default)]
struct SessionState {
    /// Reference key → memoized result.
    resolved: FxHashMap<String, Arc<ResolvedDependency>>,
    /// Reference key → resolution in progress.
    in_flight: FxHashMap<String, SharedResolution>,
    /// Lowercase name → every version resolved so far.
    modules: FxHashMap<String, Vec<Arc<ResolvedDependency>>>,
    /// Location → tick of its last resolution.
    recency: FxHashMap<PathBuf, u64>,
    tick: u64,
}

impl SessionState {
    fn touch(&mut self, location: &Path) {
        self.tick += 1;
        self.recency.insert(location.to_path_buf(), self.tick);
    }

    /// Most recently resolved module of `name` satisfying `req`.
    fn reusable(&self, name: &str, req: &VersionReq) -> Option<Arc<ResolvedDependency>> {
        self.modules
            .get(&name.to_lowercase())?
            .iter()
            .filter(|module| req.matches(&module.version))
            .max_by_key(|module| self.recency.get(&module.location).copied().unwrap_or(0))
            .cloned()
    }

    fn intern(&mut self, module: ResolvedDependency) -> Arc<ResolvedDependency> {
        let identity = module.identity();
        let versions = self.modules.entry(module.name.to_lowercase()).or_default();
        let arc = match versions.iter().find(|m| m.identity() == identity) {
            Some(existing) => Arc::clone(existing),
            None => {
                let arc = Arc::new(module);
                versions.push(Arc::clone(&arc));
                arc
            }
        };
        self.touch(&arc.location);
        arc
    }
}

struct ResolverInner {
    source: Arc<dyn PackageSource>,
    hints: Vec<PathBuf>,
    base_dir: PathBuf,
    cache: Option<Mutex<ResolutionCache>>,
    state: Mutex<SessionState>,
}

/// Resolves `#r` references for one session.
///
/// Cloning is cheap; clones share the session's memoized state.
#[derive(Clone)]
pub struct DependencyResolver {
    inner: Arc<ResolverInner>,
}

impl DependencyResolver {
    pub fn new(source: Arc<dyn PackageSource>) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                source,
                hints: Vec::new(),
                base_dir: std::env::current_dir().unwrap_or_default(),
                cache: None,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Extra roots passed to the package source ahead of its own.
    pub fn with_hints(self, hints: Vec<PathBuf>) -> Self {
        self.rebuild(|inner| inner.hints = hints)
    }

    /// Directory relative path references are resolved against.
    pub fn with_base_dir(self, base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        self.rebuild(|inner| inner.base_dir = base_dir)
    }

    /// Consult and update a persisted resolution cache.
    pub fn with_cache(self, cache: ResolutionCache) -> Self {
        self.rebuild(|inner| inner.cache = Some(Mutex::new(cache)))
    }

    fn rebuild(self, apply: impl FnOnce(&mut ResolverInner)) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => ResolverInner {
                source: Arc::clone(&shared.source),
                hints: shared.hints.clone(),
                base_dir: shared.base_dir.clone(),
                cache: None,
                state: Mutex::new(SessionState::default()),
            },
        };
        apply(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Resolve a reference and its transitive dependencies.
    pub async fn resolve(
        &self,
        reference: &DependencyReference,
    ) -> Result<Arc<ResolvedDependency>, ResolveError> {
        let key = reference.key();

        let operation = {
            let mut state = self.inner.lock_state();
            if let Some(done) = state.resolved.get(&key) {
                tracing::debug!("Resolution cache hit for {}", key);
                return Ok(Arc::clone(done));
            }
            match state.in_flight.get(&key) {
                Some(pending) => {
                    tracing::debug!("Joining in-flight resolution of {}", key);
                    pending.clone()
                }
                None => {
                    let operation = self.start(key.clone(), reference.clone());
                    state.in_flight.insert(key, operation.clone());
                    operation
                }
            }
        };

        operation.await
    }

    fn start(&self, key: String, reference: DependencyReference) -> SharedResolution {
        let inner = Arc::clone(&self.inner);
        async move {
            let worker = Arc::clone(&inner);
            let result = tokio::task::spawn_blocking(move || worker.resolve_blocking(&reference))
                .await
                .unwrap_or_else(|e| Err(ResolveError::Source(format!("resolution task failed: {}", e))));

            let mut state = inner.lock_state();
            if let Ok(resolved) = &result {
                state.resolved.insert(key.clone(), Arc::clone(resolved));
            }
            state.in_flight.remove(&key);
            drop(state);

            if let Ok(resolved) = &result {
                inner.remember(&key, resolved);
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Previously memoized result for a reference, if any.
    pub fn cached(&self, reference: &DependencyReference) -> Option<Arc<ResolvedDependency>> {
        self.inner.lock_state().resolved.get(&reference.key()).cloned()
    }

    /// Number of memoized references.
    pub fn resolved_count(&self) -> usize {
        self.inner.lock_state().resolved.len()
    }
}

impl ResolverInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, key: &str, resolved: &ResolvedDependency) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.get(key) == Some(resolved.location.as_path()) {
            return;
        }
        cache.insert(key, resolved.location.clone());
        if let Err(e) = cache.save() {
            tracing::warn!("Failed to persist resolution cache: {}", e);
        }
    }

    fn resolve_blocking(
        &self,
        reference: &DependencyReference,
    ) -> Result<Arc<ResolvedDependency>, ResolveError> {
        let root = self.select_root(reference)?;
        let requested = reference.to_string();

        let root = match root {
            Selected::Existing(module) => {
                self.lock_state().touch(&module.location);
                return Ok(module);
            }
            Selected::Manifest(manifest) => manifest,
        };

        // Expand the dependency graph. Edges point from dependent to dependency.
        let mut graph: DiGraph<Node, ()> = DiGraph::new();
        let mut by_name: FxHashMap<String, NodeIndex> = FxHashMap::default();
        let root_name = root.name.to_lowercase();
        let root_index = graph.add_node(Node::Pending(root));
        by_name.insert(root_name, root_index);
        let mut queue = vec![root_index];

        while let Some(index) = queue.pop() {
            let Node::Pending(manifest) = &graph[index] else {
                continue;
            };
            let dependencies = manifest.dependencies.clone();
            let dependent = manifest.name.clone();

            for (name, constraint) in dependencies {
                let req = VersionReq::parse(&constraint).map_err(|e| ResolveError::InvalidManifest {
                    path: dependent.clone(),
                    message: format!("dependency `{}`: {}", name, e),
                })?;

                let existing = by_name
                    .get(&name.to_lowercase())
                    .copied()
                    .filter(|&i| req.matches(graph[i].version()));
                let target = match existing {
                    Some(target) => target,
                    None => {
                        let target = match self.select(&name, &req, &requested, true)? {
                            Selected::Existing(module) => graph.add_node(Node::Done(module)),
                            Selected::Manifest(manifest) => {
                                let target = graph.add_node(Node::Pending(manifest));
                                queue.push(target);
                                target
                            }
                        };
                        by_name.insert(name.to_lowercase(), target);
                        target
                    }
                };
                graph.add_edge(index, target, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| ResolveError::Unresolvable {
            reference: requested.clone(),
            reason: format!(
                "dependency cycle involving `{}`",
                graph[cycle.node_id()].name()
            ),
        })?;

        // Dependency-first: reverse topological order.
        let mut built: FxHashMap<NodeIndex, Arc<ResolvedDependency>> = FxHashMap::default();
        for index in order.into_iter().rev() {
            let module = match &graph[index] {
                Node::Done(module) => Arc::clone(module),
                Node::Pending(manifest) => {
                    let dependencies: Vec<Arc<ResolvedDependency>> = graph
                        .neighbors(index)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .filter_map(|dep| built.get(&dep).cloned())
                        .collect();
                    let module = build_module(manifest, dependencies);
                    self.lock_state().intern(module)
                }
            };
            built.insert(index, module);
        }

        built.remove(&root_index).ok_or_else(|| ResolveError::Unresolvable {
            reference: requested,
            reason: "resolution produced no module".to_string(),
        })
    }

    fn select_root(&self, reference: &DependencyReference) -> Result<Selected, ResolveError> {
        let requested = reference.to_string();

        if let Some(path) = &reference.path {
            let dir = self.base_dir.join(path);
            let manifest = self.source.manifest_at(&dir).map_err(|e| match e {
                ResolveError::InvalidManifest { message, .. } => ResolveError::Unresolvable {
                    reference: requested.clone(),
                    reason: message,
                },
                other => other,
            })?;
            return Ok(self.existing_or(manifest));
        }

        let req = match &reference.constraint {
            Some(constraint) => VersionReq::parse(constraint).map_err(|e| {
                ResolveError::Unresolvable {
                    reference: requested.clone(),
                    reason: e,
                }
            })?,
            None => VersionReq::any(),
        };

        if let Some(selected) = self.from_persisted_cache(reference, &req) {
            return Ok(selected);
        }

        self.select(&reference.name, &req, &requested, false)
    }

    fn from_persisted_cache(&self, reference: &DependencyReference, req: &VersionReq) -> Option<Selected> {
        let location = {
            let cache = self.cache.as_ref()?.lock().unwrap_or_else(PoisonError::into_inner);
            cache.get(&reference.key())?.to_path_buf()
        };
        match self.source.manifest_at(&location) {
            Ok(manifest)
                if manifest.name.eq_ignore_ascii_case(&reference.name)
                    && req.matches(&manifest.version) =>
            {
                tracing::debug!("Using persisted resolution {} → {}", reference.key(), location.display());
                Some(self.existing_or(manifest))
            }
            _ => {
                tracing::debug!("Ignoring stale persisted resolution for {}", reference.key());
                None
            }
        }
    }

    /// Pick one version of `name` satisfying `req`.
    ///
    /// The highest matching candidate wins. With `reuse_resolved`, a module of
    /// the same name already resolved in the session that satisfies `req` is
    /// taken instead, so transitive edges share loaded modules.
    fn select(
        &self,
        name: &str,
        req: &VersionReq,
        requested: &str,
        reuse_resolved: bool,
    ) -> Result<Selected, ResolveError> {
        if reuse_resolved && let Some(module) = self.lock_state().reusable(name, req) {
            tracing::debug!("Reusing {} for {}", module, requested);
            return Ok(Selected::Existing(module));
        }

        let candidates = self.source.candidates(name, &self.hints)?;
        if candidates.is_empty() {
            return Err(ResolveError::Unresolvable {
                reference: requested.to_string(),
                reason: format!("package `{}` was not found", name),
            });
        }

        let mut matching: Vec<PackageManifest> = candidates
            .into_iter()
            .filter(|m| req.matches(&m.version))
            .collect();
        let Some(best) = matching.iter().map(|m| m.version).max() else {
            return Err(ResolveError::Unresolvable {
                reference: requested.to_string(),
                reason: format!("no version of `{}` satisfies the constraint", name),
            });
        };
        matching.retain(|m| m.version == best);

        if matching.len() == 1 {
            return Ok(self.existing_or(matching.remove(0)));
        }

        // Several packages at the top version: prefer the one resolved last.
        let state = self.lock_state();
        let recent = matching
            .iter()
            .enumerate()
            .filter_map(|(i, m)| state.recency.get(&m.location).map(|&tick| (tick, i)))
            .max();
        drop(state);

        match recent {
            Some((_, i)) => Ok(self.existing_or(matching.swap_remove(i))),
            None => Err(ResolveError::AmbiguousVersion {
                reference: requested.to_string(),
                candidates: matching
                    .iter()
                    .map(|m| format!("{}@{} ({})", m.name, m.version, m.location.display()))
                    .collect(),
            }),
        }
    }

    fn existing_or(&self, manifest: PackageManifest) -> Selected {
        match self.lock_state().reusable_exact(&manifest) {
            Some(module) => Selected::Existing(module),
            None => Selected::Manifest(manifest),
        }
    }
}

impl SessionState {
    fn reusable_exact(&self, manifest: &PackageManifest) -> Option<Arc<ResolvedDependency>> {
        let identity = manifest.identity();
        self.modules
            .get(&manifest.name.to_lowercase())?
            .iter()
            .find(|m| m.identity() == identity)
            .cloned()
    }
}

enum Selected {
    Existing(Arc<ResolvedDependency>),
    Manifest(PackageManifest),
}

enum Node {
    Pending(PackageManifest),
    Done(Arc<ResolvedDependency>),
}

impl Node {
    fn version(&self) -> &Version {
        match self {
            Node::Pending(manifest) => &manifest.version,
            Node::Done(module) => &module.version,
        }
    }

    fn name(&self) -> &str {
        match self {
            Node::Pending(manifest) => &manifest.name,
            Node::Done(module) => &module.name,
        }
    }
}

fn build_module(
    manifest: &PackageManifest,
    dependencies: Vec<Arc<ResolvedDependency>>,
) -> ResolvedDependency {
    let mut closure: Vec<Arc<ResolvedDependency>> = Vec::new();
    for dependency in &dependencies {
        for module in dependency.load_order() {
            if !closure.iter().any(|seen| Arc::ptr_eq(seen, &module)) {
                closure.push(module);
            }
        }
    }

    ResolvedDependency {
        name: manifest.name.clone(),
        version: manifest.version,
        location: manifest.location.clone(),
        exports: manifest.exports.clone(),
        native_libraries: manifest
            .native
            .iter()
            .map(|file| manifest.location.join(file))
            .collect(),
        dependencies,
        closure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{SourceSpan, parse_reference};
    use crate::resolve::MemoryPackageSource;

    fn reference(text: &str) -> DependencyReference {
        parse_reference(text, SourceSpan::point(1, 1)).unwrap()
    }

    fn manifest(name: &str, version: &str, deps: &[(&str, &str)]) -> PackageManifest {
        let mut text = format!("name = \"{}\"\nversion = \"{}\"\n[dependencies]\n", name, version);
        for (dep, req) in deps {
            text.push_str(&format!("{} = \"{}\"\n", dep, req));
        }
        PackageManifest::parse(&text).unwrap()
    }

    fn source(packages: Vec<PackageManifest>) -> Arc<MemoryPackageSource> {
        let source = MemoryPackageSource::new();
        for package in packages {
            source.add(package);
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_highest_matching_version_wins() {
        let source = source(vec![
            manifest("mathx", "1.0.0", &[]),
            manifest("mathx", "1.4.0", &[]),
            manifest("mathx", "2.0.0", &[]),
        ]);
        let resolver = DependencyResolver::new(source);

        let resolved = resolver.resolve(&reference("mathx@^1.0")).await.unwrap();
        assert_eq!(resolved.version, Version::new(1, 4, 0));

        let resolved = resolver.resolve(&reference("mathx")).await.unwrap();
        assert_eq!(resolved.version, Version::new(2, 0, 0));
    }

    #[tokio::test]
    async fn test_top_level_reference_ignores_lower_resolved_version() {
        let source = source(vec![
            manifest("mathx", "1.4.0", &[]),
            manifest("mathx", "2.0.0", &[]),
            manifest("plot", "1.0.0", &[("mathx", "*")]),
        ]);
        let resolver = DependencyResolver::new(source);

        let old = resolver.resolve(&reference("mathx@^1.0")).await.unwrap();
        let new = resolver.resolve(&reference("mathx@>=1.0")).await.unwrap();
        assert_eq!(new.version, Version::new(2, 0, 0));
        assert!(!Arc::ptr_eq(&old, &new));

        // Transitive edges share what the session already loaded.
        let plot = resolver.resolve(&reference("plot")).await.unwrap();
        assert!(Arc::ptr_eq(&plot.closure[0], &new));

        // Re-selecting the same package hands back the same instance.
        let again = resolver.resolve(&reference("mathx@=2.0.0")).await.unwrap();
        assert!(Arc::ptr_eq(&again, &new));
    }

    #[tokio::test]
    async fn test_memoized_per_session() {
        let source = source(vec![manifest("mathx", "1.0.0", &[])]);
        let resolver = DependencyResolver::new(source.clone());

        let first = resolver.resolve(&reference("mathx")).await.unwrap();
        let second = resolver.resolve(&reference("MathX")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_shared_transitive_dependency_is_one_instance() {
        let source = source(vec![
            manifest("app", "1.0.0", &[("units", "^0.3")]),
            manifest("plot", "1.0.0", &[("units", ">=0.3.1")]),
            manifest("units", "0.3.0", &[]),
            manifest("units", "0.3.2", &[]),
        ]);
        let resolver = DependencyResolver::new(source);

        let app = resolver.resolve(&reference("app")).await.unwrap();
        let plot = resolver.resolve(&reference("plot")).await.unwrap();

        assert_eq!(app.closure.len(), 1);
        assert!(Arc::ptr_eq(&app.closure[0], &plot.closure[0]));
        assert_eq!(plot.closure[0].version, Version::new(0, 3, 2));
    }

    #[tokio::test]
    async fn test_closure_is_dependency_first() {
        let source = source(vec![
            manifest("a", "1.0.0", &[("b", "*"), ("c", "*")]),
            manifest("b", "1.0.0", &[("c", "*")]),
            manifest("c", "1.0.0", &[]),
        ]);
        let resolver = DependencyResolver::new(source);

        let a = resolver.resolve(&reference("a")).await.unwrap();
        let order = a.load_order();
        let names: Vec<&str> = order.iter().map(|m| m.name.as_str()).collect();
        let c = names.iter().position(|n| *n == "c").unwrap();
        let b = names.iter().position(|n| *n == "b").unwrap();
        assert!(c < b);
        assert_eq!(names.last(), Some(&"a"));
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_is_unresolvable() {
        let source = source(vec![
            manifest("a", "1.0.0", &[("b", "*")]),
            manifest("b", "1.0.0", &[("a", "*")]),
        ]);
        let resolver = DependencyResolver::new(source);

        let err = resolver.resolve(&reference("a")).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable { ref reason, .. } if reason.contains("cycle")));
    }

    #[tokio::test]
    async fn test_missing_and_unsatisfiable() {
        let source = source(vec![manifest("mathx", "1.0.0", &[])]);
        let resolver = DependencyResolver::new(source);

        let err = resolver.resolve(&reference("nothere")).await.unwrap_err();
        assert!(err.to_string().contains("was not found"));

        let err = resolver.resolve(&reference("mathx@^2")).await.unwrap_err();
        assert!(err.to_string().contains("satisfies"));
    }

    #[tokio::test]
    async fn test_ambiguous_then_tie_broken_by_recency() {
        let source = MemoryPackageSource::new();
        let mut left = manifest("geo", "1.0.0", &[]);
        left.location = PathBuf::from("/left/geo");
        let mut right = manifest("geo", "1.0.0", &[]);
        right.location = PathBuf::from("/right/geo");
        source.add(left);
        source.add(right);
        let source = Arc::new(source);
        let resolver = DependencyResolver::new(source);

        let err = resolver.resolve(&reference("geo")).await.unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousVersion { ref candidates, .. } if candidates.len() == 2));

        // Resolving one copy by path makes it the most recent.
        let by_path = resolver.resolve(&reference("/right/geo")).await.unwrap();
        let by_name = resolver.resolve(&reference("geo@=1.0.0")).await.unwrap();
        assert!(Arc::ptr_eq(&by_path, &by_name));
    }

    #[tokio::test]
    async fn test_failures_are_not_memoized() {
        let source = source(vec![]);
        let resolver = DependencyResolver::new(source.clone());

        assert!(resolver.resolve(&reference("late")).await.is_err());
        source.add(manifest("late", "0.1.0", &[]));
        assert!(resolver.resolve(&reference("late")).await.is_ok());
    }
}
