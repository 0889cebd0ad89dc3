//! Incremental compiler chain with a scope-keyed cache.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

use super::codegen;
use super::directives;
use super::lexer;
use super::parser;
use super::types::{CompiledUnit, DependencyReference, Diagnostic, SymbolDescriptor};

/// Result of [`CompilerChain::compile`].
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// Freshly compiled.
    Compiled(Arc<CompiledUnit>),
    /// Same buffer and scope as a previous compile; nothing was recompiled.
    Cached(Arc<CompiledUnit>),
    /// Blocking diagnostics, no binary module.
    Failed(Vec<Diagnostic>),
}

impl CompileOutcome {
    pub fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        match self {
            CompileOutcome::Compiled(unit) | CompileOutcome::Cached(unit) => Some(unit),
            CompileOutcome::Failed(_) => None,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileOutcome::Compiled(unit) | CompileOutcome::Cached(unit) => &unit.diagnostics,
            CompileOutcome::Failed(diagnostics) => diagnostics,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, CompileOutcome::Cached(_))
    }
}

struct CacheEntry {
    buffer: String,
    scope: Vec<SymbolDescriptor>,
    unit: Arc<CompiledUnit>,
}

/// Compiles cells against the declared state of the cells before them.
///
/// Compilation is a pure function of `(buffer, scope)`, so successful units
/// are cached under that pair and reused whenever both are unchanged.
#[derive(Default)]
pub struct CompilerChain {
    cache: FxHashMap<u64, CacheEntry>,
}

impl CompilerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `buffer` in `scope`, the ordered declared state of earlier cells.
    pub fn compile(&mut self, buffer: &str, scope: &[SymbolDescriptor]) -> CompileOutcome {
        let key = cache_key(buffer, scope);

        if let Some(entry) = self.cache.get(&key)
            && entry.buffer == buffer
            && entry.scope == scope
        {
            tracing::debug!("Compile cache hit ({:016x})", key);
            return CompileOutcome::Cached(Arc::clone(&entry.unit));
        }

        match compile_unit(buffer, scope) {
            Ok(unit) => {
                let unit = Arc::new(unit);
                tracing::debug!(
                    "Compiled cell ({} bytes, {} declared symbols)",
                    unit.binary_module.len(),
                    unit.declared_top_level_state.len()
                );
                self.cache.insert(
                    key,
                    CacheEntry {
                        buffer: buffer.to_string(),
                        scope: scope.to_vec(),
                        unit: Arc::clone(&unit),
                    },
                );
                CompileOutcome::Compiled(unit)
            }
            Err(diagnostics) => CompileOutcome::Failed(diagnostics),
        }
    }

    /// Diagnostics for an edited buffer, without touching the cache.
    pub fn diagnose(&self, buffer: &str, scope: &[SymbolDescriptor]) -> Vec<Diagnostic> {
        let key = cache_key(buffer, scope);
        if let Some(entry) = self.cache.get(&key)
            && entry.buffer == buffer
            && entry.scope == scope
        {
            return entry.unit.diagnostics.clone();
        }
        match compile_unit(buffer, scope) {
            Ok(unit) => unit.diagnostics,
            Err(diagnostics) => diagnostics,
        }
    }

    /// Whether the buffer is syntactically finished (balanced, no open string).
    pub fn is_complete(buffer: &str) -> bool {
        lexer::is_complete(buffer)
    }

    pub fn cached_units(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

fn cache_key(buffer: &str, scope: &[SymbolDescriptor]) -> u64 {
    let mut hasher = FxHasher::default();
    buffer.hash(&mut hasher);
    scope.hash(&mut hasher);
    hasher.finish()
}

/// Compile one buffer. `Err` carries every diagnostic when any is blocking.
pub fn compile_unit(
    buffer: &str,
    scope: &[SymbolDescriptor],
) -> Result<CompiledUnit, Vec<Diagnostic>> {
    let extracted = directives::extract(buffer);
    let mut diagnostics = extracted.diagnostics;
    let references = dedupe_references(extracted.references, &mut diagnostics);
    let aliases: Vec<String> = references.iter().map(|r| r.alias.clone()).collect();

    let program = lexer::tokenize(&extracted.masked).and_then(parser::parse);
    let lowered = match program {
        Ok(program) => Some(codegen::lower(&program, scope, &aliases)),
        Err(diagnostic) => {
            diagnostics.push(diagnostic);
            None
        }
    };

    let (module, declared) = match lowered {
        Some(lowered) => {
            diagnostics.extend(lowered.diagnostics);
            (lowered.module, lowered.declared)
        }
        None => (None, Vec::new()),
    };

    diagnostics.sort_by_key(|d| d.span.map(|s| (s.start_line, s.start_col)));

    let module = match module {
        Some(module) if !diagnostics.iter().any(Diagnostic::is_blocking) => module,
        _ => return Err(diagnostics),
    };

    let binary_module = module
        .encode()
        .map_err(|message| vec![Diagnostic::error(message, None)])?;

    Ok(CompiledUnit {
        binary_module,
        diagnostics,
        declared_top_level_state: declared,
        requested_dependencies: references,
    })
}

fn dedupe_references(
    references: Vec<DependencyReference>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<DependencyReference> {
    let mut keys = FxHashSet::default();
    let mut aliases: FxHashMap<String, String> = FxHashMap::default();
    let mut kept = Vec::with_capacity(references.len());

    for reference in references {
        let key = reference.key();
        if !keys.insert(key.clone()) {
            diagnostics.push(Diagnostic::warning(
                format!("`{}` is already referenced in this cell", reference),
                Some(reference.span),
            ));
            continue;
        }
        if let Some(previous) = aliases.get(&reference.alias) {
            diagnostics.push(Diagnostic::error(
                format!(
                    "`{}` conflicts with `{}`: both bind the name `{}`",
                    reference, previous, reference.alias
                ),
                Some(reference.span),
            ));
            continue;
        }
        aliases.insert(reference.alias.clone(), reference.to_string());
        kept.push(reference);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::SymbolKind;
    use crate::compile::module::Module;

    #[test]
    fn test_compile_is_deterministic() {
        let scope = vec![SymbolDescriptor::variable("x")];
        let source = "var y = x + 1\nif y > 1 { print(\"big\") }\ny * 2";

        let a = compile_unit(source, &scope).unwrap();
        let b = compile_unit(source, &scope).unwrap();
        assert_eq!(a.binary_module, b.binary_module);
        assert_eq!(a.diagnostics, b.diagnostics);

        let mut chain = CompilerChain::new();
        let first = chain.compile(source, &scope);
        let second = chain.compile(source, &scope);
        assert!(matches!(first, CompileOutcome::Compiled(_)));
        assert!(second.is_cached());
        assert!(Arc::ptr_eq(first.unit().unwrap(), second.unit().unwrap()));
        assert_eq!(first.unit().unwrap().binary_module, a.binary_module);
    }

    #[test]
    fn test_scope_change_misses_cache() {
        let mut chain = CompilerChain::new();
        let x = [SymbolDescriptor::variable("x")];
        let xy = [SymbolDescriptor::variable("x"), SymbolDescriptor::variable("y")];

        assert!(!chain.compile("x", &x).is_cached());
        assert!(!chain.compile("x", &xy).is_cached());
        assert_eq!(chain.cached_units(), 2);
    }

    #[test]
    fn test_directive_only_cell_is_valid() {
        let unit = compile_unit("#r \"mathx@1.0\"\n// nothing else", &[]).unwrap();

        assert_eq!(unit.requested_dependencies.len(), 1);
        assert_eq!(
            unit.declared_top_level_state,
            vec![SymbolDescriptor::package("mathx")]
        );
        let module = Module::decode(&unit.binary_module).unwrap();
        assert!(!module.has_result);
        assert_eq!(module.code.len(), 1);
    }

    #[test]
    fn test_blocking_diagnostics_prevent_unit() {
        let diagnostics = compile_unit("var x = (1 +", &[]).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_blocking());

        let mut chain = CompilerChain::new();
        assert!(matches!(chain.compile("nope", &[]), CompileOutcome::Failed(_)));
        assert_eq!(chain.cached_units(), 0);
    }

    #[test]
    fn test_duplicate_and_conflicting_references() {
        // Package names are case-insensitive, so `MathX` is the same reference.
        let unit = compile_unit("#r \"mathx\"\n#r \"MathX\"\n1", &[]).unwrap();
        assert_eq!(unit.requested_dependencies.len(), 1);
        assert_eq!(unit.diagnostics.len(), 1);
        assert!(!unit.diagnostics[0].is_blocking());
        assert_eq!(unit.diagnostics[0].span.map(|s| s.start_line), Some(2));

        let diagnostics = compile_unit("#r \"mathx@1\"\n#r \"mathx@2\"", &[]).unwrap_err();
        assert!(diagnostics[0].message.contains("both bind the name `mathx`"));
    }

    #[test]
    fn test_diagnostics_sorted_by_position() {
        let diagnostics = compile_unit("a\n#r \"bad name\"\nb", &[]).unwrap_err();
        let lines: Vec<u32> = diagnostics
            .iter()
            .filter_map(|d| d.span.map(|s| s.start_line))
            .collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_deeply_nested_buffer_is_a_blocking_diagnostic() {
        let buffer = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let mut chain = CompilerChain::new();

        let diagnostics = chain.diagnose(&buffer, &[]);
        assert!(diagnostics.iter().any(|d| d.message.contains("maximum depth")));

        let outcome = chain.compile(&buffer, &[]);
        assert!(outcome.unit().is_none());
        assert_eq!(chain.cached_units(), 0);
    }

    #[test]
    fn test_diagnose_reports_without_caching() {
        let chain = CompilerChain::new();
        let diagnostics = chain.diagnose("var x = 1\nvar x = 2\ny", &[]);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("`y`"));
        assert_eq!(chain.cached_units(), 0);
    }

    #[test]
    fn test_package_then_variables_in_declared_state() {
        let unit = compile_unit("var a = 1\n#r \"geo\"\nvar b = geo.origin", &[]).unwrap();
        let kinds: Vec<SymbolKind> = unit
            .declared_top_level_state
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![SymbolKind::Package, SymbolKind::Variable, SymbolKind::Variable]
        );
    }
}
