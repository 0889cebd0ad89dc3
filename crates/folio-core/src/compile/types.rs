//! Common types for the compiler chain.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a diagnostic.
///
/// Errors are blocking: no binary module is produced. Warnings are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// Source span, 1-indexed lines and columns, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl SourceSpan {
    pub fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// A span covering a single position.
    pub fn point(line: u32, col: u32) -> Self {
        Self::new(line, col, line, col)
    }

    /// Smallest span covering both.
    pub fn to(self, other: SourceSpan) -> Self {
        Self {
            start_line: self.start_line,
            start_col: self.start_col,
            end_line: other.end_line,
            end_col: other.end_col,
        }
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_col)
    }
}

/// A compiler message attached to a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Option<SourceSpan>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Option<SourceSpan>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            span,
        }
    }

    pub fn warning(message: impl Into<String>, span: Option<SourceSpan>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            span,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.span {
            Some(span) => write!(f, "{} at {}: {}", level, span, self.message),
            None => write!(f, "{}: {}", level, self.message),
        }
    }
}

/// Kind of a top-level symbol carried between cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Variable,
    /// A referenced package, usable as `name.member`.
    Package,
}

/// One top-level symbol declared by a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    pub name: String,
    pub kind: SymbolKind,
}

impl SymbolDescriptor {
    pub fn variable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Variable,
        }
    }

    pub fn package(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Package,
        }
    }
}

/// An external reference requested by a `#r` directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyReference {
    /// Package name, or the directory name for path references.
    pub name: String,

    /// Version constraint, `None` meaning any version.
    pub constraint: Option<String>,

    /// Directory holding the package, for path references.
    pub path: Option<String>,

    /// Symbol the package is bound to in the cell.
    pub alias: String,

    /// Location of the directive.
    pub span: SourceSpan,
}

impl DependencyReference {
    /// Normalized identity used for memoization and coalescing.
    pub fn key(&self) -> String {
        match &self.path {
            Some(path) => format!("path:{}", path.trim_end_matches('/')),
            None => {
                let constraint: String = self
                    .constraint
                    .as_deref()
                    .unwrap_or("*")
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                format!("{}@{}", self.name.to_lowercase(), constraint)
            }
        }
    }
}

impl fmt::Display for DependencyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.constraint) {
            (Some(path), _) => write!(f, "{}", path),
            (None, Some(constraint)) => write!(f, "{}@{}", self.name, constraint),
            (None, None) => write!(f, "{}", self.name),
        }
    }
}

/// Output of compiling one cell against a prior-chain scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// rkyv-encoded [`Module`](super::Module).
    pub binary_module: Vec<u8>,

    /// Advisory diagnostics only; blocking ones prevent a unit.
    pub diagnostics: Vec<Diagnostic>,

    /// Packages referenced by this cell, then its variables, in order.
    pub declared_top_level_state: Vec<SymbolDescriptor>,

    pub requested_dependencies: Vec<DependencyReference>,
}
