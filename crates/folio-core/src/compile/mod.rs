//! Incremental compiler chain for folio script.
//!
//! Each cell is compiled in the scope formed by the declared top-level state
//! of every earlier cell, in link order.
//!
//! # Architecture
//!
//! ```text
//! buffer ──► directives ──► #r references ─────────────────────┐
//!    │                                                          │
//!    └──► masked source ──► lexer ──► parser ──► codegen ──► CompiledUnit
//!                                                  ▲            (rkyv Module)
//!                                   prior scope ───┘
//! ```

mod assist;
mod ast;
mod chain;
mod codegen;
mod directives;
mod lexer;
mod module;
mod parser;
mod types;

pub use assist::{
    AssistScope, CompletionItem, CompletionKind, Hover, PackageSummary, Position, SignatureHelp,
    completions, hover, signature_help,
};
pub use ast::{BinaryOp, Builtin, UnaryOp};
pub use chain::{CompileOutcome, CompilerChain, compile_unit};
pub use parser::MAX_NESTING_DEPTH;
pub use directives::{dependency_references, parse_reference};
pub use module::{Constant, Instruction, MODULE_FORMAT, Module};
pub use types::{
    CompiledUnit, DependencyReference, Diagnostic, Severity, SourceSpan, SymbolDescriptor,
    SymbolKind,
};

pub(crate) use directives::is_identifier;
