//! Core engine for folio interactive workbooks.
//!
//! This crate provides:
//! - Cell store with explicit link ordering
//! - Incremental, REPL-style compiler chain for folio script
//! - Dependency resolver with per-session memoization and coalescing
//! - Isolated execution contexts (worker process or in-process thread)
//! - Evaluation service driving the ordered evaluation event protocol

pub mod cells;
pub mod compile;
pub mod config;
pub mod error;
pub mod eval;
pub mod execute;
pub mod ipc;
pub mod resolve;

pub use cells::{Cell, CellId, CellOutcome, CellStatus, CellStore, SessionId};
pub use compile::{
    CompileOutcome, CompiledUnit, CompilerChain, CompletionItem, CompletionKind,
    DependencyReference, Diagnostic, Hover, Position, Severity, SignatureHelp, SourceSpan,
    SymbolDescriptor, SymbolKind,
};
pub use config::{Isolation, WorkbookConfig, WorkbookDirs};
pub use error::{Error, Result};
pub use eval::{
    CellSnapshot, ContextFactory, EvaluationEvent, EvaluationService, EvaluationStatus,
    EventStream, RunSummary, SessionState, UpdateResult,
};
pub use execute::{
    AbortHandle, ContextError, ExecutionContext, ExecutionEvent, Fault, FaultKind,
    GlobalVariable, OutputStream, RemoteContext, Representation,
};
pub use resolve::{
    DependencyResolver, DirectoryPackageSource, PackageManifest, PackageSource, ResolveError,
    ResolvedDependency,
};
