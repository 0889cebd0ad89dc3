//! Values exchanged with an execution context.
//!
//! These travel over the worker wire (rkyv) and on to the presentation
//! layer (serde), so they derive both.

use std::fmt;

use rkyv::Archive;

use crate::compile::Constant;
use crate::resolve::ResolvedDependency;

/// Handle of a module loaded into an execution context.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ModuleHandle(pub u64);

/// Which standard stream a chunk of captured output came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Display form of a runtime value.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Representation {
    pub type_name: String,
    pub text: String,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum FaultKind {
    TypeError,
    DivideByZero,
    OverflowError,
    NameError,
    AttributeError,
    /// Raised by `fail(...)`.
    Failure,
    NativeLoadError,
}

/// Structured description of an unhandled runtime error.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    /// Source line the fault was raised on.
    pub line: Option<u32>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{:?} (line {}): {}", self.kind, line, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// A live top-level variable.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct GlobalVariable {
    pub name: String,
    pub value: Representation,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Export {
    pub name: String,
    pub value: Constant,
}

/// Everything a context needs to load one resolved package.
#[derive(Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct PackageImage {
    pub name: String,
    pub version: String,
    /// Symbol the package is bound to, for directly referenced packages.
    pub alias: Option<String>,
    pub location: String,
    pub exports: Vec<Export>,
    /// Absolute paths of native libraries.
    pub native_libraries: Vec<String>,
}

impl PackageImage {
    pub fn from_resolved(dependency: &ResolvedDependency, alias: Option<String>) -> Self {
        Self {
            name: dependency.name.clone(),
            version: dependency.version.to_string(),
            alias,
            location: dependency.location.display().to_string(),
            exports: dependency
                .exports
                .iter()
                .map(|(name, value)| Export {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            native_libraries: dependency
                .native_libraries
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
        }
    }

    /// `name@version`: different versions of one package load side by side.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name.to_lowercase(), self.version)
    }
}

/// Non-terminal event produced while a module runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Output { stream: OutputStream, text: String },
    Value(Representation),
}

/// How a module run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Faulted(Fault),
    Aborted,
}
