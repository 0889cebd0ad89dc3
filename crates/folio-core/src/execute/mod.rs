//! Remote execution of compiled modules.
//!
//! An execution context owns live top-level state and loaded packages. The
//! host talks to it through [`ExecutionContext`]; the worker side runs the
//! bytecode [`runtime`] against modules held by the [`loader`].

mod context;
pub(crate) mod loader;
mod remote;
pub(crate) mod runtime;
mod types;
pub(crate) mod value;

pub use context::{AbortHandle, ContextError, EventSink, ExecutionContext};
pub use remote::RemoteContext;
pub use types::{
    ExecutionEvent, ExecutionOutcome, Export, Fault, FaultKind, GlobalVariable, ModuleHandle,
    OutputStream, PackageImage, Representation,
};
