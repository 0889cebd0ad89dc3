//! Inter-process communication with execution workers.
//!
//! The same protocol runs over a child process's stdin/stdout
//! ([`ProcessTransport`]) or over in-memory channels to a host thread
//! ([`LocalTransport`]).

pub mod protocol;
mod serve;
mod transport;
mod worker;

pub use protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, WorkerCommand, WorkerResponse, read_message, write_message,
};
pub use serve::{AbortRegistry, ServeExit, Worker, dispatch};
pub use transport::{LocalTransport, Transport};
pub use worker::{MAX_MESSAGE_SIZE_ENV, ProcessTransport, find_worker_binary};
