//! IPC protocol messages between the host and an execution worker.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{ErrorKind, Read, Write};

use rkyv::api::high::{HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::de::Pool;
use rkyv::rancor::{self, Strategy};
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execute::{Fault, GlobalVariable, ModuleHandle, OutputStream, PackageImage, Representation};

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Command sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Liveness check; answered with `Pong`.
    Ping,

    /// Load a binary module and the packages it needs, in load order.
    LoadModule {
        module: Vec<u8>,
        packages: Vec<PackageImage>,
    },

    /// Run a loaded module. `run` identifies the run for `Abort`.
    Execute { handle: ModuleHandle, run: u64 },

    /// Cooperatively stop run `run`. Never answered directly; the run
    /// itself ends with `Aborted`.
    Abort { run: u64 },

    /// Drop globals, modules and packages.
    ResetState,

    /// List live top-level variables.
    Globals,

    Shutdown,
}

/// Response sent from a worker to the host.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    Pong,

    Loaded { handle: ModuleHandle },

    LoadFailed { reason: String },

    /// A chunk of captured output of the current run.
    Output { stream: OutputStream, text: String },

    /// Result value of the current run, sent before `Completed`.
    Value { value: Representation },

    Completed,

    Faulted { fault: Fault },

    Aborted,

    StateReset,

    Globals { variables: Vec<GlobalVariable> },

    ShuttingDown,

    /// The command could not be carried out.
    Error { message: String },
}

/// Write a message using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message written by [`write_message`].
///
/// Returns `Ok(None)` on a clean end of stream before a frame starts.
/// Frames larger than `max_size` are rejected.
pub fn read_message<R: Read, T>(reader: &mut R, max_size: usize) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
        + Deserialize<T, Strategy<Pool, rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_size {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes (limit {})",
            len, max_size
        )));
    }

    let mut bytes = AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    let message = rkyv::from_bytes::<T, rancor::Error>(&bytes)
        .map_err(|e| Error::Deserialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(Some(message))
}
