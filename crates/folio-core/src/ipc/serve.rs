//! Worker side of the protocol.
//!
//! Commands are answered strictly in order by [`Worker::serve`]. While a run
//! is in progress the loop is busy, so `Abort` must not wait in the queue:
//! whoever reads the host's frames hands them to [`dispatch`], which applies
//! aborts immediately and queues everything else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};

use super::protocol::{WorkerCommand, WorkerResponse};
use crate::error::Result;
use crate::execute::loader::IsolatedModuleLoader;
use crate::execute::runtime::{Host, RunOutcome, Runtime};
use crate::execute::{ModuleHandle, OutputStream};

/// Abort requests by run id.
///
/// Run ids only grow, so remembering the highest aborted id is enough: an
/// abort can arrive before its run starts but never after a later one.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    requested: AtomicU64,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, run: u64) {
        self.requested.fetch_max(run, Ordering::AcqRel);
    }

    pub fn is_aborted(&self, run: u64) -> bool {
        run != 0 && self.requested.load(Ordering::Acquire) >= run
    }
}

/// Route one incoming command. Returns `false` once the serve loop is gone.
pub fn dispatch(
    command: WorkerCommand,
    aborts: &AbortRegistry,
    queue: &Sender<WorkerCommand>,
) -> bool {
    match command {
        WorkerCommand::Abort { run } => {
            aborts.request(run);
            true
        }
        other => queue.send(other).is_ok(),
    }
}

/// Why [`Worker::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    /// The command stream closed or a response could not be delivered.
    HostGone,
    /// A module called `exit(code)`.
    Exit(i32),
}

pub struct Worker {
    runtime: Runtime,
    loader: IsolatedModuleLoader,
}

struct RunHost<'a, 'r> {
    run: u64,
    aborts: &'a AbortRegistry,
    respond: &'a mut (dyn FnMut(WorkerResponse) -> Result<()> + 'r),
    delivery_failed: bool,
}

impl Host for RunHost<'_, '_> {
    fn output(&mut self, stream: OutputStream, text: String) {
        if (self.respond)(WorkerResponse::Output { stream, text }).is_err() {
            self.delivery_failed = true;
        }
    }

    fn is_aborted(&self) -> bool {
        self.delivery_failed || self.aborts.is_aborted(self.run)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        Self {
            runtime: Runtime::new(),
            loader: IsolatedModuleLoader::new(),
        }
    }

    pub fn serve(
        &mut self,
        commands: &Receiver<WorkerCommand>,
        aborts: &AbortRegistry,
        respond: &mut dyn FnMut(WorkerResponse) -> Result<()>,
    ) -> ServeExit {
        while let Ok(command) = commands.recv() {
            let response = match command {
                WorkerCommand::Ping => WorkerResponse::Pong,
                WorkerCommand::LoadModule { module, packages } => {
                    match self.loader.load(&module, packages) {
                        Ok(handle) => {
                            tracing::debug!(
                                "Loaded module {} ({} package(s) resident)",
                                handle.0,
                                self.loader.package_count()
                            );
                            WorkerResponse::Loaded { handle }
                        }
                        Err(reason) => WorkerResponse::LoadFailed { reason },
                    }
                }
                WorkerCommand::Execute { handle, run } => {
                    match self.execute(handle, run, aborts, respond) {
                        Ok(response) => response,
                        Err(exit) => return exit,
                    }
                }
                WorkerCommand::Abort { run } => {
                    aborts.request(run);
                    continue;
                }
                WorkerCommand::ResetState => {
                    self.runtime.reset();
                    self.loader.reset();
                    WorkerResponse::StateReset
                }
                WorkerCommand::Globals => WorkerResponse::Globals {
                    variables: self.runtime.globals(),
                },
                WorkerCommand::Shutdown => {
                    let _ = respond(WorkerResponse::ShuttingDown);
                    return ServeExit::Shutdown;
                }
            };

            if respond(response).is_err() {
                return ServeExit::HostGone;
            }
        }
        ServeExit::HostGone
    }

    /// Run one module; `Err` means the serve loop must stop.
    fn execute(
        &mut self,
        handle: ModuleHandle,
        run: u64,
        aborts: &AbortRegistry,
        respond: &mut dyn FnMut(WorkerResponse) -> Result<()>,
    ) -> std::result::Result<WorkerResponse, ServeExit> {
        let Some(module) = self.loader.module(handle) else {
            return Ok(WorkerResponse::Error {
                message: format!("unknown module handle {}", handle.0),
            });
        };

        let mut host = RunHost {
            run,
            aborts,
            respond: &mut *respond,
            delivery_failed: false,
        };
        let outcome = self.runtime.run(&module, &self.loader, &mut host);
        if host.delivery_failed {
            return Err(ServeExit::HostGone);
        }

        Ok(match outcome {
            RunOutcome::Completed(value) => {
                if let Some(value) = value
                    && respond(WorkerResponse::Value {
                        value: value.representation(),
                    })
                    .is_err()
                {
                    return Err(ServeExit::HostGone);
                }
                WorkerResponse::Completed
            }
            RunOutcome::Faulted(fault) => WorkerResponse::Faulted { fault },
            RunOutcome::Aborted => WorkerResponse::Aborted,
            RunOutcome::Exit(code) => return Err(ServeExit::Exit(code)),
        })
    }
}
