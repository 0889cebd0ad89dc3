//! Byte-level links between the host and a worker.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::protocol::{WorkerCommand, WorkerResponse};
use super::serve::{AbortRegistry, ServeExit, Worker, dispatch};
use crate::error::{Error, Result};

/// Carries commands to a worker. Responses arrive on the receiver handed out
/// when the transport is created; it closes when the worker goes away.
pub trait Transport: Send {
    fn send(&mut self, command: WorkerCommand) -> Result<()>;

    /// Stop the worker without waiting for it to cooperate.
    fn kill(&mut self);
}

/// Runs the worker serve loop on a host thread.
///
/// Shares the protocol and abort routing with a worker process, minus the
/// process boundary: a crash in native code takes the host down with it.
pub struct LocalTransport {
    queue: Option<mpsc::Sender<WorkerCommand>>,
    aborts: Arc<AbortRegistry>,
    thread: Option<JoinHandle<ServeExit>>,
}

impl LocalTransport {
    pub fn spawn() -> Result<(Self, UnboundedReceiver<WorkerResponse>)> {
        let (queue, commands) = mpsc::channel();
        let (responses, receiver): (UnboundedSender<WorkerResponse>, _) = unbounded_channel();
        let aborts = Arc::new(AbortRegistry::new());

        let thread = {
            let aborts = Arc::clone(&aborts);
            std::thread::Builder::new()
                .name("folio-local-worker".to_string())
                .spawn(move || {
                    let exit = Worker::new().serve(&commands, &aborts, &mut |response| {
                        responses
                            .send(response)
                            .map_err(|_| Error::Ipc("host dropped the response channel".to_string()))
                    });
                    tracing::debug!("Local worker stopped: {:?}", exit);
                    exit
                })?
        };

        Ok((
            Self {
                queue: Some(queue),
                aborts,
                thread: Some(thread),
            },
            receiver,
        ))
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, command: WorkerCommand) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Error::Ipc("worker has been killed".to_string()))?;
        if dispatch(command, &self.aborts, queue) {
            Ok(())
        } else {
            Err(Error::Ipc("worker thread has stopped".to_string()))
        }
    }

    fn kill(&mut self) {
        // Abort whatever runs now or later, then close the queue so the loop ends.
        self.aborts.request(u64::MAX);
        self.queue = None;
        // The thread is detached: it may still be finishing a native call.
        self.thread.take();
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.kill();
    }
}
