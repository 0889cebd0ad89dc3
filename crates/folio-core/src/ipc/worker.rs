//! Worker process management.
//!
//! [`ProcessTransport`] spawns `folio-worker` and speaks the protocol over
//! its stdin/stdout. A dedicated thread reads response frames so the host
//! can await them without blocking the runtime.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};
use super::transport::Transport;
use crate::config::WORKER_PATH_ENV;
use crate::error::{Error, Result};

/// Environment variable the host uses to pass its frame limit to a worker.
pub const MAX_MESSAGE_SIZE_ENV: &str = "FOLIO_MAX_MESSAGE_SIZE";

const WORKER_NAME: &str = if cfg!(windows) {
    "folio-worker.exe"
} else {
    "folio-worker"
};

pub struct ProcessTransport {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    killed: bool,
}

impl ProcessTransport {
    /// Spawn a worker process. `explicit` takes precedence over discovery.
    pub fn spawn(
        explicit: Option<&Path>,
        max_message_size: usize,
    ) -> Result<(Self, UnboundedReceiver<WorkerResponse>)> {
        let worker_path = find_worker_binary(explicit)?;

        let mut child = Command::new(&worker_path)
            .env(MAX_MESSAGE_SIZE_ENV, max_message_size.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to stderr
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let (responses, receiver) = unbounded_channel();
        let pid = child.id();
        std::thread::Builder::new()
            .name(format!("folio-worker-{}-reader", pid))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    match read_message::<_, WorkerResponse>(&mut stdout, max_message_size) {
                        Ok(Some(response)) => {
                            if responses.send(response).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Worker {} closed its output", pid);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Dropping worker {} stream: {}", pid, e);
                            break;
                        }
                    }
                }
            })?;

        tracing::info!("Spawned worker {} ({})", pid, worker_path.display());
        Ok((
            Self {
                child,
                stdin: BufWriter::new(stdin),
                killed: false,
            },
            receiver,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Transport for ProcessTransport {
    fn send(&mut self, command: WorkerCommand) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, &command)
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        #[cfg(unix)]
        {
            // SIGKILL for immediate termination
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.kill() {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }

        // Wait to reap zombie
        let _ = self.child.wait();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Locate the worker binary.
///
/// Search order: `explicit`, the `FOLIO_WORKER_PATH` environment variable,
/// next to the current executable (and its parent, for test binaries in
/// `target/*/deps`), the system `PATH`, then the workspace `target` dir.
pub fn find_worker_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Ipc(format!(
            "Configured worker binary {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let candidate = dir.join(WORKER_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_NAME);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Ipc(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_NAME, WORKER_PATH_ENV
    )))
}
