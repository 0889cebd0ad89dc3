//! folio-worker: the execution process behind a remote execution context.
//!
//! Commands arrive as length-prefixed frames on stdin and responses leave on
//! stdout, so all logging goes to stderr.

use std::io::{self, BufWriter};
use std::sync::Arc;
use std::sync::mpsc;

use folio_core::ipc::{
    AbortRegistry, DEFAULT_MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE_ENV, ServeExit, Worker,
    WorkerCommand, dispatch, read_message, write_message,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let max_message_size = std::env::var(MAX_MESSAGE_SIZE_ENV)
        .ok()
        .and_then(|size| size.parse().ok())
        .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);

    let aborts = Arc::new(AbortRegistry::new());
    let (queue, commands) = mpsc::channel();

    // Aborts must reach the runtime while it is busy, so stdin is read on
    // its own thread and everything else is queued for the serve loop.
    {
        let aborts = Arc::clone(&aborts);
        std::thread::Builder::new()
            .name("folio-worker-stdin".to_string())
            .spawn(move || {
                let mut input = io::stdin().lock();
                loop {
                    match read_message::<_, WorkerCommand>(&mut input, max_message_size) {
                        Ok(Some(command)) => {
                            if !dispatch(command, &aborts, &queue) {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Host closed the command stream");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Failed to read command: {}", e);
                            break;
                        }
                    }
                }
                // Host is gone: stop whatever is running.
                aborts.request(u64::MAX);
            })?;
    }

    let mut output = BufWriter::new(io::stdout().lock());
    let exit = Worker::new().serve(&commands, &aborts, &mut |response| {
        write_message(&mut output, &response)
    });
    drop(output);

    tracing::debug!("Worker exiting: {:?}", exit);
    match exit {
        ServeExit::Shutdown | ServeExit::HostGone => Ok(()),
        ServeExit::Exit(code) => std::process::exit(code),
    }
}
