//! Host side of an execution context.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use uuid::Uuid;

use super::context::{AbortHandle, ContextError, EventSink, ExecutionContext};
use super::types::{
    ExecutionEvent, ExecutionOutcome, GlobalVariable, ModuleHandle, PackageImage,
};
use crate::config::{Isolation, WorkbookConfig};
use crate::ipc::{LocalTransport, ProcessTransport, Transport, WorkerCommand, WorkerResponse};

/// How long a fresh worker gets to answer its first ping.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for the worker to acknowledge.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Execution context driving a worker over a [`Transport`].
///
/// Once the worker is lost every request fails with
/// [`ContextError::ContextLost`]; the context is never revived.
pub struct RemoteContext {
    id: Uuid,
    transport: Box<dyn Transport>,
    responses: UnboundedReceiver<WorkerResponse>,
    abort_grace: Duration,
    next_run: u64,
    lost: Option<String>,
}

enum Wake {
    Response(Option<WorkerResponse>),
    AbortRequested,
    GraceExpired,
}

impl RemoteContext {
    pub fn new(
        transport: Box<dyn Transport>,
        responses: UnboundedReceiver<WorkerResponse>,
        abort_grace: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            responses,
            abort_grace,
            next_run: 1,
            lost: None,
        }
    }

    /// Start a context with the isolation `config` asks for and check that
    /// it answers.
    pub async fn start(config: &WorkbookConfig) -> Result<Self, ContextError> {
        let (transport, responses): (Box<dyn Transport>, _) = match config.isolation {
            Isolation::Process => {
                let (transport, responses) =
                    ProcessTransport::spawn(config.worker_path.as_deref(), config.max_message_size)
                        .map_err(|e| ContextError::ContextLost(e.to_string()))?;
                (Box::new(transport), responses)
            }
            Isolation::InProcess => {
                let (transport, responses) = LocalTransport::spawn()
                    .map_err(|e| ContextError::ContextLost(e.to_string()))?;
                (Box::new(transport), responses)
            }
        };

        let mut context = Self::new(transport, responses, config.abort_grace);
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, context.request(WorkerCommand::Ping)).await {
            Ok(Ok(WorkerResponse::Pong)) => {
                tracing::info!("Execution context {} ready ({:?})", context.id, config.isolation);
                Ok(context)
            }
            Ok(Ok(other)) => Err(context.lose(format!("unexpected handshake response {:?}", other))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(context.lose("worker did not answer the handshake".to_string())),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    /// Mark the context lost and make sure the worker is gone.
    fn lose(&mut self, reason: String) -> ContextError {
        if self.lost.is_none() {
            tracing::error!("Execution context {} lost: {}", self.id, reason);
            self.transport.kill();
            self.lost = Some(reason.clone());
        }
        ContextError::ContextLost(reason)
    }

    fn send(&mut self, command: WorkerCommand) -> Result<(), ContextError> {
        if let Some(reason) = &self.lost {
            return Err(ContextError::ContextLost(reason.clone()));
        }
        match self.transport.send(command) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lose(e.to_string())),
        }
    }

    async fn next_response(&mut self) -> Result<WorkerResponse, ContextError> {
        match self.responses.recv().await {
            Some(response) => Ok(response),
            None => Err(self.lose("worker terminated".to_string())),
        }
    }

    async fn request(&mut self, command: WorkerCommand) -> Result<WorkerResponse, ContextError> {
        self.send(command)?;
        self.next_response().await
    }

    fn unexpected(response: WorkerResponse) -> ContextError {
        match response {
            WorkerResponse::Error { message } => ContextError::Protocol(message),
            other => ContextError::Protocol(format!("unexpected worker response {:?}", other)),
        }
    }

    async fn run(
        &mut self,
        handle: ModuleHandle,
        abort: &AbortHandle,
        events: &mut EventSink<'_>,
    ) -> Result<ExecutionOutcome, ContextError> {
        let run = self.next_run;
        self.next_run += 1;
        self.send(WorkerCommand::Execute { handle, run })?;

        let mut deadline: Option<Instant> = None;
        loop {
            let wake = tokio::select! {
                biased;
                _ = abort.aborted(), if deadline.is_none() => Wake::AbortRequested,
                response = self.responses.recv() => Wake::Response(response),
                _ = grace_elapsed(deadline) => Wake::GraceExpired,
            };

            let response = match wake {
                Wake::AbortRequested => {
                    tracing::debug!("Aborting run {} on context {}", run, self.id);
                    self.send(WorkerCommand::Abort { run })?;
                    deadline = Some(Instant::now() + self.abort_grace);
                    continue;
                }
                Wake::GraceExpired => {
                    tracing::warn!(
                        "Worker ignored abort of run {} for {:?}; killing it",
                        run,
                        self.abort_grace
                    );
                    return Err(self.lose("worker killed after ignoring abort".to_string()));
                }
                Wake::Response(Some(response)) => response,
                Wake::Response(None) => return Err(self.lose("worker terminated".to_string())),
            };

            let aborting = deadline.is_some();
            match response {
                WorkerResponse::Output { stream, text } => {
                    if !aborting {
                        events(ExecutionEvent::Output { stream, text });
                    }
                }
                WorkerResponse::Value { value } => {
                    if !aborting {
                        events(ExecutionEvent::Value(value));
                    }
                }
                // Finishing after the abort was sent still counts as aborted.
                WorkerResponse::Completed if aborting => return Ok(ExecutionOutcome::Aborted),
                WorkerResponse::Faulted { .. } if aborting => {
                    return Ok(ExecutionOutcome::Aborted);
                }
                WorkerResponse::Completed => return Ok(ExecutionOutcome::Completed),
                WorkerResponse::Faulted { fault } => return Ok(ExecutionOutcome::Faulted(fault)),
                WorkerResponse::Aborted => return Ok(ExecutionOutcome::Aborted),
                other => return Err(Self::unexpected(other)),
            }
        }
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ExecutionContext for RemoteContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn load_module<'a>(
        &'a mut self,
        module: &'a [u8],
        packages: Vec<PackageImage>,
    ) -> BoxFuture<'a, Result<ModuleHandle, ContextError>> {
        Box::pin(async move {
            let command = WorkerCommand::LoadModule {
                module: module.to_vec(),
                packages,
            };
            match self.request(command).await? {
                WorkerResponse::Loaded { handle } => Ok(handle),
                WorkerResponse::LoadFailed { reason } => Err(ContextError::LoadFailure(reason)),
                other => Err(Self::unexpected(other)),
            }
        })
    }

    fn execute<'a>(
        &'a mut self,
        handle: ModuleHandle,
        abort: &'a AbortHandle,
        events: &'a mut EventSink<'_>,
    ) -> BoxFuture<'a, Result<ExecutionOutcome, ContextError>> {
        Box::pin(self.run(handle, abort, events))
    }

    fn reset_state(&mut self) -> BoxFuture<'_, Result<(), ContextError>> {
        Box::pin(async move {
            match self.request(WorkerCommand::ResetState).await? {
                WorkerResponse::StateReset => Ok(()),
                other => Err(Self::unexpected(other)),
            }
        })
    }

    fn globals(&mut self) -> BoxFuture<'_, Result<Vec<GlobalVariable>, ContextError>> {
        Box::pin(async move {
            match self.request(WorkerCommand::Globals).await? {
                WorkerResponse::Globals { variables } => Ok(variables),
                other => Err(Self::unexpected(other)),
            }
        })
    }

    fn shutdown(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.lost.is_some() {
                return;
            }
            if self.send(WorkerCommand::Shutdown).is_ok() {
                let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.responses.recv()).await;
            }
            self.transport.kill();
            self.lost = Some("context shut down".to_string());
            tracing::info!("Execution context {} shut down", self.id);
        })
    }
}
