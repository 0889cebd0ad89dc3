//! Workbook session management.
//!
//! Wraps an [`EvaluationService`] and fans its results out to every
//! connected client over a broadcast channel.

use std::sync::{Arc, Mutex, PoisonError};

use folio_core::{CellId, EvaluationService, GlobalVariable, Position, WorkbookConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ServerResult;
use crate::protocol::ServerMessage;

/// Capacity for the broadcast channel.
/// Clients that fall further behind get a fresh `state` instead.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// A workbook session shared by every client of one server.
pub struct WorkbookSession {
    service: Arc<EvaluationService>,

    /// Broadcast channel for server messages.
    tx: broadcast::Sender<ServerMessage>,

    /// Task forwarding the current run's events, if any.
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WorkbookSession {
    pub fn new(service: Arc<EvaluationService>) -> (Self, broadcast::Receiver<ServerMessage>) {
        let (tx, rx) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let session = Self {
            service,
            tx,
            reader: Mutex::new(None),
        };
        (session, rx)
    }

    /// Session over a fresh, empty workbook.
    pub fn from_config(config: &WorkbookConfig) -> (Self, broadcast::Receiver<ServerMessage>) {
        Self::new(EvaluationService::from_config(config))
    }

    pub fn service(&self) -> &Arc<EvaluationService> {
        &self.service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// Send to every connected client. Having no clients is fine.
    pub fn broadcast(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn get_state(&self) -> ServerMessage {
        ServerMessage::State {
            session: self.service.session(),
            context_id: self.service.context_id(),
            state: self.service.state(),
            cells: self.service.cells(),
        }
    }

    pub fn insert_cell(
        &self,
        source: String,
        relative_to: Option<CellId>,
        before: bool,
    ) -> ServerResult<CellId> {
        let id = self.service.insert_cell(source, relative_to, before)?;
        let cell = self.service.cell(id)?;
        self.broadcast(ServerMessage::CellInserted { cell });
        Ok(id)
    }

    pub fn update_cell(&self, cell_id: CellId, source: String) -> ServerResult<()> {
        let update = self.service.update_cell(cell_id, source)?;
        self.broadcast(ServerMessage::CellUpdated {
            cell_id,
            is_complete: update.is_complete,
            diagnostics: update.diagnostics,
        });
        Ok(())
    }

    pub fn delete_cell(&self, cell_id: CellId) -> ServerResult<()> {
        self.service.delete_cell(cell_id)?;
        self.broadcast(ServerMessage::CellDeleted { cell_id });
        Ok(())
    }

    /// Start a run and forward its events, in order, from a single reader
    /// task. Returns once the run has been accepted.
    pub fn evaluate(&self, cell_id: CellId, evaluate_all: bool) -> ServerResult<()> {
        let mut stream = self.service.evaluate(cell_id, evaluate_all)?;
        let tx = self.tx.clone();

        // The service goes idle before the previous reader has necessarily
        // forwarded everything; that run's messages go out first.
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.take();
        let reader = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            while let Some(event) = stream.next_event().await {
                let _ = tx.send(ServerMessage::Evaluation { event });
            }
            let summary = stream.summary().await;
            tracing::debug!(
                "Run finished: {} cell(s), aborted={}, context_lost={}",
                summary.finished.len(),
                summary.aborted,
                summary.context_lost
            );
            let _ = tx.send(ServerMessage::RunCompleted { summary });
        });
        *slot = Some(reader);
        Ok(())
    }

    pub fn abort(&self) -> bool {
        self.service.abort()
    }

    pub async fn reset_context(&self) -> ServerResult<Uuid> {
        let context_id = self.service.reset_context().await?;
        self.broadcast(ServerMessage::ContextReset { context_id });
        Ok(context_id)
    }

    pub async fn globals(&self) -> ServerResult<Vec<GlobalVariable>> {
        Ok(self.service.globals().await?)
    }

    pub fn completions(&self, cell_id: CellId, position: Position) -> ServerResult<ServerMessage> {
        let items = self.service.completions(cell_id, position)?;
        Ok(ServerMessage::Completions { cell_id, items })
    }

    pub fn hover(&self, cell_id: CellId, position: Position) -> ServerResult<ServerMessage> {
        let hover = self.service.hover(cell_id, position)?;
        Ok(ServerMessage::Hover { cell_id, hover })
    }

    pub fn signature_help(&self, cell_id: CellId, position: Position) -> ServerResult<ServerMessage> {
        let signature = self.service.signature_help(cell_id, position)?;
        Ok(ServerMessage::SignatureHelp { cell_id, signature })
    }

    /// Wait until the current run, if any, has been fully forwarded.
    pub async fn wait_idle(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    /// Abort any run and release the execution context.
    pub async fn shutdown(&self) {
        if self.abort() {
            tracing::info!("Aborting the running evaluation for shutdown");
        }
        self.wait_idle().await;
        self.service.shutdown().await;
    }
}
