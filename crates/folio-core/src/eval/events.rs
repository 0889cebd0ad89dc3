//! Evaluation event protocol.
//!
//! Every evaluated cell produces `started`, then any number of
//! `captured_output`, at most one `result`, and exactly one `finished`.
//! Cells of one run never interleave.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::cells::CellId;
use crate::compile::Diagnostic;
use crate::execute::{Fault, OutputStream, Representation};

/// Terminal status carried by `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Success,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EvaluationEvent {
    Started {
        cell: CellId,
    },
    CapturedOutput {
        cell: CellId,
        stream: OutputStream,
        text: String,
    },
    Result {
        cell: CellId,
        value: Representation,
    },
    Finished {
        cell: CellId,
        status: EvaluationStatus,
        diagnostics: Vec<Diagnostic>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fault: Option<Fault>,
        /// The run's target succeeded and is the last cell: a good moment for
        /// the editor to open a new one.
        #[serde(default)]
        start_new_cell: bool,
        duration_ms: u64,
    },
}

impl EvaluationEvent {
    pub fn cell(&self) -> CellId {
        match self {
            EvaluationEvent::Started { cell }
            | EvaluationEvent::CapturedOutput { cell, .. }
            | EvaluationEvent::Result { cell, .. }
            | EvaluationEvent::Finished { cell, .. } => *cell,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluationEvent::Finished { .. })
    }
}

/// How a run ended, delivered after its last event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Terminal status of every cell that started, in order.
    pub finished: Vec<(CellId, EvaluationStatus)>,
    pub aborted: bool,
    /// The execution context died; every cell reverted to unevaluated.
    pub context_lost: bool,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        !self.aborted
            && !self.context_lost
            && self
                .finished
                .iter()
                .all(|(_, status)| *status == EvaluationStatus::Success)
    }
}

/// Ordered events of one evaluation run.
///
/// Implements [`Stream`]; the stream ends when the run is over, after which
/// [`EventStream::summary`] yields the [`RunSummary`].
#[derive(Debug)]
pub struct EventStream {
    events: mpsc::UnboundedReceiver<EvaluationEvent>,
    summary: oneshot::Receiver<RunSummary>,
}

impl EventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<EvaluationEvent>,
        summary: oneshot::Receiver<RunSummary>,
    ) -> Self {
        Self { events, summary }
    }

    pub async fn next_event(&mut self) -> Option<EvaluationEvent> {
        self.events.recv().await
    }

    /// Wait for the run to end, discarding events not yet read.
    pub async fn summary(mut self) -> RunSummary {
        while self.events.recv().await.is_some() {}
        self.summary.await.unwrap_or_default()
    }

    /// Every remaining event plus the summary.
    pub async fn collect(mut self) -> (Vec<EvaluationEvent>, RunSummary) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let summary = self.summary.await.unwrap_or_default();
        (events, summary)
    }
}

impl Stream for EventStream {
    type Item = EvaluationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
