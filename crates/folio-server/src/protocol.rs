//! WebSocket protocol messages for the folio server.
//!
//! Defines the message types exchanged between client and server. Both
//! directions are JSON objects tagged by a snake_case `type` field.

use folio_core::{
    CellId, CellSnapshot, CompletionItem, Diagnostic, EvaluationEvent, GlobalVariable, Hover,
    Position, RunSummary, SessionId, SessionState, SignatureHelp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the full workbook state.
    GetState,

    /// Insert a new cell.
    InsertCell {
        /// Initial buffer.
        #[serde(default)]
        source: String,
        /// Anchor cell. None = head or tail, depending on `before`.
        #[serde(default)]
        relative_to: Option<CellId>,
        #[serde(default)]
        before: bool,
    },

    /// Replace a cell's buffer.
    UpdateCell { cell_id: CellId, source: String },

    DeleteCell { cell_id: CellId },

    /// Evaluate a cell, optionally with every earlier cell that is not
    /// up to date.
    Evaluate {
        cell_id: CellId,
        #[serde(default)]
        evaluate_all: bool,
    },

    /// Cancel the current run.
    Abort,

    /// Replace the execution context with a fresh one.
    ResetContext,

    /// List live top-level variables.
    GetGlobals,

    /// Completion candidates at a 1-based position in a cell.
    Completions { cell_id: CellId, position: Position },

    Hover { cell_id: CellId, position: Position },

    SignatureHelp { cell_id: CellId, position: Position },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full workbook state (sent on connection or on request).
    State {
        session: SessionId,
        context_id: Option<Uuid>,
        state: SessionState,
        /// Cells in link order.
        cells: Vec<CellSnapshot>,
    },

    CellInserted { cell: CellSnapshot },

    /// A buffer changed; carries the compiler's view of the new text.
    CellUpdated {
        cell_id: CellId,
        is_complete: bool,
        diagnostics: Vec<Diagnostic>,
    },

    CellDeleted { cell_id: CellId },

    /// One event of the running evaluation.
    Evaluation { event: EvaluationEvent },

    /// The run is over; every `evaluation` message of it was sent before.
    RunCompleted { summary: RunSummary },

    ContextReset { context_id: Uuid },

    Globals { variables: Vec<GlobalVariable> },

    Completions {
        cell_id: CellId,
        items: Vec<CompletionItem>,
    },

    /// None when nothing is known about the position.
    Hover {
        cell_id: CellId,
        hover: Option<Hover>,
    },

    SignatureHelp {
        cell_id: CellId,
        signature: Option<SignatureHelp>,
    },

    /// A request failed. Sent only to the client that made it.
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"insert_cell"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::InsertCell {
                source: String::new(),
                relative_to: None,
                before: false,
            }
        );
    }

    #[test]
    fn test_assist_request_shape() {
        let msg: ClientMessage = serde_json::from_value(serde_json::json!({
            "type": "signature_help",
            "cell_id": {"session": uuid::Uuid::nil(), "cell": 3},
            "position": {"line": 2, "column": 7},
        }))
        .unwrap();
        let ClientMessage::SignatureHelp { position, .. } = msg else {
            panic!("Expected signature_help, got {:?}", msg);
        };
        assert_eq!(position, Position::new(2, 7));
    }

    #[test]
    fn test_error_message_shape() {
        let json = serde_json::to_value(ServerMessage::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "message": "boom"}));
    }
}
