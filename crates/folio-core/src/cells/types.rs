//! Types for the cell store.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compile::{CompiledUnit, Diagnostic};

/// Identifier of one workbook session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a cell: owning session plus a per-cell number.
///
/// The number is never reused within a session and says nothing about
/// where the cell sits in the workbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId {
    pub session: SessionId,
    pub cell: u64,
}

impl CellId {
    pub fn new(session: SessionId, cell: u64) -> Self {
        Self { session, cell }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell_{}", self.cell)
    }
}

/// Terminal outcome of an evaluated cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellOutcome {
    Success,
    Error,
}

/// Evaluation status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Never evaluated in the current execution context.
    Unevaluated,
    /// Evaluated once, but its buffer or scope changed since.
    Stale,
    /// Currently running.
    Evaluating,
    /// Reached a terminal state.
    Evaluated(CellOutcome),
    /// Execution was cancelled.
    Aborted,
}

impl CellStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CellStatus::Evaluated(CellOutcome::Success))
    }

    pub fn is_evaluated(&self) -> bool {
        matches!(self, CellStatus::Evaluated(_))
    }
}

/// One unit of source text and its evaluation state.
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: CellId,
    pub buffer: String,
    pub previous: Option<CellId>,
    pub next: Option<CellId>,

    /// Unit produced by the last successful compile.
    pub compiled: Option<Arc<CompiledUnit>>,

    pub status: CellStatus,

    /// Bumped on every buffer change.
    pub revision: u64,

    /// Diagnostics from the last evaluation attempt.
    pub diagnostics: Vec<Diagnostic>,

    /// Execution stamp of the last successful run (0 = never).
    pub stamp: u64,

    /// Fingerprint of the earlier cells' stamps when this cell last ran.
    pub chain: u64,
}

impl Cell {
    pub(crate) fn new(id: CellId, buffer: String) -> Self {
        Self {
            id,
            buffer,
            previous: None,
            next: None,
            compiled: None,
            status: CellStatus::Unevaluated,
            revision: 0,
            diagnostics: Vec::new(),
            stamp: 0,
            chain: 0,
        }
    }

    /// Forget everything learned from evaluating this cell.
    pub(crate) fn clear_evaluation(&mut self) {
        self.compiled = None;
        self.status = CellStatus::Unevaluated;
        self.diagnostics.clear();
        self.stamp = 0;
        self.chain = 0;
    }
}
