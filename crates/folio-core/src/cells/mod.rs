//! Cell store for workbook sessions.
//!
//! Cells form an explicitly linked list: ordering comes from the
//! `previous`/`next` links, never from the identifiers.

mod store;
mod types;

pub use store::CellStore;
pub use types::{Cell, CellId, CellOutcome, CellStatus, SessionId};
