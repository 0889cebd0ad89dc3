//! Linked cell storage.

use rustc_hash::FxHashMap;

use super::types::{Cell, CellId, CellStatus, SessionId};
use crate::error::{Error, Result};

/// Ordered collection of cells for one session.
///
/// Invariants: `previous`/`next` links are mutually consistent, exactly one
/// cell has no predecessor (`head`) and exactly one has no successor (`tail`).
#[derive(Debug)]
pub struct CellStore {
    session: SessionId,
    cells: FxHashMap<CellId, Cell>,
    head: Option<CellId>,
    tail: Option<CellId>,
    next_id: u64,
}

impl CellStore {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            cells: FxHashMap::default(),
            head: None,
            tail: None,
            next_id: 1,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn head(&self) -> Option<CellId> {
        self.head
    }

    pub fn tail(&self) -> Option<CellId> {
        self.tail
    }

    /// Insert a new cell before or after `relative_to`.
    ///
    /// Without an anchor the cell goes to the head (`before`) or the tail.
    pub fn insert(
        &mut self,
        buffer: impl Into<String>,
        relative_to: Option<CellId>,
        before: bool,
    ) -> Result<CellId> {
        if let Some(anchor) = relative_to {
            self.check_session(anchor)?;
            if !self.cells.contains_key(&anchor) {
                return Err(Error::NotFound(anchor));
            }
        }

        let id = CellId::new(self.session, self.next_id);
        self.next_id += 1;

        let mut cell = Cell::new(id, buffer.into());

        let (previous, next) = match (relative_to, before) {
            (Some(anchor), true) => (self.cells[&anchor].previous, Some(anchor)),
            (Some(anchor), false) => (Some(anchor), self.cells[&anchor].next),
            (None, true) => (None, self.head),
            (None, false) => (self.tail, None),
        };
        cell.previous = previous;
        cell.next = next;

        match previous {
            Some(prev) => self.link_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.link_mut(next).previous = Some(id),
            None => self.tail = Some(id),
        }

        self.cells.insert(id, cell);
        Ok(id)
    }

    /// Remove a cell, relinking its neighbours.
    ///
    /// If the removed cell had been evaluated, every evaluated cell after it
    /// becomes stale since its compile scope changed.
    pub fn delete(&mut self, id: CellId) -> Result<Cell> {
        self.check_session(id)?;
        let cell = self.cells.remove(&id).ok_or(Error::NotFound(id))?;

        match cell.previous {
            Some(prev) => self.link_mut(prev).next = cell.next,
            None => self.head = cell.next,
        }
        match cell.next {
            Some(next) => self.link_mut(next).previous = cell.previous,
            None => self.tail = cell.previous,
        }

        if cell.status.is_evaluated() {
            let mut cursor = cell.next;
            let mut remaining = self.cells.len();
            while let Some(current) = cursor
                && remaining > 0
            {
                let later = self.link_mut(current);
                if matches!(
                    later.status,
                    CellStatus::Evaluated(_) | CellStatus::Aborted
                ) {
                    later.status = CellStatus::Stale;
                }
                cursor = later.next;
                remaining -= 1;
            }
        }

        Ok(cell)
    }

    /// Replace a cell's source text and mark it stale.
    ///
    /// Later cells are not touched here; the evaluation service detects
    /// their changed scope lazily.
    pub fn update_buffer(&mut self, id: CellId, buffer: impl Into<String>) -> Result<()> {
        let cell = self.get_mut(id)?;
        cell.buffer = buffer.into();
        cell.revision += 1;
        cell.compiled = None;
        if cell.status != CellStatus::Unevaluated {
            cell.status = CellStatus::Stale;
        }
        Ok(())
    }

    pub fn get(&self, id: CellId) -> Result<&Cell> {
        self.check_session(id)?;
        self.cells.get(&id).ok_or(Error::NotFound(id))
    }

    pub fn get_mut(&mut self, id: CellId) -> Result<&mut Cell> {
        self.check_session(id)?;
        self.cells.get_mut(&id).ok_or(Error::NotFound(id))
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// Forward traversal from the head.
    pub fn iter(&self) -> CellIter<'_> {
        CellIter {
            store: self,
            cursor: self.head,
            remaining: self.cells.len(),
        }
    }

    /// Cells in link order.
    pub fn enumerate(&self) -> Vec<&Cell> {
        self.iter().collect()
    }

    /// Cell ids in link order.
    pub fn ids(&self) -> Vec<CellId> {
        self.iter().map(|cell| cell.id).collect()
    }

    /// Zero-based position of a cell in link order.
    pub fn position(&self, id: CellId) -> Option<usize> {
        self.iter().position(|cell| cell.id == id)
    }

    /// Cells strictly before `id`, in link order.
    pub fn predecessors(&self, id: CellId) -> Result<Vec<&Cell>> {
        self.get(id)?;
        Ok(self.iter().take_while(|cell| cell.id != id).collect())
    }

    /// Mutable access to every cell, in no particular order.
    pub fn cells_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.values_mut()
    }

    fn check_session(&self, id: CellId) -> Result<()> {
        if id.session != self.session {
            return Err(Error::InvalidArgument(format!(
                "{} belongs to session {}, not {}",
                id, id.session, self.session
            )));
        }
        Ok(())
    }

    // Links always point at live cells, so a miss is a bug in this module.
    fn link_mut(&mut self, id: CellId) -> &mut Cell {
        match self.cells.get_mut(&id) {
            Some(cell) => cell,
            None => unreachable!("dangling cell link to {}", id),
        }
    }
}

/// Iterator over cells in link order.
///
/// Bounded by the number of live cells, so a corrupted link can never loop.
pub struct CellIter<'a> {
    store: &'a CellStore,
    cursor: Option<CellId>,
    remaining: usize,
}

impl<'a> Iterator for CellIter<'a> {
    type Item = &'a Cell;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let cell = self.store.cells.get(&self.cursor?)?;
        self.cursor = cell.next;
        self.remaining -= 1;
        Some(cell)
    }
}
