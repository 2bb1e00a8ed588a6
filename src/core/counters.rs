//! Purpose: Provide the 64-bit position counters shared between roles.
//! Exports: `CountersManager`, `CounterId`, `Position`, `ReadablePosition`.
//! Role: Allocation-recycling arena; handles carry the ordering contract.
//! Invariants: Cells are cache-line padded; ids are recycled only after `free`.
//! Invariants: Writers publish with release stores; observers read with acquire.
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterId(pub i32);

#[repr(align(64))]
#[derive(Debug)]
struct CounterCell {
    value: AtomicI64,
}

#[derive(Debug)]
struct CounterArena {
    cells: Box<[CounterCell]>,
    in_use: Mutex<Vec<bool>>,
}

#[derive(Clone, Debug)]
pub struct CountersManager {
    arena: Arc<CounterArena>,
}

impl CountersManager {
    pub fn new(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| CounterCell {
                value: AtomicI64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            arena: Arc::new(CounterArena {
                cells,
                in_use: Mutex::new(vec![false; capacity]),
            }),
        }
    }

    pub fn allocate(&self) -> Result<Position, Error> {
        let mut in_use = self
            .arena
            .in_use
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("counter arena poisoned"))?;
        let slot = in_use.iter().position(|used| !used).ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("counter arena exhausted")
        })?;
        in_use[slot] = true;
        let cell = &self.arena.cells[slot].value;
        cell.store(0, Ordering::Release);
        Ok(Position {
            arena: Arc::clone(&self.arena),
            id: CounterId(slot as i32),
        })
    }

    pub fn free(&self, id: CounterId) -> Result<(), Error> {
        let mut in_use = self
            .arena
            .in_use
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("counter arena poisoned"))?;
        let slot = id.0 as usize;
        if slot >= in_use.len() || !in_use[slot] {
            return Err(Error::new(ErrorKind::NotFound).with_message("counter not allocated"));
        }
        in_use[slot] = false;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.arena.cells.len()
    }
}

/// Writer handle for a counter cell.
#[derive(Clone, Debug)]
pub struct Position {
    arena: Arc<CounterArena>,
    id: CounterId,
}

impl Position {
    pub fn id(&self) -> CounterId {
        self.id
    }

    fn cell(&self) -> &AtomicI64 {
        &self.arena.cells[self.id.0 as usize].value
    }

    pub fn get_plain(&self) -> i64 {
        self.cell().load(Ordering::Relaxed)
    }

    pub fn set_release(&self, value: i64) {
        self.cell().store(value, Ordering::Release)
    }

    pub fn get_and_add(&self, delta: i64) -> i64 {
        self.cell().fetch_add(delta, Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.get_and_add(1);
    }

    pub fn reader(&self) -> ReadablePosition {
        ReadablePosition {
            arena: Arc::clone(&self.arena),
            id: self.id,
        }
    }
}

/// Observer handle for a counter cell.
#[derive(Clone, Debug)]
pub struct ReadablePosition {
    arena: Arc<CounterArena>,
    id: CounterId,
}

impl ReadablePosition {
    pub fn id(&self) -> CounterId {
        self.id
    }

    pub fn get_acquire(&self) -> i64 {
        self.arena.cells[self.id.0 as usize]
            .value
            .load(Ordering::Acquire)
    }
}
