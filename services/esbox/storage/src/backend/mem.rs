//! In-memory stream database for development and testing

use crate::{StorageError, StreamDatabase};
use dashmap::DashMap;
use esbox_wire::{TelemetryCell, FIFO_COUNT};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Default number of cells retained
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct CellLog {
    /// (sequence number, cell), oldest first
    cells: VecDeque<(u64, TelemetryCell)>,
    next_seq: u64,
}

/// Bounded cell log read through four independent FIFO cursors.
///
/// Every FIFO sees every cell; each keeps its own read position. When the log
/// is full the oldest cell is evicted, and a cursor pointing at it moves on to
/// the next surviving cell.
#[derive(Debug)]
pub struct MemoryStreamDb {
    capacity: usize,
    log: Mutex<CellLog>,
    /// FIFO index -> next sequence number to read
    cursors: DashMap<u8, u64>,
}

impl MemoryStreamDb {
    /// Create a database holding at most `capacity` cells
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            log: Mutex::new(CellLog::default()),
            cursors: DashMap::new(),
        }
    }

    /// Maximum number of retained cells
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained cells
    pub fn len(&self) -> usize {
        self.lock().cells.len()
    }

    /// Whether the log holds no cells
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CellLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a cell, evicting the oldest if the log is full
    pub fn push(&self, cell: TelemetryCell) {
        let mut log = self.lock();
        if log.cells.len() == self.capacity {
            if let Some((seq, _)) = log.cells.pop_front() {
                debug!("Stream log full, evicted cell seq={}", seq);
            }
        }
        let seq = log.next_seq;
        log.next_seq += 1;
        log.cells.push_back((seq, cell));
    }

    /// Append cells in order
    pub fn extend(&self, cells: impl IntoIterator<Item = TelemetryCell>) {
        for cell in cells {
            self.push(cell);
        }
    }

    /// Cells not yet read through a FIFO
    pub fn pending(&self, fifo: u8) -> Result<usize, StorageError> {
        let cursor = self.cursor(fifo)?;
        Ok(self.lock().cells.iter().filter(|(seq, _)| *seq >= cursor).count())
    }

    fn cursor(&self, fifo: u8) -> Result<u64, StorageError> {
        if fifo >= FIFO_COUNT {
            return Err(StorageError::InvalidFifo(fifo));
        }
        Ok(self.cursors.get(&fifo).map(|c| *c).unwrap_or(0))
    }
}

impl Default for MemoryStreamDb {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl StreamDatabase for MemoryStreamDb {
    fn get_telemetry_batch(&self, fifo: u8, max_cells: usize) -> Result<Vec<TelemetryCell>, StorageError> {
        let cursor = self.cursor(fifo)?;
        let log = self.lock();

        let batch: Vec<(u64, TelemetryCell)> = log
            .cells
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .take(max_cells)
            .cloned()
            .collect();

        if let Some((last, _)) = batch.last() {
            self.cursors.insert(fifo, last + 1);
        }
        debug!(
            "Telemetry batch fifo={} requested={} returned={}",
            fifo,
            max_cells,
            batch.len()
        );

        Ok(batch.into_iter().map(|(_, cell)| cell).collect())
    }

    fn latest_readings(&self) -> Result<Value, StorageError> {
        let log = self.lock();
        let mut latest: Vec<&TelemetryCell> = Vec::new();
        for (_, cell) in log.cells.iter() {
            let slot = latest.iter_mut().find(|c| {
                c.device == cell.device && c.endpoint == cell.endpoint && c.cluster == cell.cluster
            });
            match slot {
                Some(existing) => *existing = cell,
                None => latest.push(cell),
            }
        }
        Ok(serde_json::to_value(latest)?)
    }
}
