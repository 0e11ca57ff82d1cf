//! Slot-scoped paged cache bookkeeping.
//!
//! Executors that page their key/value cache hold blocks per decode row.
//! [`SlotBlocks`] keeps one lock per slot, so an `insert` into slot *i*
//! and a `generate` step touching slot *j* never contend on the same
//! guard. Only the shared [`BlockPool`] is serialized, and only for the
//! duration of a single allocate/free.

pub mod block_pool;
pub mod block_table;
pub mod config;
pub mod error;

pub use block_pool::{BlockId, BlockPool};
pub use block_table::BlockTable;
pub use config::CacheConfig;
pub use error::CacheError;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-slot block tables plus the pool they draw from.
pub struct SlotBlocks {
    pool: Mutex<BlockPool>,
    slots: Vec<Mutex<Vec<BlockTable>>>,
}

impl SlotBlocks {
    /// One lock per slot, `samples_per_slot` block tables behind each lock.
    pub fn new(config: CacheConfig, num_slots: usize, samples_per_slot: usize) -> Self {
        let slots = (0..num_slots)
            .map(|_| {
                Mutex::new(
                    (0..samples_per_slot)
                        .map(|_| BlockTable::new(config.block_size))
                        .collect(),
                )
            })
            .collect();
        Self {
            pool: Mutex::new(BlockPool::new(config.num_blocks)),
            slots,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Exclusive access to the rows of one slot.
    pub fn lock_slot(&self, slot: usize) -> Result<SlotGuard<'_>, CacheError> {
        let tables = self
            .slots
            .get(slot)
            .ok_or(CacheError::UnknownSlot {
                slot,
                num_slots: self.slots.len(),
            })?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(SlotGuard {
            pool: &self.pool,
            tables,
        })
    }

    /// Return every block held by `slot` to the pool. Returns how many were freed.
    pub fn free_slot(&self, slot: usize) -> Result<usize, CacheError> {
        self.lock_slot(slot)?.release_all()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool().num_free()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.pool().num_used()
    }

    fn pool(&self) -> MutexGuard<'_, BlockPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held while a slot's rows are being mutated.
pub struct SlotGuard<'a> {
    pool: &'a Mutex<BlockPool>,
    tables: MutexGuard<'a, Vec<BlockTable>>,
}

impl SlotGuard<'_> {
    pub fn num_rows(&self) -> usize {
        self.tables.len()
    }

    /// Whether `row` currently owns any blocks.
    pub fn is_live(&self, row: usize) -> bool {
        self.tables.get(row).is_some_and(|t| !t.is_empty())
    }

    pub fn table(&self, row: usize) -> Option<&BlockTable> {
        self.tables.get(row)
    }

    /// Grow `row` so it can hold `new_tokens` more tokens.
    pub fn reserve(&mut self, row: usize, new_tokens: usize) -> Result<(), CacheError> {
        let num_rows = self.tables.len();
        let table = self
            .tables
            .get_mut(row)
            .ok_or(CacheError::UnknownSlot {
                slot: row,
                num_slots: num_rows,
            })?;
        let needed = table.blocks_needed(new_tokens);
        let granted = if needed > 0 {
            self.pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .allocate(needed)?
        } else {
            Vec::new()
        };
        table.extend(&granted, new_tokens);
        Ok(())
    }

    /// Release all rows of this slot back to the pool.
    pub fn release_all(&mut self) -> Result<usize, CacheError> {
        let released: Vec<BlockId> = self.tables.iter_mut().flat_map(|t| t.release()).collect();
        if !released.is_empty() {
            self.pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free(&released)?;
        }
        Ok(released.len())
    }
}
