use super::error::CacheError;

pub type BlockId = usize;

/// Fixed-size pool of paged-attention blocks shared by every slot.
///
/// Pure bookkeeping: it hands out block ids and takes them back, it never
/// touches device memory.
#[derive(Debug)]
pub struct BlockPool {
    in_use: Vec<bool>,
    // Stack of free ids; low ids sit on top so fresh pools hand out 0, 1, 2...
    free: Vec<BlockId>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            in_use: vec![false; num_blocks],
            free: (0..num_blocks).rev().collect(),
        }
    }

    /// Take `n` blocks out of the pool, or none at all if fewer than `n` are free.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CacheError> {
        let available = self.free.len();
        if n > available {
            return Err(CacheError::OutOfBlocks {
                requested: n,
                available,
            });
        }
        let granted = self.free.split_off(available - n);
        for &id in &granted {
            self.in_use[id] = true;
        }
        // split_off keeps stack order; reverse so callers see ascending ids.
        Ok(granted.into_iter().rev().collect())
    }

    /// Return blocks to the pool. Validates the whole batch before releasing any.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        let mut seen = Vec::with_capacity(blocks.len());
        for &id in blocks {
            let owned = self.in_use.get(id).copied().unwrap_or(false);
            if !owned || seen.contains(&id) {
                return Err(CacheError::BlockNotAllocated { block_id: id });
            }
            seen.push(id);
        }
        for &id in blocks {
            self.in_use[id] = false;
            self.free.push(id);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_total(&self) -> usize {
        self.in_use.len()
    }

    pub fn num_used(&self) -> usize {
        self.num_total() - self.num_free()
    }
}
