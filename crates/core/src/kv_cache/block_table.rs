use super::block_pool::BlockId;

/// Blocks held by one decode row, in logical order.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size: block_size.max(1),
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Extra blocks required before `new_tokens` more tokens can be stored.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        (self.num_tokens + new_tokens)
            .div_ceil(self.block_size)
            .saturating_sub(self.blocks.len())
    }

    /// Record freshly allocated blocks and the tokens they now hold.
    pub fn extend(&mut self, block_ids: &[BlockId], new_tokens: usize) {
        self.blocks.extend_from_slice(block_ids);
        self.num_tokens += new_tokens;
        debug_assert!(self.num_tokens <= self.blocks.len() * self.block_size);
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Drop every block, handing the ids back for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens = 0;
        std::mem::take(&mut self.blocks)
    }
}
