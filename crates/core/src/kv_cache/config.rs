use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per paged block.
    pub block_size: usize,
    /// Blocks in the shared pool.
    pub num_blocks: usize,
}
