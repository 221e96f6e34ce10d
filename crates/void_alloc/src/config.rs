//! Allocator configuration
//!
//! Describes which strategy a subsystem should use so the choice can live in
//! a settings file instead of code. With the `serde` feature every type here
//! is (de)serialisable.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    AllocResult, Allocator, Arena, FreeList, HeapAllocator, Pool, ScratchAllocator,
    DEFAULT_ALIGNMENT,
};

/// Pool configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Number of blocks
    pub block_count: usize,
    /// Size of each block in bytes
    pub block_size: usize,
    /// Alignment of each block
    pub block_align: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_count: 256,
            block_size: 64,
            block_align: DEFAULT_ALIGNMENT,
        }
    }
}

/// Allocation strategy and its sizing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "strategy", rename_all = "snake_case"))]
pub enum StrategyConfig {
    /// Platform heap
    Heap,
    /// Bump arena of `capacity` bytes
    Arena { capacity: usize },
    /// Fixed-block pool
    Pool(PoolConfig),
    /// First-fit free list of `capacity` bytes
    FreeList { capacity: usize },
    /// Ring buffer of `capacity` bytes
    Scratch { capacity: usize },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Arena {
            capacity: 1024 * 1024, // 1 MB default
        }
    }
}

impl StrategyConfig {
    /// Build the configured allocator, taking its memory from `backing`
    pub fn build<'a>(&self, backing: &'a (dyn Allocator + Sync)) -> AllocResult<Box<dyn Allocator + Send + 'a>> {
        log::debug!("Building allocator from {:?}", self);

        let allocator: Box<dyn Allocator + Send + 'a> = match *self {
            StrategyConfig::Heap => Box::new(HeapAllocator::new()),
            StrategyConfig::Arena { capacity } => Box::new(Arena::from_allocator(backing, capacity)?),
            StrategyConfig::Pool(pool) => Box::new(Pool::with_align(
                backing,
                pool.block_count,
                pool.block_size,
                pool.block_align,
            )?),
            StrategyConfig::FreeList { capacity } => {
                Box::new(FreeList::from_allocator(backing, capacity)?)
            }
            StrategyConfig::Scratch { capacity } => {
                Box::new(ScratchAllocator::from_allocator(backing, capacity)?)
            }
        };
        Ok(allocator)
    }

    /// Bytes the strategy takes from its backing allocator up front
    pub fn reserved_bytes(&self) -> usize {
        match *self {
            StrategyConfig::Heap => 0,
            StrategyConfig::Arena { capacity }
            | StrategyConfig::FreeList { capacity }
            | StrategyConfig::Scratch { capacity } => capacity,
            StrategyConfig::Pool(pool) => {
                let stride = crate::align_up(pool.block_size.max(crate::mem::WORD), pool.block_align);
                stride * pool.block_count
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllocatorExt;

    #[test]
    fn test_build_each_strategy() {
        let heap = HeapAllocator::new();

        let configs = [
            StrategyConfig::Heap,
            StrategyConfig::default(),
            StrategyConfig::Pool(PoolConfig::default()),
            StrategyConfig::FreeList { capacity: 4096 },
            StrategyConfig::Scratch { capacity: 4096 },
        ];

        for config in configs {
            let alloc = config.build(&heap).unwrap();
            let ptr = alloc.alloc(64).unwrap();
            unsafe { alloc.free(ptr, 64).unwrap() };
        }

        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_reserved_bytes() {
        let pool = StrategyConfig::Pool(PoolConfig {
            block_count: 4,
            block_size: 20,
            block_align: 8,
        });
        assert_eq!(pool.reserved_bytes(), 96);
        assert_eq!(StrategyConfig::Heap.reserved_bytes(), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_json() {
        let config: StrategyConfig =
            serde_json::from_str(r#"{ "strategy": "free_list", "capacity": 65536 }"#).unwrap();
        assert_eq!(config, StrategyConfig::FreeList { capacity: 65536 });

        let pool: StrategyConfig =
            serde_json::from_str(r#"{ "strategy": "pool", "block_count": 8 }"#).unwrap();
        assert_eq!(
            pool,
            StrategyConfig::Pool(PoolConfig {
                block_count: 8,
                ..PoolConfig::default()
            })
        );
    }
}
